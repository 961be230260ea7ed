//! Chat registry: map `videoId -> room of subscribers and bounded history`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

const MAX_HISTORY: usize = 100;
const JOIN_REPLAY: usize = 50;

/// Anything that can receive a broadcast frame. Implemented by the
/// Gateway's per-connection websocket sink; a failed send removes the
/// subscriber from the room.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send(&self, message: &Value) -> std::result::Result<(), ()>;
    /// Stable identity used to exclude the sender from its own broadcast
    /// and to find/remove a subscriber on leave or failed send.
    fn id(&self) -> u64;
}

struct Room {
    messages: VecDeque<Value>,
    subscribers: Vec<std::sync::Arc<dyn ChatSink>>,
}

impl Room {
    fn new() -> Self {
        Room { messages: VecDeque::new(), subscribers: Vec::new() }
    }

    fn push_message(&mut self, message: Value) {
        self.messages.push_back(message);
        while self.messages.len() > MAX_HISTORY {
            self.messages.pop_front();
        }
    }

    fn recent(&self, limit: usize) -> Vec<Value> {
        let start = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(start).cloned().collect()
    }
}

/// Owns every [`Room`], keyed by opaque `videoId`. Created lazily on first reference.
#[derive(Clone)]
pub struct ChatRegistry {
    rooms: std::sync::Arc<Mutex<HashMap<String, Room>>>,
}

impl ChatRegistry {
    pub fn new() -> Self {
        ChatRegistry { rooms: std::sync::Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Adds `sink` to the room and returns up to the last 50 messages.
    pub fn join(&self, video_id: &str, sink: std::sync::Arc<dyn ChatSink>) -> Result<Vec<Value>> {
        if video_id.is_empty() {
            return Err(Error::User("No video ID provided".into()));
        }
        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms.entry(video_id.to_string()).or_insert_with(Room::new);
        room.subscribers.push(sink);
        Ok(room.recent(JOIN_REPLAY))
    }

    pub fn leave(&self, video_id: &str, sink_id: u64) -> Result<()> {
        if video_id.is_empty() {
            return Err(Error::User("No video ID provided".into()));
        }
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(video_id) {
            room.subscribers.retain(|s| s.id() != sink_id);
        }
        Ok(())
    }

    /// Appends `message` to history and fans it out to every subscriber but
    /// the sender; a failed send removes that subscriber. The room lock is
    /// not held during the fan-out itself, only to snapshot subscribers and
    /// later to prune failures.
    pub async fn post(&self, video_id: &str, message: Value, sender_id: u64) -> Result<()> {
        if video_id.is_empty() {
            return Err(Error::User("No video ID provided".into()));
        }

        let subscribers = {
            let mut rooms = self.rooms.lock().unwrap();
            let room = rooms.entry(video_id.to_string()).or_insert_with(Room::new);
            room.push_message(message.clone());
            room.subscribers.clone()
        };

        let mut broadcast = message;
        if let Value::Object(map) = &mut broadcast {
            map.insert("broadcast".to_string(), Value::Bool(true));
        }

        let mut failed = Vec::new();
        for sink in &subscribers {
            if sink.id() == sender_id {
                continue;
            }
            if sink.send(&broadcast).await.is_err() {
                failed.push(sink.id());
            }
        }

        if !failed.is_empty() {
            let mut rooms = self.rooms.lock().unwrap();
            if let Some(room) = rooms.get_mut(video_id) {
                room.subscribers.retain(|s| !failed.contains(&s.id()));
            }
        }

        Ok(())
    }
}

impl Default for ChatRegistry {
    fn default() -> Self {
        Self::new()
    }
}
