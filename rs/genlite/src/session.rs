//! A single connection's routing: four independent worker tasks (chat,
//! video, search, simulation) plus inline handling for trivial actions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chat::ChatRegistry;
use crate::endpoint::EndpointPool;
use crate::frame::{classify, failure, success, Frame};
use crate::llm::{self, LlmClient};
use crate::metrics::Class;
use crate::role::{Field, Orientation, Role, RoleConfig};
use crate::video::{GenerationRequest, VideoWorker};

const VIDEO_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ENDPOINT_LEASE_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const DEFAULT_NEGATIVE_PROMPT: &str = "low quality, worst quality, deformed, distorted, disfigured, blurry, text, watermark";
const POSITIVE_PROMPT_SUFFIX: &str = "high quality, cinematic, 4K, intricate details";

/// The channel a worker uses to deliver a reply back to the connection.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, reply: Value) -> std::result::Result<(), ()>;
}

/// Everything a [`Session`]'s workers need, shared across every session in the process.
pub struct SharedApi {
    pub endpoints: EndpointPool,
    pub video_worker: VideoWorker,
    pub chat: ChatRegistry,
    pub roles: RoleConfig,
    pub llm: Arc<dyn LlmClient>,
}

fn role_video_cap(role: Role, endpoint_count: usize) -> usize {
    let role_cap = match role {
        Role::Anon => 2,
        Role::Normal => 4,
        Role::Pro | Role::Admin => endpoint_count.max(1),
    };
    role_cap.min(endpoint_count.max(1))
}

/// Owns the four request queues for one connection and the tasks draining them.
pub struct Session {
    user_id: Uuid,
    role: Role,
    chat_tx: mpsc::UnboundedSender<Frame>,
    video_tx: mpsc::UnboundedSender<Frame>,
    search_tx: mpsc::UnboundedSender<Frame>,
    simulation_tx: mpsc::UnboundedSender<Frame>,
    workers: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn start(user_id: Uuid, role: Role, api: Arc<SharedApi>, sink: Arc<dyn ReplySink>) -> Session {
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        let (video_tx, video_rx) = mpsc::unbounded_channel();
        let (search_tx, search_rx) = mpsc::unbounded_channel();
        let (simulation_tx, simulation_rx) = mpsc::unbounded_channel();

        let chat_task = tokio::spawn(run_chat_worker(chat_rx, api.clone(), sink.clone(), user_id));
        let video_task = tokio::spawn(run_video_worker(video_rx, api.clone(), sink.clone(), user_id, role));
        let search_task = tokio::spawn(run_search_worker(search_rx, api.clone(), sink.clone()));
        let simulation_task = tokio::spawn(run_simulation_worker(simulation_rx, api, sink));

        Session {
            user_id,
            role,
            chat_tx,
            video_tx,
            search_tx,
            simulation_tx,
            workers: vec![chat_task, video_task, search_task, simulation_task],
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Route a parsed frame to its queue, or handle it inline if it's trivial.
    /// Returns `Ok(None)` once queued; `Ok(Some(reply))` for inline replies.
    ///
    /// Thumbnail actions share `generate_video`'s rate-limit class (they hit
    /// the same GPU workers) but are trivial enough to answer inline rather
    /// than through the bounded-concurrency video queue.
    pub async fn dispatch(&self, frame: Frame, api: &SharedApi) -> Option<Value> {
        if is_inline(&frame.action) {
            return Some(handle_inline(frame, api, self.role).await);
        }

        match classify(&frame.action) {
            Class::Chat => {
                let _ = self.chat_tx.send(frame);
                None
            }
            Class::Video => {
                let _ = self.video_tx.send(frame);
                None
            }
            Class::Search => {
                let _ = self.search_tx.send(frame);
                None
            }
            Class::Simulation => {
                let _ = self.simulation_tx.send(frame);
                None
            }
            Class::Other => Some(handle_inline(frame, api, self.role).await),
        }
    }

    /// Cancel all four workers and wait up to a short grace period for them to unwind.
    pub async fn drain(self) {
        for worker in &self.workers {
            worker.abort();
        }
        let join_all = futures::future::join_all(self.workers);
        let _ = tokio::time::timeout(DRAIN_GRACE, join_all).await;
    }
}

fn is_inline(action: &str) -> bool {
    matches!(
        action,
        "heartbeat" | "get_user_role" | "generate_caption" | "generate_video_thumbnail" | "generate_thumbnail" | "old_generate_thumbnail"
    )
}

async fn handle_inline(frame: Frame, api: &SharedApi, role: Role) -> Value {
    match frame.action.as_str() {
        "heartbeat" | "get_user_role" => success(&frame.action, &frame.request_id, json!({ "user_role": role.as_str() })),

        "generate_caption" => {
            let title = frame.field_str("title").unwrap_or_default();
            let description = frame.field_str("description").unwrap_or_default();
            match llm::generate_caption(api.llm.as_ref(), &title, &description).await {
                Ok(caption) => success(&frame.action, &frame.request_id, json!({ "caption": caption })),
                Err(err) => failure(Some(&frame.action), Some(&frame.request_id), err.to_string()),
            }
        }

        "generate_video_thumbnail" | "generate_thumbnail" | "old_generate_thumbnail" => {
            generate_video_reply(&frame, api, role, true).await
        }

        _ => failure(Some(&frame.action), Some(&frame.request_id), format!("Unknown action: {}", frame.action)),
    }
}

/// Shared body for `generate_video` and the thumbnail variants: clamp
/// parameters to the role envelope, lease an endpoint, call the worker.
async fn generate_video_reply(frame: &Frame, api: &SharedApi, role: Role, thumbnail: bool) -> Value {
    let title = frame.field_str("title").unwrap_or_default();
    if title.is_empty() {
        return failure(Some(&frame.action), Some(&frame.request_id), "Missing title for video generation");
    }
    let description = frame.field_str("description").unwrap_or_default();
    let video_prompt_prefix = frame.field_str("video_prompt_prefix").unwrap_or_default();
    let options = frame.options();

    let (width, height, num_frames, framerate) = if thumbnail {
        (512.0, 288.0, 65.0, 25.0)
    } else {
        let width = api.roles.resolve(role, Field::ClipWidth, options.width);
        let height = api.roles.resolve(role, Field::ClipHeight, options.height);
        let num_frames = api.roles.resolve(role, Field::NumFrames, options.num_frames);
        let framerate = api.roles.resolve(role, Field::ClipFramerate, options.clip_framerate);
        let (width, height) = RoleConfig::orientation_adjust(width, height, options.orientation.unwrap_or(Orientation::Landscape));
        (width, height, num_frames, framerate)
    };
    let num_inference_steps = if thumbnail {
        4.0
    } else {
        api.roles.resolve(role, Field::NumInferenceSteps, options.num_inference_steps)
    };

    let clip_caption = if thumbnail {
        format!("{video_prompt_prefix} - {}", title.trim())
    } else {
        format!("{video_prompt_prefix} - {} - {}", title.trim(), description.trim())
    };

    let request = GenerationRequest {
        prompt: format!("{clip_caption}, {POSITIVE_PROMPT_SUFFIX}"),
        negative_prompt: options.negative_prompt.clone().unwrap_or_else(|| DEFAULT_NEGATIVE_PROMPT.to_string()),
        width: width as u32,
        height: height as u32,
        num_frames: num_frames as u32,
        num_inference_steps: num_inference_steps as u32,
        guidance_scale: options.guidance_scale.unwrap_or(1.0),
        seed: options.seed.unwrap_or_else(|| rand::random::<u32>() as u64),
        framerate: framerate as u32,
        is_thumbnail: thumbnail,
    };

    let lease = match api.endpoints.lease(ENDPOINT_LEASE_TIMEOUT).await {
        Ok(lease) => lease,
        Err(err) => return failure(Some(&frame.action), Some(&frame.request_id), err.to_string()),
    };

    let request_id = frame.request_id.clone();
    match api.video_worker.generate(&lease, &request, &request_id).await {
        Ok(data_uri) => {
            if thumbnail && frame.has_key("thumbnailUrl") {
                success(&frame.action, &frame.request_id, json!({ "thumbnailUrl": data_uri }))
            } else if thumbnail {
                success(&frame.action, &frame.request_id, json!({ "thumbnail": data_uri }))
            } else {
                success(&frame.action, &frame.request_id, json!({ "video": data_uri }))
            }
        }
        Err(err) => failure(Some(&frame.action), Some(&frame.request_id), err.to_string()),
    }
}

async fn run_chat_worker(mut rx: mpsc::UnboundedReceiver<Frame>, api: Arc<SharedApi>, sink: Arc<dyn ReplySink>, user_id: Uuid) {
    struct WsSink {
        id: u64,
        sink: Arc<dyn ReplySink>,
    }

    #[async_trait]
    impl crate::chat::ChatSink for WsSink {
        async fn send(&self, message: &Value) -> std::result::Result<(), ()> {
            self.sink.send(message.clone()).await
        }
        fn id(&self) -> u64 {
            self.id
        }
    }

    let sink_id = {
        let (hi, lo) = user_id.as_u64_pair();
        hi ^ lo
    };
    let chat_sink: Arc<dyn crate::chat::ChatSink> = Arc::new(WsSink { id: sink_id, sink: sink.clone() });

    while let Some(frame) = rx.recv().await {
        let Some(video_id) = frame.field_str("videoId") else {
            let _ = sink.send(failure(Some(&frame.action), Some(&frame.request_id), "No video ID provided")).await;
            continue;
        };

        let reply = match frame.action.as_str() {
            "join_chat" => match api.chat.join(&video_id, chat_sink.clone()) {
                Ok(messages) => success(&frame.action, &frame.request_id, json!({ "messages": messages })),
                Err(err) => failure(Some(&frame.action), Some(&frame.request_id), err.to_string()),
            },
            "leave_chat" => match api.chat.leave(&video_id, sink_id) {
                Ok(()) => success(&frame.action, &frame.request_id, json!({})),
                Err(err) => failure(Some(&frame.action), Some(&frame.request_id), err.to_string()),
            },
            "chat_message" => {
                let username = frame.field_str("username").unwrap_or_default();
                let content = frame.field_str("content").unwrap_or_default();
                let message = json!({ "username": username, "content": content, "videoId": video_id });
                match api.chat.post(&video_id, message.clone(), sink_id).await {
                    Ok(()) => success(&frame.action, &frame.request_id, json!({ "message": message })),
                    Err(err) => failure(Some(&frame.action), Some(&frame.request_id), err.to_string()),
                }
            }
            other => failure(Some(other), Some(&frame.request_id), format!("Unknown chat action: {other}")),
        };

        if sink.send(reply).await.is_err() {
            break;
        }
    }
}

async fn run_video_worker(mut rx: mpsc::UnboundedReceiver<Frame>, api: Arc<SharedApi>, sink: Arc<dyn ReplySink>, _user_id: Uuid, role: Role) {
    let max_concurrent = role_video_cap(role, api.endpoints.len().max(1));
    let mut active: Vec<JoinHandle<()>> = Vec::new();

    loop {
        active.retain(|h| !h.is_finished());

        while active.len() < max_concurrent {
            let frame = tokio::select! {
                frame = rx.recv() => frame,
                _ = tokio::time::sleep(VIDEO_POLL_INTERVAL) => None,
            };
            let Some(frame) = frame else { break };

            let api = api.clone();
            let sink = sink.clone();
            active.push(tokio::spawn(async move {
                let reply = generate_video_reply(&frame, &api, role, false).await;
                let _ = sink.send(reply).await;
            }));
        }

        tokio::time::sleep(VIDEO_POLL_INTERVAL).await;

        if rx.is_closed() && active.is_empty() {
            break;
        }
    }
}

async fn run_search_worker(mut rx: mpsc::UnboundedReceiver<Frame>, api: Arc<SharedApi>, sink: Arc<dyn ReplySink>) {
    while let Some(frame) = rx.recv().await {
        let query = frame.field_str("query").unwrap_or_default();
        let query = query.trim();

        let reply = if query.is_empty() {
            failure(Some(&frame.action), Some(&frame.request_id), "No search query provided")
        } else {
            let result = llm::search(api.llm.as_ref(), query).await;
            success(&frame.action, &frame.request_id, json!({ "result": result }))
        };

        if sink.send(reply).await.is_err() {
            break;
        }
    }
}

async fn run_simulation_worker(mut rx: mpsc::UnboundedReceiver<Frame>, api: Arc<SharedApi>, sink: Arc<dyn ReplySink>) {
    while let Some(frame) = rx.recv().await {
        let original_title = frame.field_str("original_title").unwrap_or_default();
        let original_description = frame.field_str("original_description").unwrap_or_default();
        let current_description = frame.field_str("current_description").unwrap_or_default();

        let reply = if original_title.is_empty() || original_description.is_empty() || current_description.is_empty() {
            failure(Some(&frame.action), Some(&frame.request_id), "Missing required parameters")
        } else {
            let condensed_history = frame.field_str("condensed_history").unwrap_or_default();
            let chat_messages = frame.field_str("chat_messages").unwrap_or_default();
            let evolution_count = frame
                .body
                .get("evolution_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;

            let request = llm::SimulateRequest {
                original_title: &original_title,
                original_description: &original_description,
                current_description: &current_description,
                condensed_history: &condensed_history,
                evolution_count,
                chat_messages: &chat_messages,
            };
            let evolved = llm::simulate(api.llm.as_ref(), &request).await;
            success(
                &frame.action,
                &frame.request_id,
                json!({ "evolved_description": evolved, "condensed_history": condensed_history }),
            )
        };

        if sink.send(reply).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        replies: StdMutex<Vec<Value>>,
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn send(&self, reply: Value) -> std::result::Result<(), ()> {
            self.replies.lock().unwrap().push(reply);
            Ok(())
        }
    }

    struct EchoLlm;

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn generate_text(&self, _prompt: &str, _max_new_tokens: u32, _temperature: f64) -> Result<String> {
            Ok("title: \"echo\"\ndescription: \"documentary footage of an echo\"".to_string())
        }
    }

    fn test_api() -> Arc<SharedApi> {
        Arc::new(SharedApi {
            endpoints: EndpointPool::new(vec!["http://worker-1".to_string()]),
            video_worker: VideoWorker::new(None),
            chat: ChatRegistry::new(),
            roles: RoleConfig::default(),
            llm: Arc::new(EchoLlm),
        })
    }

    #[tokio::test]
    async fn heartbeat_replies_inline_with_role() {
        let api = test_api();
        let frame = Frame::parse(r#"{"action": "heartbeat", "requestId": "1"}"#).unwrap();
        let reply = handle_inline(frame, &api, Role::Pro).await;
        assert_eq!(reply["success"], true);
        assert_eq!(reply["user_role"], "pro");
    }

    #[tokio::test]
    async fn unknown_inline_action_is_a_failure_reply() {
        let api = test_api();
        let frame = Frame::parse(r#"{"action": "frobnicate", "requestId": "1"}"#).unwrap();
        let reply = handle_inline(frame, &api, Role::Anon).await;
        assert_eq!(reply["success"], false);
    }

    #[tokio::test]
    async fn search_queue_dispatches_and_replies() {
        let api = test_api();
        let sink = Arc::new(RecordingSink { replies: StdMutex::new(vec![]) });
        let session = Session::start(Uuid::new_v4(), Role::Normal, api.clone(), sink.clone());

        let frame = Frame::parse(r#"{"action": "search", "requestId": "1", "query": "cats"}"#).unwrap();
        assert!(session.dispatch(frame, &api).await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let replies = sink.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["action"], "search");
        assert_eq!(replies[0]["success"], true);
    }

    #[tokio::test]
    async fn chat_requires_video_id() {
        let api = test_api();
        let sink = Arc::new(RecordingSink { replies: StdMutex::new(vec![]) });
        let session = Session::start(Uuid::new_v4(), Role::Normal, api.clone(), sink.clone());

        let frame = Frame::parse(r#"{"action": "join_chat", "requestId": "1"}"#).unwrap();
        session.dispatch(frame, &api).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let replies = sink.replies.lock().unwrap();
        assert_eq!(replies[0]["success"], false);
    }
}
