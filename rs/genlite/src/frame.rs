//! Inbound frame parsing and outbound reply construction for the duplex
//! protocol. Frames are schema-loose JSON (the same field can arrive at the
//! top level or nested under `params`), so a [`Frame`] keeps the raw body
//! around and exposes lenient accessors rather than a single strict struct.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::metrics::Class;
use crate::role::Orientation;

pub const MAX_FRAME_BYTES: usize = 20 * 1024 * 1024;

/// A parsed inbound request. `action` and `request_id` are pulled out for
/// routing; everything else stays in `body` since its shape varies by action.
#[derive(Debug, Clone)]
pub struct Frame {
    pub action: String,
    pub request_id: String,
    pub body: Value,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Frame> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(Error::User("frame exceeds maximum size".into()));
        }

        let body: Value = serde_json::from_str(text).map_err(|e| Error::User(format!("invalid JSON: {e}")))?;
        let action = body
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::User("missing action".into()))?
            .to_string();
        let request_id = body.get("requestId").and_then(Value::as_str).unwrap_or_default().to_string();

        Ok(Frame { action, request_id, body })
    }

    /// Looks up `key` at the top level, falling back to `params.<key>`
    /// (mirrors the client's older and newer message shapes).
    pub fn field_str(&self, key: &str) -> Option<String> {
        self.body
            .get(key)
            .and_then(Value::as_str)
            .or_else(|| self.body.get("params").and_then(|p| p.get(key)).and_then(Value::as_str))
            .map(str::to_string)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.body.get(key).is_some() || self.body.get("params").and_then(|p| p.get(key)).is_some()
    }

    pub fn options(&self) -> VideoOptions {
        self.body
            .get("options")
            .or_else(|| self.body.get("params").and_then(|p| p.get("options")))
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// Which rate-limit / session-queue bucket an action belongs to.
pub fn classify(action: &str) -> Class {
    match action {
        "join_chat" | "leave_chat" | "chat_message" => Class::Chat,
        "generate_video" | "generate_video_thumbnail" | "generate_thumbnail" | "old_generate_thumbnail" => Class::Video,
        "search" => Class::Search,
        "simulate" => Class::Simulation,
        _ => Class::Other,
    }
}

/// Per-request generation parameter overrides, all optional: unset fields
/// fall back to the caller's role defaults in [`crate::role::RoleConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoOptions {
    pub seed: Option<u64>,
    pub orientation: Option<Orientation>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub num_frames: Option<f64>,
    pub num_inference_steps: Option<f64>,
    pub clip_framerate: Option<f64>,
    pub clip_duration_seconds: Option<f64>,
    pub clip_playback_speed: Option<f64>,
    pub negative_prompt: Option<String>,
    pub guidance_scale: Option<f64>,
    pub video_id: Option<String>,
}

/// Build a `{action, requestId, success: true, ...extra}` reply.
pub fn success(action: &str, request_id: &str, extra: Value) -> Value {
    let mut reply = json!({
        "action": action,
        "requestId": request_id,
        "success": true,
    });
    merge(&mut reply, extra);
    reply
}

/// Build a `{action, requestId, success: false, error}` reply.
pub fn failure(action: Option<&str>, request_id: Option<&str>, message: impl Into<String>) -> Value {
    json!({
        "action": action,
        "requestId": request_id,
        "success": false,
        "error": message.into(),
    })
}

fn merge(base: &mut Value, extra: Value) {
    let (Value::Object(base), Value::Object(extra)) = (base, extra) else { return };
    for (k, v) in extra {
        base.insert(k, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_action_is_a_user_error() {
        let result = Frame::parse(r#"{"requestId": "1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn field_falls_back_to_params() {
        let frame = Frame::parse(r#"{"action": "generate_caption", "requestId": "1", "params": {"title": "t"}}"#).unwrap();
        assert_eq!(frame.field_str("title"), Some("t".to_string()));
    }

    #[test]
    fn field_prefers_top_level_over_params() {
        let frame = Frame::parse(r#"{"action": "x", "requestId": "1", "title": "top", "params": {"title": "nested"}}"#).unwrap();
        assert_eq!(frame.field_str("title"), Some("top".to_string()));
    }

    #[test]
    fn classify_maps_every_known_action() {
        assert_eq!(classify("chat_message"), Class::Chat);
        assert_eq!(classify("generate_video"), Class::Video);
        assert_eq!(classify("generate_thumbnail"), Class::Video);
        assert_eq!(classify("search"), Class::Search);
        assert_eq!(classify("simulate"), Class::Simulation);
        assert_eq!(classify("heartbeat"), Class::Other);
    }

    #[test]
    fn options_default_when_absent() {
        let frame = Frame::parse(r#"{"action": "generate_video", "requestId": "1"}"#).unwrap();
        let options = frame.options();
        assert!(options.width.is_none());
    }

    #[test]
    fn success_reply_merges_extra_fields() {
        let reply = success("heartbeat", "1", json!({"user_role": "anon"}));
        assert_eq!(reply["success"], true);
        assert_eq!(reply["user_role"], "anon");
    }
}
