//! The `/ws` upgrade handler: per-connection identity resolution, session
//! construction, and the inbound frame loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use genlite::frame::{classify, failure, Frame};
use genlite::role::Role;
use genlite::session::{ReplySink, Session};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::AppState;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    hf_token: String,
}

pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.maintenance_mode {
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({ "error": "Server is in maintenance mode", "maintenance": true })),
        )
            .into_response();
    }

    let client_ip = forwarded_ip(&headers).unwrap_or_else(|| peer.ip().to_string());

    ws.max_message_size(genlite::frame::MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_connection(socket, state, query.hf_token, client_ip))
}

fn forwarded_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

/// Adapts an axum `WebSocket` split sink into the [`ReplySink`] workers send replies through.
struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl ReplySink for WsSink {
    async fn send(&self, reply: serde_json::Value) -> std::result::Result<(), ()> {
        let text = serde_json::to_string(&reply).map_err(|_| ())?;
        self.tx.send(Message::Text(text.into())).map_err(|_| ())
    }
}

#[tracing::instrument("conn", skip_all, fields(ip = %client_ip, conn_id = state.next_connection_id()))]
async fn handle_connection(socket: WebSocket, state: Arc<AppState>, hf_token: String, client_ip: String) {
    let user_id = Uuid::new_v4();
    let role = state.identity.resolve(&hf_token).await;
    tracing::info!(%user_id, %role, "client connected");

    state.metrics.register_session(user_id, &client_ip);

    let (mut write, mut read) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let sink: Arc<dyn ReplySink> = Arc::new(WsSink { tx: out_tx });

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    let session = Session::start(user_id, role, state.api.clone(), sink.clone());

    loop {
        let message = match tokio::time::timeout(IDLE_TIMEOUT, read.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                tracing::info!(%user_id, "idle timeout, closing connection");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let frame = match Frame::parse(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        let _ = sink.send(failure(None, None, err.to_string())).await;
                        continue;
                    }
                };

                let class = classify(&frame.action);
                state.metrics.record_request(user_id, &client_ip, class, role);

                if state.metrics.is_rate_limited(user_id, class, role) {
                    let message = format!("Rate limit exceeded for {} requests. Please try again later.", class.as_str());
                    let _ = sink.send(failure(Some(&frame.action), Some(&frame.request_id), message)).await;
                    continue;
                }

                if let Some(reply) = session.dispatch(frame, &state.api).await {
                    let _ = sink.send(reply).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    session.drain().await;
    writer.abort();
    state.metrics.unregister_session(user_id, &client_ip);
    tracing::info!(%user_id, "connection closed");
}
