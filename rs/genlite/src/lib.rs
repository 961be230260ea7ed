//! Core control-plane logic for a real-time video generation gateway:
//! role-bounded parameter clamping, endpoint pool management, rate limiting
//! and metrics, chat fan-out, the LLM-backed search/caption/simulate flows,
//! and the per-connection session router that ties them together.

pub mod chat;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod identity;
pub mod llm;
pub mod metrics;
pub mod role;
pub mod session;
pub mod video;

pub use error::{Error, Result};
