/// The error taxonomy shared by every worker in a [`crate::session::Session`].
///
/// Workers never let one of these escape and tear down the session; they
/// catch it at the per-message boundary and turn it into a reply frame.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Malformed frame, missing required field, unknown action, path traversal.
    #[error("{0}")]
    User(String),

    /// Request denied by the rate limiter. Never counted against the worker.
    #[error("Rate limit exceeded for {0}")]
    RateLimited(&'static str),

    /// Upstream worker returned non-200 or an error body.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The endpoint's HTTP deadline elapsed.
    #[error("generation timed out")]
    GenerationTimeout,

    /// Unexpected local failure, logged with `requestId` context.
    #[error("internal error")]
    Internal,

    /// The connection is gone; callers should swallow this silently.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
