//! Service-wide error types.
//!
//! Every failure the service can surface to a client maps onto a closed set
//! of kinds. Errors raised before the event stream opens become HTTP status
//! codes; errors raised after the `info` event become in-stream `error`
//! events carrying `kind()` and `user_message()`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// All configured embedding endpoints failed.
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Both vector recall channels failed.
    #[error("vector retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Chat service unreachable or failed before the first delta.
    #[error("generation service unavailable: {0}")]
    GenerationUnavailable(String),

    /// Chat stream dropped after at least one delta was produced.
    #[error("generation stream interrupted: {0}")]
    GenerationInterrupted(String),

    /// The SSE consumer stopped draining deltas.
    #[error("client too slow to consume stream")]
    ClientSlow,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The request scope was cancelled (disconnect or abort endpoint).
    #[error("request cancelled")]
    Cancelled,

    /// The request scope deadline expired.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire identifier emitted verbatim as `error.kind` in SSE error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::EmbeddingUnavailable(_) => "embedding_unavailable",
            Error::RetrievalUnavailable(_) => "retrieval_unavailable",
            Error::GenerationUnavailable(_) => "generation_unavailable",
            Error::GenerationInterrupted(_) => "generation_interrupted",
            Error::ClientSlow => "client_slow",
            Error::InvalidRequest(_) => "invalid_request",
            Error::NotFound(_) => "not_found",
            Error::Cancelled => "cancelled",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Store(_) | Error::Io(_) => "internal",
        }
    }

    /// Message safe to show an end user. Internal detail stays in logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::EmbeddingUnavailable(_)
            | Error::RetrievalUnavailable(_)
            | Error::GenerationUnavailable(_) => "Temporary retrieval failure, please retry.",
            Error::GenerationInterrupted(_) => "Answer incomplete; please retry.",
            Error::InvalidRequest(_) => "Invalid request.",
            Error::NotFound(_) => "Not found.",
            Error::Cancelled | Error::DeadlineExceeded => "Request cancelled.",
            Error::ClientSlow | Error::Store(_) | Error::Io(_) => "Internal error, please retry.",
        }
    }
}
