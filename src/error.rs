//! Top-level error types for Relaybot.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Request queue backpressure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("request queue for actor {actor_id} is full ({capacity} pending)")]
    Full { actor_id: u64, capacity: usize },
}

/// Per-attachment ingestion failures.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("unsupported attachment: {name}")]
    Unsupported { name: String },

    #[error("failed to download {name}: {reason}")]
    Download { name: String, reason: String },

    #[error("failed to process {name}: {reason}")]
    ProcessingFailed { name: String, reason: String },

    #[error("failed to upload {name}: {reason}")]
    Upload { name: String, reason: String },

    #[error("remote processing failed for {name}")]
    RemoteProcessingFailed { name: String },

    #[error("remote processing of {name} did not finish after {attempts} polls")]
    RemoteProcessingTimeout { name: String, attempts: u32 },
}

/// Generation provider errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("generation failed after trying {}: {last_error}", models.join(", "))]
    GenerationFailed {
        models: Vec<String>,
        last_error: String,
    },
}

/// Chat transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("missing permission: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport request failed: {0}")]
    Request(String),
}

/// Persisted-state errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("failed to (de)serialize history: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Join(String),
}
