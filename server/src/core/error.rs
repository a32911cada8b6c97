// related_world_server/server/src/core/error.rs
use crate::core::types::ActorId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelatedWorldError {
    #[error("Related world already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid or pending-kill actor: {0}")]
    InvalidActor(ActorId),

    #[error("Spawn of {0} blocked by collision")]
    SpawnBlocked(String),

    #[error("Packed movement payload of {bits} bits exceeds limit of {limit} bits")]
    PayloadTooLarge { bits: usize, limit: usize },

    #[error("Malformed movement payload: {0}")]
    MalformedPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type RelatedWorldResult<T> = Result<T, RelatedWorldError>;
