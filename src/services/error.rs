use crate::infra::store::StoreError;
use thiserror::Error;

/// Infrastructure faults surfaced by the engine. Business outcomes (denials,
/// failed verifications, unknown devices) are never reported through here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("file store: {0}")]
    Files(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type EngineResult<T> = Result<T, EngineError>;
