use crate::types::codes;
use thiserror::Error;

/// Faults raised by ledger verification. `Duplicate` and `Inactive` observed
/// at Leg 2 entry are stale replays (log, ack, exit); the rest are fatal for
/// the invocation that observes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CollationFault {
    /// The target ledger was never primed; the message references an
    /// invocation that was never spawned.
    #[error("collation fault: missing")]
    Missing,
    /// The protocol stage already ran for this invocation or message.
    #[error("collation fault: duplicate")]
    Duplicate,
    /// Leg 2 already closed for this invocation.
    #[error("collation fault: inactive")]
    Inactive,
    /// The ledger holds a value no legal op sequence produces.
    #[error("collation fault: invalid")]
    Invalid,
    /// Leg 2 entry without a completed Leg 1.
    #[error("collation fault: forbidden")]
    Forbidden,
}

/// Engine-level error taxonomy. Variants that reach the wire carry the
/// stable status codes of `types::codes`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Conditional insert in trigger Leg 1 failed with no crash-recovery
    /// signature present.
    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("no graph registered for topic: {0}")]
    GraphNotFound(String),

    #[error("activity not found in graph: {0}")]
    ActivityNotFound(String),

    /// The job's semaphore is at or past its threshold; pending messages
    /// ack silently.
    #[error("inactive job: {0}")]
    InactiveJob(String),

    /// The message's generation id disagrees with the store; the job was
    /// replaced.
    #[error("stale generation for job {job_id}: message {message_gid}, store {store_gid}")]
    StaleGeneration {
        job_id: String,
        message_gid: String,
        store_gid: String,
    },

    /// Leg 1 entry attempts exhausted.
    #[error("activity {activity_id} maxed after {attempts} attempts")]
    Maxed { activity_id: String, attempts: u32 },

    #[error(transparent)]
    Collation(#[from] CollationFault),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Wire status code for RESPONSE messages carrying this error.
    pub fn code(&self) -> u16 {
        match self {
            EngineError::DuplicateJob(_) => codes::FATAL,
            EngineError::JobNotFound(_) | EngineError::GraphNotFound(_) => codes::NOT_FOUND,
            EngineError::ActivityNotFound(_) => codes::NOT_FOUND,
            EngineError::InactiveJob(_) => codes::INTERRUPTED,
            EngineError::StaleGeneration { .. } => codes::INTERRUPTED,
            EngineError::Maxed { .. } => codes::MAXED,
            EngineError::Collation(_) => codes::FATAL,
            EngineError::Store(_) => codes::RETRYABLE,
        }
    }

    /// Stale replays and generation mismatches end with a silent ack rather
    /// than an error response.
    pub fn is_silent_ack(&self) -> bool {
        matches!(
            self,
            EngineError::InactiveJob(_)
                | EngineError::StaleGeneration { .. }
                | EngineError::Collation(CollationFault::Duplicate)
                | EngineError::Collation(CollationFault::Inactive)
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
