use crate::types::{DimensionalAddress, Timestamp};
use serde::{Deserialize, Serialize};

/// Durable per-job timeline. Every variant is appended inside the same
/// transaction as the writes it witnesses, so the exported timeline never
/// claims progress the store cannot prove.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JobEvent {
    JobCreated {
        job_id: String,
        topic: String,
        generation_id: String,
    },
    Leg1Entered {
        activity_id: String,
        dad: DimensionalAddress,
        attempts: u32,
    },
    Leg1Completed {
        activity_id: String,
        dad: DimensionalAddress,
    },
    WorkerDispatched {
        activity_id: String,
        topic: String,
        guid: String,
    },
    HookRegistered {
        activity_id: String,
        topic: String,
        key: String,
    },
    TimerRegistered {
        activity_id: String,
        deadline_ms: Timestamp,
    },
    SignalDelivered {
        topic: String,
        target_activity_id: String,
        target_job_id: String,
    },
    StepCommitted {
        activity_id: String,
        guid: String,
        step: u8,
    },
    ChildSpawned {
        source_activity_id: String,
        target_activity_id: String,
        dad: DimensionalAddress,
        guid: String,
    },
    ChildJobStarted {
        activity_id: String,
        child_topic: String,
        child_job_id: String,
    },
    CycleReentered {
        activity_id: String,
        ancestor_id: String,
        dad: DimensionalAddress,
    },
    JobClosed {
        /// Guid of the message whose semaphore delta crossed the threshold.
        guid: String,
    },
    CompletionTasksRan {
        guid: String,
    },
    ErrorRecorded {
        activity_id: String,
        code: u16,
        message: String,
    },
    DeadLettered {
        stream: String,
        guid: String,
        delivery_count: u32,
    },
    Interrupted {
        reason: Option<String>,
    },
    ExpireScheduled {
        at: Timestamp,
    },
}
