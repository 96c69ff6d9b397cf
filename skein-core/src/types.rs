use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// A 15-digit collation ledger value. Signed so that fault sentinels
/// (e.g. an entry notarized against a never-primed ledger) are representable.
pub type LedgerValue = i64;

/// Wall-clock now in epoch milliseconds.
pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ─── Wire status codes ────────────────────────────────────────

/// Stable wire-level status codes carried on RESPONSE messages.
pub mod codes {
    pub const SUCCESS: u16 = 200;
    /// Keep the hook alive; the activity stays open for further signals.
    pub const PENDING: u16 = 202;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERRUPTED: u16 = 410;
    pub const SLEEP: u16 = 588;
    pub const WAIT_ALL: u16 = 589;
    pub const CHILD: u16 = 590;
    pub const PROXY: u16 = 591;
    pub const INCOMPLETE_SIGNAL: u16 = 593;
    pub const WAIT_FOR_SET: u16 = 594;
    pub const WAIT: u16 = 595;
    pub const TIMEOUT: u16 = 596;
    /// Retries exhausted.
    pub const MAXED: u16 = 597;
    pub const FATAL: u16 = 598;
    pub const RETRYABLE: u16 = 599;
    /// Dead-lettered after exceeding the delivery cap.
    pub const UNACKED: u16 = 999;

    /// Codes the router may retry locally before publishing an error response.
    pub fn is_retryable(code: u16) -> bool {
        code == RETRYABLE || code == TIMEOUT
    }
}

// ─── Dimensional address ──────────────────────────────────────

/// A comma-separated integer path locating an activity invocation in the
/// unrolled graph (e.g. `,0,1,0`). Cycle iterations push fresh indices,
/// giving descendants an isolated dimensional subspace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionalAddress(String);

impl DimensionalAddress {
    /// The root address for a trigger activity.
    pub fn root() -> Self {
        Self(",0".to_string())
    }

    pub fn parse(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extend with one more index (used when a parent threads its current
    /// cycle index onto outgoing transitions).
    pub fn push(&self, index: u32) -> Self {
        Self(format!("{},{}", self.0, index))
    }

    pub fn segments(&self) -> Vec<u32> {
        self.0
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Storage form: trailing zero segments are trimmed, keeping at least
    /// the root segment, so `,0,1,0` and `,0,1` address the same ledger.
    pub fn trimmed(&self) -> Self {
        let mut segs = self.segments();
        while segs.len() > 1 && segs.last() == Some(&0) {
            segs.pop();
        }
        Self::from_segments(&segs)
    }

    /// Replace the final segment with `index` (cycle re-entry targeting).
    pub fn with_last(&self, index: u32) -> Self {
        let mut segs = self.segments();
        match segs.last_mut() {
            Some(last) => *last = index,
            None => segs.push(index),
        }
        Self::from_segments(&segs)
    }

    fn from_segments(segs: &[u32]) -> Self {
        if segs.is_empty() {
            return Self::root();
        }
        let mut out = String::new();
        for s in segs {
            out.push(',');
            out.push_str(&s.to_string());
        }
        Self(out)
    }
}

impl std::fmt::Display for DimensionalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Job ──────────────────────────────────────────────────────

/// Derived view of a job's lifecycle, computed from the semaphore and the
/// error slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Completed,
    Interrupted,
    Errored,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Reference to the parent that spawned this job as a child workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub job_id: String,
    pub activity_id: String,
    pub topic: String,
    pub dad: DimensionalAddress,
    /// Guid of the AWAIT message that started the child; the parent's Leg 2
    /// resumes under this guid when the child publishes its terminal response.
    pub guid: String,
}

/// A top-level workflow instance.
///
/// The semaphore counts outstanding activity obligations: each activity
/// completion applies `delta = N - 1` where N is the number of transition
/// messages it emits. Semaphore == threshold means the job is complete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub app_id: String,
    /// Topic of the graph this job subscribes to.
    pub topic: String,
    /// Random per job replacement; messages carrying a stale generation
    /// are acked and dropped.
    pub generation_id: String,
    pub semaphore: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// TTL applied once the job completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
}

impl Job {
    /// Derived lifecycle state. The interrupt sentinel drives the semaphore
    /// far negative so it is distinguishable from ordinary closure.
    pub fn state(&self, threshold: i64) -> JobState {
        if self.semaphore <= INTERRUPT_SENTINEL {
            JobState::Interrupted
        } else if self.semaphore == threshold {
            if self.error.is_some() {
                JobState::Errored
            } else {
                JobState::Completed
            }
        } else {
            JobState::Running
        }
    }
}

/// Semaphore value written by job interruption. Any Leg-2 message observing
/// a semaphore at or below this acks silently (`InactiveJob`).
pub const INTERRUPT_SENTINEL: i64 = -1_000_000_000;

/// Client-facing status snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub semaphore: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Options accepted by `Engine::start`.
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    /// Client-chosen job id; generated when absent.
    pub job_id: Option<String>,
    /// Start suspended: the trigger commits the job row but emits no children
    /// until a resume signal arrives.
    pub pending: bool,
    /// TTL in milliseconds applied to the job after completion.
    pub expire: Option<i64>,
    /// Initial state seed, written by the trigger before any child runs.
    pub search: BTreeMap<String, Value>,
    /// Parent reference for child workflows (dependent-cleanup cascades).
    pub parent: Option<ParentRef>,
}

/// Options accepted by `Engine::interrupt`.
#[derive(Clone, Debug, Default)]
pub struct InterruptOptions {
    pub reason: Option<String>,
    /// Also interrupt child jobs spawned by this job.
    pub descend: bool,
}

// ─── Transition messages ──────────────────────────────────────

/// Wire-level message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "TRANSITION")]
    Transition,
    #[serde(rename = "AWAIT")]
    Await,
    #[serde(rename = "RESPONSE")]
    Response,
}

/// Metadata envelope carried by every transition message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Fresh per message; keys the GUID ledger.
    pub guid: String,
    /// Job id.
    pub jid: String,
    /// Job generation id.
    pub gid: String,
    /// Dimensional address of the target invocation.
    pub dad: DimensionalAddress,
    /// Target activity id.
    pub aid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Telemetry span id, propagated untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spn: Option<String>,
    /// Telemetry trace id, propagated untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trc: Option<String>,
}

/// Bounded local retry policy for retryable stream errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
        }
    }
}

/// A unit of work delivered via a stream — one edge of the graph being
/// traversed, a worker dispatch, or a response flowing back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionMessage {
    pub metadata: MessageMetadata,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policies: Option<RetryPolicy>,
}

impl TransitionMessage {
    /// Status code carried in `data.code` on RESPONSE messages; SUCCESS when
    /// absent.
    pub fn code(&self) -> u16 {
        self.data
            .get("code")
            .and_then(Value::as_u64)
            .map(|c| c as u16)
            .unwrap_or(codes::SUCCESS)
    }
}

// ─── Stream envelopes ─────────────────────────────────────────

/// A claimed stream entry: the message plus delivery bookkeeping owned by
/// the consumer group.
#[derive(Clone, Debug)]
pub struct StreamEnvelope {
    /// Store-assigned entry id, required for ack-and-delete.
    pub id: String,
    /// Times this entry has been delivered to any consumer.
    pub delivery_count: u32,
    pub message: TransitionMessage,
}

// ─── Hook and timer bindings ──────────────────────────────────

/// Durable index entry registered by a hook activity at Leg 1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookBinding {
    pub topic: String,
    /// Correlation key resolved at registration time (defaults to job id).
    pub key: String,
    pub job_id: String,
    pub activity_id: String,
    pub dad: DimensionalAddress,
}

/// Durable sleep registration; a time-hook dispatcher appends the Leg 2
/// message when the deadline elapses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerBinding {
    pub job_id: String,
    pub activity_id: String,
    pub dad: DimensionalAddress,
    pub deadline_ms: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensional_address_round_trip() {
        let root = DimensionalAddress::root();
        assert_eq!(root.as_str(), ",0");
        let child = root.push(1).push(0);
        assert_eq!(child.as_str(), ",0,1,0");
        assert_eq!(child.segments(), vec![0, 1, 0]);
    }

    #[test]
    fn dimensional_address_trims_trailing_zeros() {
        let addr = DimensionalAddress::parse(",0,1,0,0");
        assert_eq!(addr.trimmed().as_str(), ",0,1");
        // Root is never trimmed away.
        assert_eq!(DimensionalAddress::parse(",0,0").trimmed().as_str(), ",0");
        assert_eq!(DimensionalAddress::root().trimmed().as_str(), ",0");
    }

    #[test]
    fn dimensional_address_cycle_reentry() {
        let addr = DimensionalAddress::parse(",0,0");
        assert_eq!(addr.with_last(1).as_str(), ",0,1");
    }

    #[test]
    fn message_code_defaults_to_success() {
        let msg = TransitionMessage {
            metadata: MessageMetadata {
                guid: "g".into(),
                jid: "j".into(),
                gid: "gen".into(),
                dad: DimensionalAddress::root(),
                aid: "a1".into(),
                topic: None,
                spn: None,
                trc: None,
            },
            kind: MessageType::Response,
            data: serde_json::json!({}),
            policies: None,
        };
        assert_eq!(msg.code(), codes::SUCCESS);
        let mut errmsg = msg.clone();
        errmsg.data = serde_json::json!({"code": 599, "message": "transient"});
        assert_eq!(errmsg.code(), codes::RETRYABLE);
        assert!(codes::is_retryable(errmsg.code()));
    }

    #[test]
    fn job_state_derivation() {
        let mut job = Job {
            job_id: "j1".into(),
            app_id: "app".into(),
            topic: "t".into(),
            generation_id: "g".into(),
            semaphore: 2,
            error: None,
            parent: None,
            created_at: 0,
            updated_at: 0,
            expire_ms: None,
            expires_at: None,
        };
        assert_eq!(job.state(0), JobState::Running);
        job.semaphore = 0;
        assert_eq!(job.state(0), JobState::Completed);
        job.error = Some(JobError {
            code: codes::FATAL,
            message: "boom".into(),
            stack: None,
        });
        assert_eq!(job.state(0), JobState::Errored);
        job.semaphore = INTERRUPT_SENTINEL;
        assert_eq!(job.state(0), JobState::Interrupted);
    }
}
