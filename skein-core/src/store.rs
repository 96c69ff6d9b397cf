use crate::events::JobEvent;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

// ─── Stream naming ────────────────────────────────────────────

/// Engine topic stream: Leg 1 / Leg 2 transition traffic for one graph.
pub fn topic_stream(topic: &str) -> String {
    format!("skein:stream:{topic}")
}

/// Worker dispatch stream: AWAIT messages consumed by external workers.
pub fn worker_stream(topic: &str) -> String {
    format!("skein:worker:{topic}")
}

/// Publish stream: terminal RESPONSE messages for subscribers.
pub fn publish_stream(topic: &str) -> String {
    format!("skein:published:{topic}")
}

// ─── Transactional primitives ─────────────────────────────────

/// One mutating primitive added to a transaction buffer. The provider
/// guarantees single-commit atomicity for every op in one `commit` call;
/// the engine composes protocol stages out of nothing else.
#[derive(Clone, Debug)]
pub enum TxnOp {
    /// Insert a job row only if none exists.
    CreateJobIfAbsent { job: Job },
    /// Fetch-and-add `delta` into the activity ledger at every named
    /// dimensional address. Implicitly creates absent ledgers at zero.
    IncrementLedger {
        job_id: String,
        activity_id: String,
        dads: Vec<DimensionalAddress>,
        delta: LedgerValue,
    },
    /// Fetch-and-add into the GUID ledger keyed by message guid.
    IncrementGuidLedger {
        job_id: String,
        guid: String,
        delta: LedgerValue,
    },
    /// The compound primitive: apply the semaphore delta, detect the
    /// threshold crossing, and capture the job-closed snapshot bit into the
    /// GUID ledger — all in one statement.
    SetStatusAndCollateGuid {
        job_id: String,
        delta: i64,
        threshold: i64,
        guid: String,
        snapshot_weight: LedgerValue,
    },
    /// Write path/value pairs into the job's flat state under `dad`.
    WriteFlatState {
        job_id: String,
        dad: DimensionalAddress,
        entries: Vec<(String, Value)>,
    },
    StreamAppend {
        stream: String,
        message: TransitionMessage,
    },
    /// Ack-and-delete a claimed entry. Idempotent: unknown ids are a no-op.
    StreamAckDelete {
        stream: String,
        group: String,
        id: String,
    },
    RegisterHook { binding: HookBinding },
    RemoveHook { topic: String, key: String },
    RegisterTimer { binding: TimerBinding },
    AppendEvent { job_id: String, event: JobEvent },
    /// Set the interrupt sentinel and the error slot.
    MarkJobInterrupted {
        job_id: String,
        error: Option<JobError>,
    },
    SetJobError { job_id: String, error: JobError },
    ScheduleExpire { job_id: String, at: Timestamp },
}

/// Per-op result, positionally matching the committed buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum TxnReply {
    Created { created: bool, semaphore: i64 },
    /// Post-increment ledger value (first dimensional address when several
    /// were named).
    Ledger(LedgerValue),
    ThresholdHit(bool),
    MessageId(String),
    Seq(u64),
    Unit,
}

impl TxnReply {
    pub fn ledger(&self) -> LedgerValue {
        match self {
            TxnReply::Ledger(v) => *v,
            other => panic!("expected Ledger reply, got {other:?}"),
        }
    }

    pub fn threshold_hit(&self) -> bool {
        match self {
            TxnReply::ThresholdHit(hit) => *hit,
            other => panic!("expected ThresholdHit reply, got {other:?}"),
        }
    }
}

// ─── Provider contract ────────────────────────────────────────

/// Durable atomic operations the engine requires of a backing store.
///
/// Reads are immediate; every mutation goes through `commit`, whose op
/// buffer is applied with single-commit atomicity. Two bindings ship:
/// `MemoryStore` (tests, single process) and `PostgresStore` (production,
/// behind the `postgres` feature). The engine relies on nothing beyond this
/// trait.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn read_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Read the named paths (all paths when empty) from the job's flat
    /// state, plus the semaphore in the same snapshot so "am I still
    /// active" checks are crash-safe. `None` when the job does not exist.
    async fn read_flat_state(
        &self,
        job_id: &str,
        paths: &[String],
        dad: &DimensionalAddress,
    ) -> Result<Option<(BTreeMap<String, Value>, i64)>>;

    /// Current activity ledger value; zero when never written.
    async fn read_activity_ledger(
        &self,
        job_id: &str,
        activity_id: &str,
        dad: &DimensionalAddress,
    ) -> Result<LedgerValue>;

    /// Current GUID ledger value; zero when never written.
    async fn read_guid_ledger(&self, job_id: &str, guid: &str) -> Result<LedgerValue>;

    async fn read_events(&self, job_id: &str, from_seq: u64) -> Result<Vec<(u64, JobEvent)>>;

    /// Hook bindings registered under a topic (signal-all resolution).
    async fn hooks_for_topic(&self, topic: &str) -> Result<Vec<HookBinding>>;

    /// Hook binding for one correlation key (signal-one resolution).
    async fn hook_by_key(&self, topic: &str, key: &str) -> Result<Option<HookBinding>>;

    /// Hook bindings registered by one job (interrupt wake-up).
    async fn hooks_for_job(&self, job_id: &str) -> Result<Vec<HookBinding>>;

    /// Ids of jobs whose parent reference names `job_id` (interrupt
    /// cascades).
    async fn child_jobs(&self, job_id: &str) -> Result<Vec<String>>;

    /// Remove and return timers whose deadlines have elapsed.
    async fn claim_due_timers(&self, now: Timestamp, limit: usize) -> Result<Vec<TimerBinding>>;

    /// Idempotent consumer-group creation.
    async fn stream_group_create(&self, stream: &str, group: &str) -> Result<()>;

    /// Block up to `block_ms` for new entries, delivering at most `count`.
    async fn stream_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEnvelope>>;

    /// Claim pending entries idle longer than `idle_ms`, bumping their
    /// delivery counts.
    async fn stream_claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        idle_ms: u64,
        limit: usize,
    ) -> Result<Vec<StreamEnvelope>>;

    /// New plus pending entries; used by drain loops to detect quiescence.
    async fn stream_depth(&self, stream: &str) -> Result<u64>;

    /// Remove jobs (and their ledgers, state, and events) whose expiration
    /// elapsed. Returns the number removed.
    async fn sweep_expired(&self, now: Timestamp) -> Result<u64>;

    /// Apply the op buffer atomically, returning positional replies.
    async fn commit(&self, ops: Vec<TxnOp>) -> Result<Vec<TxnReply>>;
}
