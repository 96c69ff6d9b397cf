use crate::events::JobEvent;
use crate::ledger;
use crate::state::dimensioned_path;
use crate::store::{JobStore, TxnOp, TxnReply};
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::RwLock;

struct PendingEntry {
    message: TransitionMessage,
    delivery_count: u32,
    last_delivery_ms: Timestamp,
}

#[derive(Default)]
struct StreamState {
    /// Entries not yet delivered to any consumer.
    fresh: VecDeque<(String, TransitionMessage)>,
    /// Claimed but unacked, keyed by entry id.
    pending: BTreeMap<String, PendingEntry>,
    groups: Vec<String>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    /// Lazily interned path → symbol id.
    symbols: HashMap<String, u32>,
    symbol_names: Vec<String>,
    /// job id → symbol id → value: the flat symbol-encoded hash.
    state: HashMap<String, HashMap<u32, Value>>,
    /// (job id, activity id, trimmed dad) → ledger.
    ledgers: HashMap<(String, String, String), LedgerValue>,
    /// (job id, guid) → ledger.
    guid_ledgers: HashMap<(String, String), LedgerValue>,
    events: HashMap<String, Vec<(u64, JobEvent)>>,
    event_seq: HashMap<String, u64>,
    /// (topic, key) → binding.
    hooks: HashMap<(String, String), HookBinding>,
    timers: Vec<TimerBinding>,
    streams: HashMap<String, StreamState>,
    next_entry_id: u64,
}

impl Inner {
    fn intern(&mut self, path: &str) -> u32 {
        if let Some(&id) = self.symbols.get(path) {
            return id;
        }
        let id = self.symbol_names.len() as u32;
        self.symbols.insert(path.to_string(), id);
        self.symbol_names.push(path.to_string());
        id
    }

    fn apply(&mut self, op: TxnOp, now: Timestamp) -> Result<TxnReply> {
        match op {
            TxnOp::CreateJobIfAbsent { job } => {
                if let Some(existing) = self.jobs.get(&job.job_id) {
                    return Ok(TxnReply::Created {
                        created: false,
                        semaphore: existing.semaphore,
                    });
                }
                let semaphore = job.semaphore;
                self.jobs.insert(job.job_id.clone(), job);
                Ok(TxnReply::Created {
                    created: true,
                    semaphore,
                })
            }

            TxnOp::IncrementLedger {
                job_id,
                activity_id,
                dads,
                delta,
            } => {
                let mut first = None;
                for dad in &dads {
                    let key = (
                        job_id.clone(),
                        activity_id.clone(),
                        dad.trimmed().as_str().to_string(),
                    );
                    let slot = self.ledgers.entry(key).or_insert(0);
                    *slot += delta;
                    if first.is_none() {
                        first = Some(*slot);
                    }
                }
                Ok(TxnReply::Ledger(first.unwrap_or(0)))
            }

            TxnOp::IncrementGuidLedger { job_id, guid, delta } => {
                let slot = self.guid_ledgers.entry((job_id, guid)).or_insert(0);
                *slot += delta;
                Ok(TxnReply::Ledger(*slot))
            }

            TxnOp::SetStatusAndCollateGuid {
                job_id,
                delta,
                threshold,
                guid,
                snapshot_weight,
            } => {
                let job = self
                    .jobs
                    .get_mut(&job_id)
                    .ok_or_else(|| anyhow!("job not found: {job_id}"))?;
                let before = job.semaphore;
                let mut after = before + delta;
                if after < threshold && before > threshold {
                    tracing::warn!(job_id, before, delta, "semaphore underflow clamped");
                    after = threshold;
                }
                job.semaphore = after;
                job.updated_at = now;
                let hit = after == threshold && before != threshold;
                if hit {
                    let slot = self.guid_ledgers.entry((job_id, guid)).or_insert(0);
                    *slot += snapshot_weight;
                }
                Ok(TxnReply::ThresholdHit(hit))
            }

            TxnOp::WriteFlatState { job_id, dad, entries } => {
                let keys: Vec<u32> = entries
                    .iter()
                    .map(|(path, _)| {
                        let stored = dimensioned_path(path, &dad);
                        self.intern(&stored)
                    })
                    .collect();
                let job_state = self.state.entry(job_id).or_default();
                for (key, (_, value)) in keys.into_iter().zip(entries) {
                    job_state.insert(key, value);
                }
                Ok(TxnReply::Unit)
            }

            TxnOp::StreamAppend { stream, message } => {
                self.next_entry_id += 1;
                let id = format!("{}-0", self.next_entry_id);
                self.streams
                    .entry(stream)
                    .or_default()
                    .fresh
                    .push_back((id.clone(), message));
                Ok(TxnReply::MessageId(id))
            }

            TxnOp::StreamAckDelete { stream, id, .. } => {
                if let Some(s) = self.streams.get_mut(&stream) {
                    s.pending.remove(&id);
                }
                Ok(TxnReply::Unit)
            }

            TxnOp::RegisterHook { binding } => {
                self.hooks
                    .insert((binding.topic.clone(), binding.key.clone()), binding);
                Ok(TxnReply::Unit)
            }

            TxnOp::RemoveHook { topic, key } => {
                self.hooks.remove(&(topic, key));
                Ok(TxnReply::Unit)
            }

            TxnOp::RegisterTimer { binding } => {
                self.timers.push(binding);
                Ok(TxnReply::Unit)
            }

            TxnOp::AppendEvent { job_id, event } => {
                let seq = self.event_seq.entry(job_id.clone()).or_insert(0);
                *seq += 1;
                let current = *seq;
                self.events.entry(job_id).or_default().push((current, event));
                Ok(TxnReply::Seq(current))
            }

            TxnOp::MarkJobInterrupted { job_id, error } => {
                let job = self
                    .jobs
                    .get_mut(&job_id)
                    .ok_or_else(|| anyhow!("job not found: {job_id}"))?;
                job.semaphore = INTERRUPT_SENTINEL;
                job.error = error;
                job.updated_at = now;
                Ok(TxnReply::Unit)
            }

            TxnOp::SetJobError { job_id, error } => {
                let job = self
                    .jobs
                    .get_mut(&job_id)
                    .ok_or_else(|| anyhow!("job not found: {job_id}"))?;
                job.error = Some(error);
                job.updated_at = now;
                Ok(TxnReply::Unit)
            }

            TxnOp::ScheduleExpire { job_id, at } => {
                let job = self
                    .jobs
                    .get_mut(&job_id)
                    .ok_or_else(|| anyhow!("job not found: {job_id}"))?;
                job.expires_at = Some(at);
                Ok(TxnReply::Unit)
            }
        }
    }
}

/// In-memory implementation of `JobStore` for tests and single-process use.
/// The whole op buffer of a `commit` is applied under one write lock, which
/// is what single-commit atomicity means here.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn read_job(&self, job_id: &str) -> Result<Option<Job>> {
        let r = self.inner.read().await;
        Ok(r.jobs.get(job_id).cloned())
    }

    async fn read_flat_state(
        &self,
        job_id: &str,
        paths: &[String],
        dad: &DimensionalAddress,
    ) -> Result<Option<(BTreeMap<String, Value>, i64)>> {
        let r = self.inner.read().await;
        let Some(job) = r.jobs.get(job_id) else {
            return Ok(None);
        };
        let mut out = BTreeMap::new();
        if let Some(job_state) = r.state.get(job_id) {
            if paths.is_empty() {
                for (&id, value) in job_state {
                    out.insert(r.symbol_names[id as usize].clone(), value.clone());
                }
            } else {
                for path in paths {
                    // Prefer the dimensional subspace, fall back to the root.
                    let stored = dimensioned_path(path, dad);
                    let resolved = r
                        .symbols
                        .get(&stored)
                        .or_else(|| r.symbols.get(path))
                        .and_then(|id| job_state.get(id));
                    if let Some(value) = resolved {
                        out.insert(path.clone(), value.clone());
                    }
                }
            }
        }
        Ok(Some((out, job.semaphore)))
    }

    async fn read_activity_ledger(
        &self,
        job_id: &str,
        activity_id: &str,
        dad: &DimensionalAddress,
    ) -> Result<LedgerValue> {
        let r = self.inner.read().await;
        Ok(*r
            .ledgers
            .get(&(
                job_id.to_string(),
                activity_id.to_string(),
                dad.trimmed().as_str().to_string(),
            ))
            .unwrap_or(&0))
    }

    async fn read_guid_ledger(&self, job_id: &str, guid: &str) -> Result<LedgerValue> {
        let r = self.inner.read().await;
        Ok(*r
            .guid_ledgers
            .get(&(job_id.to_string(), guid.to_string()))
            .unwrap_or(&0))
    }

    async fn read_events(&self, job_id: &str, from_seq: u64) -> Result<Vec<(u64, JobEvent)>> {
        let r = self.inner.read().await;
        Ok(r.events
            .get(job_id)
            .map(|evts| {
                evts.iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn hooks_for_topic(&self, topic: &str) -> Result<Vec<HookBinding>> {
        let r = self.inner.read().await;
        Ok(r.hooks
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn hook_by_key(&self, topic: &str, key: &str) -> Result<Option<HookBinding>> {
        let r = self.inner.read().await;
        Ok(r.hooks.get(&(topic.to_string(), key.to_string())).cloned())
    }

    async fn hooks_for_job(&self, job_id: &str) -> Result<Vec<HookBinding>> {
        let r = self.inner.read().await;
        Ok(r.hooks
            .values()
            .filter(|b| b.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn child_jobs(&self, job_id: &str) -> Result<Vec<String>> {
        let r = self.inner.read().await;
        Ok(r.jobs
            .values()
            .filter(|j| {
                j.parent
                    .as_ref()
                    .map(|p| p.job_id == job_id)
                    .unwrap_or(false)
            })
            .map(|j| j.job_id.clone())
            .collect())
    }

    async fn claim_due_timers(&self, now: Timestamp, limit: usize) -> Result<Vec<TimerBinding>> {
        let mut w = self.inner.write().await;
        let mut due = Vec::new();
        let mut remaining = Vec::new();
        for timer in w.timers.drain(..) {
            if timer.deadline_ms <= now && due.len() < limit {
                due.push(timer);
            } else {
                remaining.push(timer);
            }
        }
        w.timers = remaining;
        Ok(due)
    }

    async fn stream_group_create(&self, stream: &str, group: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        let s = w.streams.entry(stream.to_string()).or_default();
        if !s.groups.iter().any(|g| g == group) {
            s.groups.push(group.to_string());
        }
        Ok(())
    }

    async fn stream_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEnvelope>> {
        let _ = (group, consumer);
        let deadline = now_ms() + block_ms as i64;
        loop {
            {
                let mut w = self.inner.write().await;
                let now = now_ms();
                if let Some(s) = w.streams.get_mut(stream) {
                    let mut out = Vec::new();
                    while out.len() < count {
                        let Some((id, message)) = s.fresh.pop_front() else {
                            break;
                        };
                        s.pending.insert(
                            id.clone(),
                            PendingEntry {
                                message: message.clone(),
                                delivery_count: 1,
                                last_delivery_ms: now,
                            },
                        );
                        out.push(StreamEnvelope {
                            id,
                            delivery_count: 1,
                            message,
                        });
                    }
                    if !out.is_empty() {
                        return Ok(out);
                    }
                }
            }
            if now_ms() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn stream_claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        idle_ms: u64,
        limit: usize,
    ) -> Result<Vec<StreamEnvelope>> {
        let _ = (group, consumer);
        let mut w = self.inner.write().await;
        let now = now_ms();
        let mut out = Vec::new();
        if let Some(s) = w.streams.get_mut(stream) {
            for (id, entry) in s.pending.iter_mut() {
                if out.len() >= limit {
                    break;
                }
                if now - entry.last_delivery_ms >= idle_ms as i64 {
                    entry.delivery_count += 1;
                    entry.last_delivery_ms = now;
                    out.push(StreamEnvelope {
                        id: id.clone(),
                        delivery_count: entry.delivery_count,
                        message: entry.message.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn stream_depth(&self, stream: &str) -> Result<u64> {
        let r = self.inner.read().await;
        Ok(r.streams
            .get(stream)
            .map(|s| (s.fresh.len() + s.pending.len()) as u64)
            .unwrap_or(0))
    }

    async fn sweep_expired(&self, now: Timestamp) -> Result<u64> {
        let mut w = self.inner.write().await;
        let expired: Vec<String> = w
            .jobs
            .iter()
            .filter(|(_, job)| job.expires_at.map(|at| at <= now).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in &expired {
            w.jobs.remove(job_id);
            w.state.remove(job_id);
            w.events.remove(job_id);
            w.event_seq.remove(job_id);
            w.ledgers.retain(|(jid, _, _), _| jid != job_id);
            w.guid_ledgers.retain(|(jid, _), _| jid != job_id);
            w.hooks.retain(|_, b| &b.job_id != job_id);
            w.timers.retain(|t| &t.job_id != job_id);
        }
        Ok(expired.len() as u64)
    }

    async fn commit(&self, ops: Vec<TxnOp>) -> Result<Vec<TxnReply>> {
        let mut w = self.inner.write().await;
        let now = now_ms();
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let reply = w.apply(op, now)?;
            if let TxnReply::Ledger(v) = reply {
                debug_assert!(
                    ledger::in_bounds(v) || v == ledger::ENTRY_DELTA,
                    "ledger out of bounds: {v}"
                );
            }
            replies.push(reply);
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_job(id: &str) -> Job {
        Job {
            job_id: id.to_string(),
            app_id: "test".to_string(),
            topic: "t".to_string(),
            generation_id: "gen-1".to_string(),
            semaphore: 1,
            error: None,
            parent: None,
            created_at: now_ms(),
            updated_at: now_ms(),
            expire_ms: None,
            expires_at: None,
        }
    }

    fn make_message(guid: &str) -> TransitionMessage {
        TransitionMessage {
            metadata: MessageMetadata {
                guid: guid.to_string(),
                jid: "j1".into(),
                gid: "gen-1".into(),
                dad: DimensionalAddress::root(),
                aid: "a1".into(),
                topic: None,
                spn: None,
                trc: None,
            },
            kind: MessageType::Transition,
            data: json!({}),
            policies: None,
        }
    }

    #[tokio::test]
    async fn create_job_if_absent_is_conditional() {
        let store = MemoryStore::new();
        let replies = store
            .commit(vec![TxnOp::CreateJobIfAbsent { job: make_job("j1") }])
            .await
            .unwrap();
        assert_eq!(
            replies[0],
            TxnReply::Created {
                created: true,
                semaphore: 1
            }
        );
        let replies = store
            .commit(vec![TxnOp::CreateJobIfAbsent { job: make_job("j1") }])
            .await
            .unwrap();
        assert_eq!(
            replies[0],
            TxnReply::Created {
                created: false,
                semaphore: 1
            }
        );
    }

    #[tokio::test]
    async fn ledger_increments_are_fetch_and_add() {
        let store = MemoryStore::new();
        let root = DimensionalAddress::root();
        let replies = store
            .commit(vec![TxnOp::IncrementLedger {
                job_id: "j1".into(),
                activity_id: "a1".into(),
                dads: vec![root.clone()],
                delta: ledger::BASE_SEED,
            }])
            .await
            .unwrap();
        assert_eq!(replies[0].ledger(), ledger::BASE_SEED);
        let replies = store
            .commit(vec![TxnOp::IncrementLedger {
                job_id: "j1".into(),
                activity_id: "a1".into(),
                dads: vec![root.clone()],
                delta: ledger::ENTRY_DELTA,
            }])
            .await
            .unwrap();
        assert_eq!(replies[0].ledger(), ledger::ENTRY_SEED);
        assert_eq!(
            store.read_activity_ledger("j1", "a1", &root).await.unwrap(),
            ledger::ENTRY_SEED
        );
        // Untrimmed and trimmed addresses resolve to the same ledger.
        let untrimmed = DimensionalAddress::parse(",0,0");
        assert_eq!(
            store
                .read_activity_ledger("j1", "a1", &untrimmed)
                .await
                .unwrap(),
            ledger::ENTRY_SEED
        );
    }

    #[tokio::test]
    async fn compound_primitive_sets_snapshot_exactly_once() {
        let store = MemoryStore::new();
        store
            .commit(vec![TxnOp::CreateJobIfAbsent { job: make_job("j1") }])
            .await
            .unwrap();
        // Semaphore 1 → 2: no crossing.
        let replies = store
            .commit(vec![TxnOp::SetStatusAndCollateGuid {
                job_id: "j1".into(),
                delta: 1,
                threshold: 0,
                guid: "g1".into(),
                snapshot_weight: ledger::SNAPSHOT_WEIGHT,
            }])
            .await
            .unwrap();
        assert!(!replies[0].threshold_hit());
        // 2 → 0 in two deltas; only the crossing one captures the bit.
        store
            .commit(vec![TxnOp::SetStatusAndCollateGuid {
                job_id: "j1".into(),
                delta: -1,
                threshold: 0,
                guid: "g2".into(),
                snapshot_weight: ledger::SNAPSHOT_WEIGHT,
            }])
            .await
            .unwrap();
        let replies = store
            .commit(vec![TxnOp::SetStatusAndCollateGuid {
                job_id: "j1".into(),
                delta: -1,
                threshold: 0,
                guid: "g3".into(),
                snapshot_weight: ledger::SNAPSHOT_WEIGHT,
            }])
            .await
            .unwrap();
        assert!(replies[0].threshold_hit());
        assert_eq!(store.read_guid_ledger("j1", "g2").await.unwrap(), 0);
        assert_eq!(
            store.read_guid_ledger("j1", "g3").await.unwrap(),
            ledger::SNAPSHOT_WEIGHT
        );
        // A further delta at the threshold does not re-capture.
        let replies = store
            .commit(vec![TxnOp::SetStatusAndCollateGuid {
                job_id: "j1".into(),
                delta: 0,
                threshold: 0,
                guid: "g4".into(),
                snapshot_weight: ledger::SNAPSHOT_WEIGHT,
            }])
            .await
            .unwrap();
        assert!(!replies[0].threshold_hit());
    }

    #[tokio::test]
    async fn flat_state_round_trip_with_semaphore() {
        let store = MemoryStore::new();
        store
            .commit(vec![TxnOp::CreateJobIfAbsent { job: make_job("j1") }])
            .await
            .unwrap();
        let root = DimensionalAddress::root();
        store
            .commit(vec![TxnOp::WriteFlatState {
                job_id: "j1".into(),
                dad: root.clone(),
                entries: vec![
                    ("a1.output".to_string(), json!({"ok": true})),
                    ("t1.input".to_string(), json!(7)),
                ],
            }])
            .await
            .unwrap();
        let (state, semaphore) = store
            .read_flat_state("j1", &["a1.output".to_string()], &root)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(semaphore, 1);
        assert_eq!(state.len(), 1);
        assert_eq!(state["a1.output"], json!({"ok": true}));
        // Empty path list reads everything.
        let (all, _) = store
            .read_flat_state("j1", &[], &root)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(all.len(), 2);
        // Unknown job reads None.
        assert!(store
            .read_flat_state("nope", &[], &root)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dimensional_state_falls_back_to_root() {
        let store = MemoryStore::new();
        store
            .commit(vec![TxnOp::CreateJobIfAbsent { job: make_job("j1") }])
            .await
            .unwrap();
        let root = DimensionalAddress::root();
        let iter1 = DimensionalAddress::parse(",0,1");
        store
            .commit(vec![
                TxnOp::WriteFlatState {
                    job_id: "j1".into(),
                    dad: root,
                    entries: vec![("seed".to_string(), json!("root"))],
                },
                TxnOp::WriteFlatState {
                    job_id: "j1".into(),
                    dad: iter1.clone(),
                    entries: vec![("a0.out".to_string(), json!("iter"))],
                },
            ])
            .await
            .unwrap();
        let (state, _) = store
            .read_flat_state("j1", &["seed".to_string(), "a0.out".to_string()], &iter1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state["seed"], json!("root"));
        assert_eq!(state["a0.out"], json!("iter"));
    }

    #[tokio::test]
    async fn stream_lifecycle() {
        let store = MemoryStore::new();
        store.stream_group_create("s", "engine").await.unwrap();
        store
            .commit(vec![
                TxnOp::StreamAppend {
                    stream: "s".into(),
                    message: make_message("g1"),
                },
                TxnOp::StreamAppend {
                    stream: "s".into(),
                    message: make_message("g2"),
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.stream_depth("s").await.unwrap(), 2);

        let batch = store.stream_read("s", "engine", "c1", 0, 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].delivery_count, 1);
        // Read again: nothing fresh, entries are pending.
        assert!(store
            .stream_read("s", "engine", "c1", 0, 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.stream_depth("s").await.unwrap(), 2);

        // Idle reclaim bumps the delivery count.
        let claimed = store
            .stream_claim_pending("s", "engine", "c2", 0, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].delivery_count, 2);

        // Ack-and-delete, idempotently.
        store
            .commit(vec![TxnOp::StreamAckDelete {
                stream: "s".into(),
                group: "engine".into(),
                id: batch[0].id.clone(),
            }])
            .await
            .unwrap();
        assert_eq!(store.stream_depth("s").await.unwrap(), 1);
        store
            .commit(vec![TxnOp::StreamAckDelete {
                stream: "s".into(),
                group: "engine".into(),
                id: batch[0].id.clone(),
            }])
            .await
            .unwrap();
        assert_eq!(store.stream_depth("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn timers_claim_only_due() {
        let store = MemoryStore::new();
        let now = now_ms();
        let make_timer = |activity: &str, deadline: Timestamp| TimerBinding {
            job_id: "j1".into(),
            activity_id: activity.into(),
            dad: DimensionalAddress::root(),
            deadline_ms: deadline,
        };
        store
            .commit(vec![
                TxnOp::RegisterTimer {
                    binding: make_timer("a1", now - 10),
                },
                TxnOp::RegisterTimer {
                    binding: make_timer("a2", now + 60_000),
                },
            ])
            .await
            .unwrap();
        let due = store.claim_due_timers(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].activity_id, "a1");
        // Claimed timers do not fire twice.
        assert!(store.claim_due_timers(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hooks_register_and_resolve() {
        let store = MemoryStore::new();
        let binding = HookBinding {
            topic: "T".into(),
            key: "j1".into(),
            job_id: "j1".into(),
            activity_id: "a1".into(),
            dad: DimensionalAddress::root(),
        };
        store
            .commit(vec![TxnOp::RegisterHook {
                binding: binding.clone(),
            }])
            .await
            .unwrap();
        assert_eq!(
            store.hook_by_key("T", "j1").await.unwrap(),
            Some(binding.clone())
        );
        assert_eq!(store.hooks_for_topic("T").await.unwrap(), vec![binding]);
        store
            .commit(vec![TxnOp::RemoveHook {
                topic: "T".into(),
                key: "j1".into(),
            }])
            .await
            .unwrap();
        assert!(store.hook_by_key("T", "j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_expired_jobs_completely() {
        let store = MemoryStore::new();
        let now = now_ms();
        store
            .commit(vec![
                TxnOp::CreateJobIfAbsent { job: make_job("j1") },
                TxnOp::IncrementGuidLedger {
                    job_id: "j1".into(),
                    guid: "g1".into(),
                    delta: ledger::REENTRY_WEIGHT,
                },
                TxnOp::ScheduleExpire {
                    job_id: "j1".into(),
                    at: now - 1,
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.sweep_expired(now).await.unwrap(), 1);
        assert!(store.read_job("j1").await.unwrap().is_none());
        assert_eq!(store.read_guid_ledger("j1", "g1").await.unwrap(), 0);
        // Jobs without an expiration survive.
        store
            .commit(vec![TxnOp::CreateJobIfAbsent { job: make_job("j2") }])
            .await
            .unwrap();
        assert_eq!(store.sweep_expired(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn event_log_is_append_only() {
        let store = MemoryStore::new();
        for i in 0..3 {
            let replies = store
                .commit(vec![TxnOp::AppendEvent {
                    job_id: "j1".into(),
                    event: JobEvent::StepCommitted {
                        activity_id: "a1".into(),
                        guid: format!("g{i}"),
                        step: 1,
                    },
                }])
                .await
                .unwrap();
            assert_eq!(replies[0], TxnReply::Seq(i + 1));
        }
        let events = store.read_events("j1", 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, 2);
    }

    #[tokio::test]
    async fn interrupt_sets_sentinel_and_error() {
        let store = MemoryStore::new();
        store
            .commit(vec![TxnOp::CreateJobIfAbsent { job: make_job("j1") }])
            .await
            .unwrap();
        store
            .commit(vec![TxnOp::MarkJobInterrupted {
                job_id: "j1".into(),
                error: Some(JobError {
                    code: codes::INTERRUPTED,
                    message: "user requested".into(),
                    stack: None,
                }),
            }])
            .await
            .unwrap();
        let job = store.read_job("j1").await.unwrap().unwrap();
        assert_eq!(job.semaphore, INTERRUPT_SENTINEL);
        assert_eq!(job.state(0), JobState::Interrupted);
    }
}
