//! The two-leg activity state machine.
//!
//! Every activity invocation follows the same protocol; only the durable
//! work differs by kind. Leg 1 notarizes entry, commits the kind's work in
//! one transaction together with the re-entry authorization (or an early
//! completion for kinds with no Leg 2), then acks. Leg 2 notarizes re-entry
//! against both the activity and GUID ledgers, then walks the three steps —
//! work, children + semaphore, completion tasks — skipping any step whose
//! marker proves a prior delivery already committed it. The ack is always
//! the final action: a crash at any point leaves a redeliverable message
//! and a ledger that says exactly how far the store got.

use crate::collator::{self, EntryDisposition, Stage};
use crate::error::{EngineError, EngineResult};
use crate::events::JobEvent;
use crate::graph::{ActivityConfig, ActivityKind, CompiledGraph, GraphRegistry, SignalScope};
use crate::ledger::{self, BASE_SEED, SNAPSHOT_WEIGHT, TRIGGER_SEED};
use crate::state::{self, consumed_paths, flatten, key_string, value_at};
use crate::store::{publish_stream, topic_stream, worker_stream, JobStore, TxnOp, TxnReply};
use crate::types::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Consumer group shared by engine-side stream consumers.
pub const ENGINE_GROUP: &str = "engine";

/// Result of processing one claimed envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Processed { job_closed: bool },
    /// Stale replay or generation mismatch; acked silently.
    Stale,
    /// Job missing, interrupted, or already closed; acked silently.
    Inactive,
}

/// The per-activity protocol driver. Holds no mutable state of its own:
/// every decision is derived from the store and the claimed message.
pub struct ActivityMachine {
    store: Arc<dyn JobStore>,
    graphs: Arc<GraphRegistry>,
}

impl ActivityMachine {
    pub fn new(store: Arc<dyn JobStore>, graphs: Arc<GraphRegistry>) -> Self {
        Self { store, graphs }
    }

    fn guid() -> String {
        Uuid::now_v7().to_string()
    }

    /// Dimensional addresses a Leg 2 re-entry tick applies to: the
    /// invocation's own subspace first, then every ancestor prefix, so base
    /// subspaces accumulate the total re-entry count cycles index by.
    fn reentry_addresses(dad: &DimensionalAddress) -> Vec<DimensionalAddress> {
        let segs = dad.trimmed().segments();
        let mut out = Vec::with_capacity(segs.len());
        for len in (1..=segs.len()).rev() {
            let mut s = String::new();
            for seg in &segs[..len] {
                s.push(',');
                s.push_str(&seg.to_string());
            }
            out.push(DimensionalAddress::parse(&s).trimmed());
        }
        out.dedup();
        out
    }

    /// Whether a message should ack silently because its job is gone.
    /// Interrupted jobs drop everything; a job at its completion threshold
    /// drops only messages that never started — a guid with committed
    /// progress is mid-flight (it may hold the snapshot bit) and must
    /// resume.
    async fn is_inactive_for(
        &self,
        graph: &CompiledGraph,
        job: &Job,
        job_id: &str,
        guid: &str,
    ) -> EngineResult<bool> {
        if job.semaphore <= INTERRUPT_SENTINEL {
            return Ok(true);
        }
        if job.semaphore > graph.completion_threshold {
            return Ok(false);
        }
        let guid_value = self.store.read_guid_ledger(job_id, guid).await?;
        Ok(guid_value == 0)
    }

    async fn ack(&self, stream: &str, env: &StreamEnvelope) -> EngineResult<()> {
        if env.id.is_empty() {
            // Synthesized envelope (inline trigger): nothing to ack.
            return Ok(());
        }
        self.store
            .commit(vec![TxnOp::StreamAckDelete {
                stream: stream.to_string(),
                group: ENGINE_GROUP.to_string(),
                id: env.id.clone(),
            }])
            .await?;
        Ok(())
    }

    /// Process one claimed envelope from `graph`'s topic stream.
    pub async fn process(
        &self,
        graph: &CompiledGraph,
        env: &StreamEnvelope,
    ) -> EngineResult<Outcome> {
        let msg = &env.message;
        let config = graph
            .activity(&msg.metadata.aid)
            .ok_or_else(|| EngineError::ActivityNotFound(msg.metadata.aid.clone()))?
            .clone();

        if config.kind == ActivityKind::Trigger {
            return self.trigger_leg1(graph, &config, env).await;
        }
        match msg.kind {
            MessageType::Transition => self.leg1(graph, &config, env).await,
            MessageType::Response => self.leg2_entry(graph, &config, env).await,
            MessageType::Await => {
                // AWAIT traffic belongs on worker streams, never here.
                Err(EngineError::Collation(
                    crate::error::CollationFault::Invalid,
                ))
            }
        }
    }

    // ─── Trigger ──────────────────────────────────────────────

    /// Trigger Leg 1: conditional job creation plus a GUID-ledger seed in
    /// one commit, then the whole dispatch (state, children, semaphore) in
    /// a second. Crash recovery resumes from the GUID markers; a duplicate
    /// start (existing job, fresh guid) surfaces `DuplicateJob`.
    async fn trigger_leg1(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
    ) -> EngineResult<Outcome> {
        let msg = &env.message;
        let meta = &msg.metadata;
        let stream = topic_stream(&graph.subscribes);
        let now = now_ms();

        let parent: Option<ParentRef> = msg
            .data
            .get("$parent")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let expire_ms = msg.data.get("$expire").and_then(Value::as_i64);
        let pending = msg
            .data
            .get("$pending")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let job = Job {
            job_id: meta.jid.clone(),
            app_id: graph.subscribes.clone(),
            topic: graph.subscribes.clone(),
            generation_id: Self::guid(),
            semaphore: 1,
            error: None,
            parent,
            created_at: now,
            updated_at: now,
            expire_ms,
            expires_at: None,
        };
        let replies = self
            .store
            .commit(vec![
                TxnOp::CreateJobIfAbsent { job: job.clone() },
                TxnOp::IncrementGuidLedger {
                    job_id: meta.jid.clone(),
                    guid: meta.guid.clone(),
                    delta: ledger::REENTRY_WEIGHT,
                },
            ])
            .await?;
        let created = matches!(replies[0], TxnReply::Created { created: true, .. });
        let guid_post = replies[1].ledger();

        if !created && guid_post <= ledger::REENTRY_WEIGHT {
            // No crash-recovery signature: this guid never touched the job.
            return Err(EngineError::DuplicateJob(meta.jid.clone()));
        }
        if !created {
            tracing::info!(job_id = %meta.jid, guid = %meta.guid, "trigger crash recovery");
        }

        let job = match self.store.read_job(&meta.jid).await? {
            Some(j) => j,
            None => return Err(EngineError::JobNotFound(meta.jid.clone())),
        };

        let mut job_closed = ledger::snapshot_set(guid_post);
        if !ledger::step2_done(guid_post) {
            // Flatten the start payload, stripping the engine's own keys.
            let mut entries: Vec<(String, Value)> = Vec::new();
            if let Value::Object(map) = &msg.data {
                for (k, v) in map {
                    if k.starts_with('$') {
                        continue;
                    }
                    entries.extend(flatten(&format!("{}.{k}", config.id), v));
                }
            }
            if let Some(Value::Object(search)) = msg.data.get("$search") {
                for (k, v) in search {
                    entries.push((k.clone(), v.clone()));
                }
            }
            entries.push(("$start.guid".to_string(), json!(meta.guid)));

            let eval_state: BTreeMap<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let targets: Vec<ActivityConfig> = if pending {
                Vec::new()
            } else {
                graph
                    .qualifying_targets(&config.id, &eval_state)
                    .into_iter()
                    .cloned()
                    .collect()
            };

            let mut ops = vec![
                TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dads: vec![meta.dad.trimmed()],
                    delta: TRIGGER_SEED,
                },
                TxnOp::WriteFlatState {
                    job_id: meta.jid.clone(),
                    dad: meta.dad.trimmed(),
                    entries,
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::JobCreated {
                        job_id: meta.jid.clone(),
                        topic: graph.subscribes.clone(),
                        generation_id: job.generation_id.clone(),
                    },
                },
            ];
            let child_dad = meta.dad.push(0).trimmed();
            let n = targets.len() as i64;
            self.push_child_ops(
                &mut ops,
                graph,
                &job,
                &config.id,
                &targets,
                &child_dad,
            );
            if !pending {
                ops.push(TxnOp::SetStatusAndCollateGuid {
                    job_id: meta.jid.clone(),
                    delta: n - 1,
                    threshold: graph.completion_threshold,
                    guid: meta.guid.clone(),
                    snapshot_weight: SNAPSHOT_WEIGHT,
                });
                ops.push(TxnOp::IncrementGuidLedger {
                    job_id: meta.jid.clone(),
                    guid: meta.guid.clone(),
                    delta: ledger::STEP1_WEIGHT + ledger::STEP2_WEIGHT,
                });
            } else {
                ops.push(TxnOp::IncrementGuidLedger {
                    job_id: meta.jid.clone(),
                    guid: meta.guid.clone(),
                    delta: ledger::STEP1_WEIGHT,
                });
            }
            let replies = self.store.commit(ops).await?;
            job_closed = replies
                .iter()
                .any(|r| matches!(r, TxnReply::ThresholdHit(true)));
        }

        if job_closed && !ledger::step3_done(guid_post) {
            self.run_completion_tasks(graph, &meta.jid, &meta.guid, None)
                .await?;
        }

        self.ack(&stream, env).await?;
        Ok(Outcome::Processed { job_closed })
    }

    // ─── Leg 1 ────────────────────────────────────────────────

    async fn leg1(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
    ) -> EngineResult<Outcome> {
        let msg = &env.message;
        let meta = &msg.metadata;
        let stream = topic_stream(&graph.subscribes);

        let Some(job) = self.store.read_job(&meta.jid).await? else {
            tracing::info!(job_id = %meta.jid, "leg 1 for missing job; acking");
            self.ack(&stream, env).await?;
            return Ok(Outcome::Inactive);
        };
        if job.generation_id != meta.gid {
            tracing::info!(job_id = %meta.jid, "stale generation; acking");
            self.ack(&stream, env).await?;
            return Ok(Outcome::Stale);
        }
        if self.is_inactive_for(graph, &job, &meta.jid, &meta.guid).await? {
            self.ack(&stream, env).await?;
            return Ok(Outcome::Inactive);
        }

        let dad = meta.dad.trimmed();
        let current = self
            .store
            .read_activity_ledger(&meta.jid, &config.id, &dad)
            .await?;
        collator::ensure_entry_capacity(&config.id, current, env.delivery_count)?;
        let replies = self
            .store
            .commit(vec![TxnOp::IncrementLedger {
                job_id: meta.jid.clone(),
                activity_id: config.id.clone(),
                dads: vec![dad.clone()],
                delta: Stage::Entry.activity_delta(),
            }])
            .await?;
        let inline_duplex = matches!(config.kind, ActivityKind::Iterate)
            || (config.kind == ActivityKind::Await && config.child_topic.is_none());
        let attempts = match collator::verify_entry(&config.id, replies[0].ledger())? {
            EntryDisposition::Proceed { attempts } => attempts,
            EntryDisposition::StaleReplay if inline_duplex => {
                // Leg 1 committed under an earlier delivery of this same
                // message; resume Leg 2 on its guid instead of acking, so a
                // crash between the two legs loses nothing.
                return self.leg2(graph, config, env, msg.data.clone()).await;
            }
            EntryDisposition::StaleReplay => {
                self.ack(&stream, env).await?;
                return Ok(Outcome::Stale);
            }
        };

        let entered = TxnOp::AppendEvent {
            job_id: meta.jid.clone(),
            event: JobEvent::Leg1Entered {
                activity_id: config.id.clone(),
                dad: dad.clone(),
                attempts,
            },
        };

        match config.kind {
            ActivityKind::Worker => {
                self.worker_leg1(graph, config, env, &job, entered).await
            }
            ActivityKind::Hook => self.hook_leg1(graph, config, env, entered).await,
            ActivityKind::Cycle => self.cycle_leg1(graph, config, env, entered).await,
            ActivityKind::Signal => self.signal_leg1(graph, config, env, &job, entered).await,
            ActivityKind::Interrupt => self.interrupt_leg1(graph, config, env, entered).await,
            ActivityKind::Await if config.child_topic.is_some() => {
                self.child_await_leg1(graph, config, env, &job, entered).await
            }
            ActivityKind::Await | ActivityKind::Iterate => {
                // Plain duplex: authorize re-entry, then run Leg 2 on the
                // same claimed message and guid.
                self.store
                    .commit(vec![
                        entered,
                        TxnOp::IncrementLedger {
                            job_id: meta.jid.clone(),
                            activity_id: config.id.clone(),
                            dads: vec![dad.clone()],
                            delta: Stage::AuthorizeReentry.activity_delta(),
                        },
                        TxnOp::AppendEvent {
                            job_id: meta.jid.clone(),
                            event: JobEvent::Leg1Completed {
                                activity_id: config.id.clone(),
                                dad: dad.clone(),
                            },
                        },
                    ])
                    .await?;
                self.leg2(graph, config, env, msg.data.clone()).await
            }
            ActivityKind::Trigger => unreachable!("trigger handled above"),
        }
    }

    async fn worker_leg1(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
        _job: &Job,
        entered: TxnOp,
    ) -> EngineResult<Outcome> {
        let meta = &env.message.metadata;
        let stream = topic_stream(&graph.subscribes);
        let dad = meta.dad.trimmed();
        let worker_topic = config
            .worker_topic
            .clone()
            .ok_or_else(|| EngineError::ActivityNotFound(config.id.clone()))?;

        let paths = consumed_paths(&config.consumes);
        let input = match self
            .store
            .read_flat_state(&meta.jid, &paths, &dad)
            .await?
        {
            Some((state, _)) => state::materialize(state),
            None => json!({}),
        };
        let await_guid = Self::guid();
        self.store
            .commit(vec![
                entered,
                TxnOp::StreamAppend {
                    stream: worker_stream(&worker_topic),
                    message: TransitionMessage {
                        metadata: MessageMetadata {
                            guid: await_guid.clone(),
                            jid: meta.jid.clone(),
                            gid: meta.gid.clone(),
                            dad: dad.clone(),
                            aid: config.id.clone(),
                            topic: Some(worker_topic.clone()),
                            spn: meta.spn.clone(),
                            trc: meta.trc.clone(),
                        },
                        kind: MessageType::Await,
                        data: json!({ "input": input, "tryCount": 0 }),
                        policies: config.retry.clone(),
                    },
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::WorkerDispatched {
                        activity_id: config.id.clone(),
                        topic: worker_topic,
                        guid: await_guid,
                    },
                },
                TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dads: vec![dad.clone()],
                    delta: Stage::AuthorizeReentry.activity_delta(),
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::Leg1Completed {
                        activity_id: config.id.clone(),
                        dad,
                    },
                },
            ])
            .await?;
        self.ack(&stream, env).await?;
        Ok(Outcome::Processed { job_closed: false })
    }

    async fn hook_leg1(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
        entered: TxnOp,
    ) -> EngineResult<Outcome> {
        let meta = &env.message.metadata;
        let stream = topic_stream(&graph.subscribes);
        let dad = meta.dad.trimmed();
        let hook = config
            .hook
            .clone()
            .ok_or_else(|| EngineError::ActivityNotFound(config.id.clone()))?;

        let mut ops = vec![entered];
        if let Some(topic) = &hook.topic {
            let key = match &hook.key_path {
                Some(path) => {
                    let read = self
                        .store
                        .read_flat_state(&meta.jid, &[path.clone()], &dad)
                        .await?;
                    read.and_then(|(state, _)| state.get(path).map(key_string))
                        .unwrap_or_else(|| meta.jid.clone())
                }
                None => meta.jid.clone(),
            };
            ops.push(TxnOp::RegisterHook {
                binding: HookBinding {
                    topic: topic.clone(),
                    key: key.clone(),
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dad: dad.clone(),
                },
            });
            ops.push(TxnOp::AppendEvent {
                job_id: meta.jid.clone(),
                event: JobEvent::HookRegistered {
                    activity_id: config.id.clone(),
                    topic: topic.clone(),
                    key,
                },
            });
        }
        if let Some(sleep_ms) = hook.sleep_ms {
            let deadline = now_ms() + sleep_ms;
            ops.push(TxnOp::RegisterTimer {
                binding: TimerBinding {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dad: dad.clone(),
                    deadline_ms: deadline,
                },
            });
            ops.push(TxnOp::AppendEvent {
                job_id: meta.jid.clone(),
                event: JobEvent::TimerRegistered {
                    activity_id: config.id.clone(),
                    deadline_ms: deadline,
                },
            });
        }
        ops.push(TxnOp::IncrementLedger {
            job_id: meta.jid.clone(),
            activity_id: config.id.clone(),
            dads: vec![dad.clone()],
            delta: Stage::AuthorizeReentry.activity_delta(),
        });
        ops.push(TxnOp::AppendEvent {
            job_id: meta.jid.clone(),
            event: JobEvent::Leg1Completed {
                activity_id: config.id.clone(),
                dad,
            },
        });
        self.store.commit(ops).await?;
        self.ack(&stream, env).await?;
        Ok(Outcome::Processed { job_closed: false })
    }

    /// Cycle Leg 1: prime the ancestor at one past its accumulated
    /// dimensional index and re-target it with a fresh Leg 1 message, all
    /// bundled with this activity's early exit.
    async fn cycle_leg1(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
        entered: TxnOp,
    ) -> EngineResult<Outcome> {
        let meta = &env.message.metadata;
        let stream = topic_stream(&graph.subscribes);
        let dad = meta.dad.trimmed();
        let ancestor_id = config
            .cycle_ancestor
            .clone()
            .ok_or_else(|| EngineError::ActivityNotFound(config.id.clone()))?;
        let ancestor = graph
            .activity(&ancestor_id)
            .ok_or_else(|| EngineError::ActivityNotFound(ancestor_id.clone()))?;

        // The ancestor's base subspace accumulates every re-entry tick, so
        // its dimensional index names the last iteration.
        let depth = ancestor.ancestors.len();
        let mut base_segs = dad.segments();
        base_segs.truncate(depth + 1);
        while base_segs.len() < depth + 1 {
            base_segs.push(0);
        }
        base_segs[depth] = 0;
        let base = segments_to_dad(&base_segs).trimmed();
        let base_ledger = self
            .store
            .read_activity_ledger(&meta.jid, &ancestor_id, &base)
            .await?;
        let index = ledger::dimensional_index(base_ledger);
        if index >= 98 {
            return Err(EngineError::Collation(
                crate::error::CollationFault::Invalid,
            ));
        }
        base_segs[depth] = (index + 1).max(0) as u32;
        let new_dad = segments_to_dad(&base_segs);

        self.store
            .commit(vec![
                entered,
                TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: ancestor_id.clone(),
                    dads: vec![new_dad.clone()],
                    delta: BASE_SEED,
                },
                TxnOp::StreamAppend {
                    stream: stream.clone(),
                    message: TransitionMessage {
                        metadata: MessageMetadata {
                            guid: Self::guid(),
                            jid: meta.jid.clone(),
                            gid: meta.gid.clone(),
                            dad: new_dad.clone(),
                            aid: ancestor_id.clone(),
                            topic: None,
                            spn: meta.spn.clone(),
                            trc: meta.trc.clone(),
                        },
                        kind: MessageType::Transition,
                        data: env.message.data.clone(),
                        policies: None,
                    },
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::CycleReentered {
                        activity_id: config.id.clone(),
                        ancestor_id,
                        dad: new_dad,
                    },
                },
                TxnOp::SetStatusAndCollateGuid {
                    job_id: meta.jid.clone(),
                    delta: 0,
                    threshold: graph.completion_threshold,
                    guid: meta.guid.clone(),
                    snapshot_weight: SNAPSHOT_WEIGHT,
                },
                TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dads: vec![dad.clone()],
                    delta: Stage::EarlyExit.activity_delta(),
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::Leg1Completed {
                        activity_id: config.id.clone(),
                        dad,
                    },
                },
            ])
            .await?;
        self.ack(&stream, env).await?;
        Ok(Outcome::Processed { job_closed: false })
    }

    async fn signal_leg1(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
        job: &Job,
        entered: TxnOp,
    ) -> EngineResult<Outcome> {
        let meta = &env.message.metadata;
        let stream = topic_stream(&graph.subscribes);
        let dad = meta.dad.trimmed();
        let spec = config
            .signal
            .clone()
            .ok_or_else(|| EngineError::ActivityNotFound(config.id.clone()))?;
        // The delivered payload is the incoming message data, falling back
        // to the projection of consumed state for bare transitions.
        let payload = match &env.message.data {
            Value::Object(map) if !map.is_empty() => env.message.data.clone(),
            _ => {
                let paths = consumed_paths(&config.consumes);
                match self.store.read_flat_state(&meta.jid, &paths, &dad).await? {
                    Some((state, _)) => state::materialize(
                        state.into_iter().filter(|(p, _)| !p.starts_with('$')),
                    ),
                    None => json!({}),
                }
            }
        };

        let mut ops = vec![entered];
        let mut incomplete = false;
        match spec.scope {
            SignalScope::One => {
                // Without a key path the signal correlates to its own job's
                // hooks (the wake-my-sibling pattern).
                let key = match spec.key_path.as_deref() {
                    Some(path) => value_at(&payload, path).map(key_string),
                    None => Some(meta.jid.clone()),
                };
                match key {
                    Some(key) => {
                        if let Some(binding) = self.store.hook_by_key(&spec.topic, &key).await? {
                            self.push_signal_delivery(&mut ops, meta, &binding, &payload)
                                .await?;
                        } else {
                            tracing::warn!(topic = %spec.topic, key, "signal-one matched no hook");
                        }
                    }
                    None => {
                        tracing::warn!(topic = %spec.topic, "signal payload carries no key");
                        incomplete = true;
                    }
                }
            }
            SignalScope::All => {
                // Best-effort: each target gets its own commit; failures are
                // logged and the rest proceed.
                let bindings = self.store.hooks_for_topic(&spec.topic).await?;
                for binding in bindings {
                    let mut delivery = Vec::new();
                    if self
                        .push_signal_delivery(&mut delivery, meta, &binding, &payload)
                        .await
                        .is_ok()
                    {
                        if let Err(e) = self.store.commit(delivery).await {
                            tracing::error!(
                                topic = %spec.topic,
                                target = %binding.job_id,
                                error = %e,
                                "signal-all delivery failed; continuing"
                            );
                        }
                    }
                }
            }
        }
        if incomplete {
            ops.push(TxnOp::SetJobError {
                job_id: meta.jid.clone(),
                error: JobError {
                    code: codes::INCOMPLETE_SIGNAL,
                    message: format!("signal {} resolved no correlation key", config.id),
                    stack: None,
                },
            });
        }

        // Signals are fire-and-forget: children and the semaphore delta
        // commit with the Leg 1 completion marker.
        let cond_paths = graph.condition_paths(&config.id);
        let eval_state = match self
            .store
            .read_flat_state(&meta.jid, &cond_paths, &dad)
            .await?
        {
            Some((s, _)) => s,
            None => BTreeMap::new(),
        };
        let targets: Vec<ActivityConfig> = graph
            .qualifying_targets(&config.id, &eval_state)
            .into_iter()
            .cloned()
            .collect();
        let child_dad = dad.push(0).trimmed();
        let n = targets.len() as i64;
        self.push_child_ops(&mut ops, graph, job, &config.id, &targets, &child_dad);
        ops.push(TxnOp::SetStatusAndCollateGuid {
            job_id: meta.jid.clone(),
            delta: n - 1,
            threshold: graph.completion_threshold,
            guid: meta.guid.clone(),
            snapshot_weight: SNAPSHOT_WEIGHT,
        });
        ops.push(TxnOp::IncrementLedger {
            job_id: meta.jid.clone(),
            activity_id: config.id.clone(),
            dads: vec![dad.clone()],
            delta: Stage::EarlyCompletion {
                cyclic: config.cyclic,
            }
            .activity_delta(),
        });
        ops.push(TxnOp::AppendEvent {
            job_id: meta.jid.clone(),
            event: JobEvent::Leg1Completed {
                activity_id: config.id.clone(),
                dad,
            },
        });
        let replies = self.store.commit(ops).await?;
        let job_closed = replies
            .iter()
            .any(|r| matches!(r, TxnReply::ThresholdHit(true)));
        if job_closed {
            self.run_completion_tasks(graph, &meta.jid, &meta.guid, None)
                .await?;
        }
        self.ack(&stream, env).await?;
        Ok(Outcome::Processed { job_closed })
    }

    async fn push_signal_delivery(
        &self,
        ops: &mut Vec<TxnOp>,
        meta: &MessageMetadata,
        binding: &HookBinding,
        payload: &Value,
    ) -> EngineResult<()> {
        let Some(target_job) = self.store.read_job(&binding.job_id).await? else {
            tracing::warn!(target = %binding.job_id, "hooked job vanished; dropping binding");
            ops.push(TxnOp::RemoveHook {
                topic: binding.topic.clone(),
                key: binding.key.clone(),
            });
            return Ok(());
        };
        ops.push(TxnOp::StreamAppend {
            stream: topic_stream(&target_job.topic),
            message: TransitionMessage {
                metadata: MessageMetadata {
                    guid: Self::guid(),
                    jid: binding.job_id.clone(),
                    gid: target_job.generation_id.clone(),
                    dad: binding.dad.clone(),
                    aid: binding.activity_id.clone(),
                    topic: Some(binding.topic.clone()),
                    spn: meta.spn.clone(),
                    trc: meta.trc.clone(),
                },
                kind: MessageType::Response,
                data: payload.clone(),
                policies: None,
            },
        });
        ops.push(TxnOp::RemoveHook {
            topic: binding.topic.clone(),
            key: binding.key.clone(),
        });
        ops.push(TxnOp::AppendEvent {
            job_id: meta.jid.clone(),
            event: JobEvent::SignalDelivered {
                topic: binding.topic.clone(),
                target_activity_id: binding.activity_id.clone(),
                target_job_id: binding.job_id.clone(),
            },
        });
        Ok(())
    }

    async fn interrupt_leg1(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
        entered: TxnOp,
    ) -> EngineResult<Outcome> {
        let meta = &env.message.metadata;
        let stream = topic_stream(&graph.subscribes);
        let dad = meta.dad.trimmed();
        let reason = env
            .message
            .data
            .get("reason")
            .and_then(Value::as_str)
            .map(String::from);

        self.store
            .commit(vec![
                entered,
                TxnOp::MarkJobInterrupted {
                    job_id: meta.jid.clone(),
                    error: Some(JobError {
                        code: codes::INTERRUPTED,
                        message: reason.clone().unwrap_or_else(|| "interrupted".to_string()),
                        stack: None,
                    }),
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::Interrupted {
                        reason: reason.clone(),
                    },
                },
                TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dads: vec![dad.clone()],
                    delta: Stage::EarlyCompletion { cyclic: false }.activity_delta(),
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::Leg1Completed {
                        activity_id: config.id.clone(),
                        dad,
                    },
                },
            ])
            .await?;
        self.wake_hooks(&meta.jid).await?;
        self.ack(&stream, env).await?;
        Ok(Outcome::Processed { job_closed: false })
    }

    /// Wake every paused hook of a job with an INTERRUPTED response; the
    /// resulting Leg 2 deliveries observe the sentinel and ack silently.
    pub async fn wake_hooks(&self, job_id: &str) -> EngineResult<()> {
        let Some(job) = self.store.read_job(job_id).await? else {
            return Ok(());
        };
        for binding in self.store.hooks_for_job(job_id).await? {
            self.store
                .commit(vec![
                    TxnOp::StreamAppend {
                        stream: topic_stream(&job.topic),
                        message: TransitionMessage {
                            metadata: MessageMetadata {
                                guid: Self::guid(),
                                jid: job_id.to_string(),
                                gid: job.generation_id.clone(),
                                dad: binding.dad.clone(),
                                aid: binding.activity_id.clone(),
                                topic: Some(binding.topic.clone()),
                                spn: None,
                                trc: None,
                            },
                            kind: MessageType::Response,
                            data: json!({ "code": codes::INTERRUPTED }),
                            policies: None,
                        },
                    },
                    TxnOp::RemoveHook {
                        topic: binding.topic.clone(),
                        key: binding.key.clone(),
                    },
                ])
                .await?;
        }
        Ok(())
    }

    async fn child_await_leg1(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
        _job: &Job,
        entered: TxnOp,
    ) -> EngineResult<Outcome> {
        let meta = &env.message.metadata;
        let stream = topic_stream(&graph.subscribes);
        let dad = meta.dad.trimmed();
        let child_topic = config
            .child_topic
            .clone()
            .ok_or_else(|| EngineError::ActivityNotFound(config.id.clone()))?;
        let child_graph = self
            .graphs
            .get(&child_topic)
            .ok_or_else(|| EngineError::GraphNotFound(child_topic.clone()))?;

        let paths = consumed_paths(&config.consumes);
        let input = match self.store.read_flat_state(&meta.jid, &paths, &dad).await? {
            Some((state, _)) => state::materialize(state),
            None => json!({}),
        };
        // Deterministic child id: a Leg 1 retry reuses it, and the child's
        // own conditional insert dedupes.
        let child_jid = format!("{}:{}", meta.jid, config.id);
        let dispatch_guid = Self::guid();
        let parent = ParentRef {
            job_id: meta.jid.clone(),
            activity_id: config.id.clone(),
            topic: graph.subscribes.clone(),
            dad: dad.clone(),
            guid: dispatch_guid.clone(),
        };
        self.store
            .commit(vec![
                entered,
                TxnOp::StreamAppend {
                    stream: topic_stream(&child_topic),
                    message: TransitionMessage {
                        metadata: MessageMetadata {
                            guid: dispatch_guid,
                            jid: child_jid.clone(),
                            gid: String::new(),
                            dad: DimensionalAddress::root(),
                            aid: child_graph.trigger_id.clone(),
                            topic: Some(child_topic.clone()),
                            spn: meta.spn.clone(),
                            trc: meta.trc.clone(),
                        },
                        kind: MessageType::Transition,
                        data: json!({ "input": input, "$parent": parent }),
                        policies: None,
                    },
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::ChildJobStarted {
                        activity_id: config.id.clone(),
                        child_topic,
                        child_job_id: child_jid,
                    },
                },
                TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dads: vec![dad.clone()],
                    delta: Stage::AuthorizeReentry.activity_delta(),
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::Leg1Completed {
                        activity_id: config.id.clone(),
                        dad,
                    },
                },
            ])
            .await?;
        self.ack(&stream, env).await?;
        Ok(Outcome::Processed { job_closed: false })
    }

    // ─── Leg 2 ────────────────────────────────────────────────

    async fn leg2_entry(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
    ) -> EngineResult<Outcome> {
        let msg = &env.message;
        let meta = &msg.metadata;
        let stream = topic_stream(&graph.subscribes);

        let Some(job) = self.store.read_job(&meta.jid).await? else {
            self.ack(&stream, env).await?;
            return Ok(Outcome::Inactive);
        };
        if job.generation_id != meta.gid {
            self.ack(&stream, env).await?;
            return Ok(Outcome::Stale);
        }
        if self.is_inactive_for(graph, &job, &meta.jid, &meta.guid).await? {
            tracing::info!(job_id = %meta.jid, "leg 2 for inactive job; acking");
            self.ack(&stream, env).await?;
            return Ok(Outcome::Inactive);
        }

        // Retryable worker errors re-dispatch before the steps run.
        let code = msg.code();
        if config.kind == ActivityKind::Worker && codes::is_retryable(code) {
            let try_count = msg
                .data
                .get("tryCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            let max = config
                .retry
                .clone()
                .unwrap_or_default()
                .maximum_attempts;
            if try_count + 1 < max {
                return self.worker_retry_leg2(graph, config, env, try_count).await;
            }
            // Retries exhausted: surface as MAXED.
            let mut data = msg.data.clone();
            if let Value::Object(map) = &mut data {
                map.insert("code".to_string(), json!(codes::MAXED));
            }
            tracing::warn!(activity_id = %config.id, try_count, "worker retries exhausted");
            return self.leg2(graph, config, env, data).await;
        }

        self.leg2(graph, config, env, msg.data.clone()).await
    }

    /// The three-step Leg 2 core, shared by every duplex kind.
    async fn leg2(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
        data: Value,
    ) -> EngineResult<Outcome> {
        let meta = &env.message.metadata;
        let stream = topic_stream(&graph.subscribes);
        let dad = meta.dad.trimmed();
        let guid = &meta.guid;
        let code = data
            .get("code")
            .and_then(Value::as_u64)
            .map(|c| c as u16)
            .unwrap_or(codes::SUCCESS);
        let is_error = code >= 400 && code != codes::PENDING;

        let current = self
            .store
            .read_activity_ledger(&meta.jid, &config.id, &dad)
            .await?;
        collator::ensure_reentry_capacity(&config.id, current)?;

        let replies = self
            .store
            .commit(vec![
                TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dads: Self::reentry_addresses(&dad),
                    delta: Stage::Reentry.activity_delta(),
                },
                TxnOp::IncrementGuidLedger {
                    job_id: meta.jid.clone(),
                    guid: guid.clone(),
                    delta: ledger::REENTRY_WEIGHT,
                },
            ])
            .await?;
        let act_post = replies[0].ledger();
        let guid_post = replies[1].ledger();
        match collator::verify_reentry(&config.id, act_post, guid_post, config.cyclic) {
            Ok(_) => {}
            Err(e) if e.is_silent_ack() => {
                self.ack(&stream, env).await?;
                return Ok(Outcome::Stale);
            }
            Err(e) => return Err(e),
        }

        // Step 1 — durable work.
        if !ledger::step1_done(guid_post) {
            let mut entries = flatten(&format!("{}.output", config.id), &data);
            entries.retain(|(p, _)| p != &format!("{}.output.code", config.id));
            let mut ops = vec![
                TxnOp::WriteFlatState {
                    job_id: meta.jid.clone(),
                    dad: dad.clone(),
                    entries,
                },
                TxnOp::IncrementGuidLedger {
                    job_id: meta.jid.clone(),
                    guid: guid.clone(),
                    delta: Stage::Step1.activity_delta(),
                },
                TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dads: vec![dad.clone()],
                    delta: Stage::Step1.activity_delta(),
                },
                TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::StepCommitted {
                        activity_id: config.id.clone(),
                        guid: guid.clone(),
                        step: 1,
                    },
                },
            ];
            if is_error {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("activity error")
                    .to_string();
                ops.push(TxnOp::SetJobError {
                    job_id: meta.jid.clone(),
                    error: JobError {
                        code,
                        message: message.clone(),
                        stack: data.get("stack").and_then(Value::as_str).map(String::from),
                    },
                });
                ops.push(TxnOp::AppendEvent {
                    job_id: meta.jid.clone(),
                    event: JobEvent::ErrorRecorded {
                        activity_id: config.id.clone(),
                        code,
                        message,
                    },
                });
            }
            self.store.commit(ops).await?;
        }

        // Pending hook: stay open, re-register, and wait for the next
        // signal; no children, no semaphore movement.
        if code == codes::PENDING && config.cyclic {
            if !ledger::step2_done(guid_post) {
                let mut ops = vec![
                    TxnOp::IncrementGuidLedger {
                        job_id: meta.jid.clone(),
                        guid: guid.clone(),
                        delta: Stage::Step2.activity_delta(),
                    },
                    TxnOp::IncrementLedger {
                        job_id: meta.jid.clone(),
                        activity_id: config.id.clone(),
                        dads: vec![dad.clone()],
                        delta: Stage::Step2.activity_delta()
                            + Stage::Completion { cyclic: true }.activity_delta(),
                    },
                ];
                if let Some(hook) = &config.hook {
                    if let Some(topic) = &hook.topic {
                        let key = match &hook.key_path {
                            Some(path) => self
                                .store
                                .read_flat_state(&meta.jid, &[path.clone()], &dad)
                                .await?
                                .and_then(|(state, _)| state.get(path).map(key_string))
                                .unwrap_or_else(|| meta.jid.clone()),
                            None => meta.jid.clone(),
                        };
                        ops.push(TxnOp::RegisterHook {
                            binding: HookBinding {
                                topic: topic.clone(),
                                key,
                                job_id: meta.jid.clone(),
                                activity_id: config.id.clone(),
                                dad: dad.clone(),
                            },
                        });
                    }
                }
                self.store.commit(ops).await?;
            }
            self.ack(&stream, env).await?;
            return Ok(Outcome::Processed { job_closed: false });
        }

        // Step 2 — children + semaphore, one compound commit.
        let job_closed;
        if !ledger::step2_done(guid_post) {
            let cond_paths = graph.condition_paths(&config.id);
            let eval_state = match self
                .store
                .read_flat_state(&meta.jid, &cond_paths, &dad)
                .await?
            {
                Some((s, _)) => s,
                None => BTreeMap::new(),
            };
            let targets: Vec<ActivityConfig> = if is_error {
                Vec::new()
            } else {
                graph
                    .qualifying_targets(&config.id, &eval_state)
                    .into_iter()
                    .cloned()
                    .collect()
            };
            let cycle_index = ledger::dimensional_index(act_post).max(0) as u32;
            let child_dad = dad.push(cycle_index).trimmed();

            let job = self
                .store
                .read_job(&meta.jid)
                .await?
                .ok_or_else(|| EngineError::JobNotFound(meta.jid.clone()))?;
            let mut ops = Vec::new();
            let n = if config.kind == ActivityKind::Iterate {
                self.push_iterate_ops(&mut ops, graph, config, &job, &meta.dad, &targets)
                    .await?
            } else {
                self.push_child_ops(&mut ops, graph, &job, &config.id, &targets, &child_dad);
                targets.len() as i64
            };
            ops.push(TxnOp::SetStatusAndCollateGuid {
                job_id: meta.jid.clone(),
                delta: n - 1,
                threshold: graph.completion_threshold,
                guid: guid.clone(),
                snapshot_weight: SNAPSHOT_WEIGHT,
            });
            ops.push(TxnOp::IncrementGuidLedger {
                job_id: meta.jid.clone(),
                guid: guid.clone(),
                delta: Stage::Step2.activity_delta(),
            });
            ops.push(TxnOp::IncrementLedger {
                job_id: meta.jid.clone(),
                activity_id: config.id.clone(),
                dads: vec![dad.clone()],
                delta: Stage::Step2.activity_delta(),
            });
            ops.push(TxnOp::AppendEvent {
                job_id: meta.jid.clone(),
                event: JobEvent::StepCommitted {
                    activity_id: config.id.clone(),
                    guid: guid.clone(),
                    step: 2,
                },
            });
            let replies = self.store.commit(ops).await?;
            job_closed = replies
                .iter()
                .any(|r| matches!(r, TxnReply::ThresholdHit(true)));
        } else {
            // The snapshot bit is the only authority for step 3.
            job_closed = ledger::snapshot_set(guid_post);
        }

        // Step 3 — completion tasks, gated solely by the snapshot bit.
        if job_closed && !ledger::step3_done(guid_post) {
            self.run_completion_tasks(graph, &meta.jid, guid, Some((&config.id, &dad)))
                .await?;
        }

        // The close tick is last: a crash before it leaves the guid in the
        // resume disposition, which re-applies only this commit.
        if config.cyclic || !ledger::is_inactive(act_post) {
            self.store
                .commit(vec![TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dads: vec![dad.clone()],
                    delta: Stage::Completion {
                        cyclic: config.cyclic,
                    }
                    .activity_delta(),
                }])
                .await?;
        }
        self.ack(&stream, env).await?;
        Ok(Outcome::Processed { job_closed })
    }

    /// Retryable worker response: keep the activity open, re-dispatch the
    /// AWAIT with a bumped try count, and mark this guid processed.
    async fn worker_retry_leg2(
        &self,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        env: &StreamEnvelope,
        try_count: u32,
    ) -> EngineResult<Outcome> {
        let meta = &env.message.metadata;
        let stream = topic_stream(&graph.subscribes);
        let dad = meta.dad.trimmed();
        let worker_topic = config
            .worker_topic
            .clone()
            .ok_or_else(|| EngineError::ActivityNotFound(config.id.clone()))?;

        let current = self
            .store
            .read_activity_ledger(&meta.jid, &config.id, &dad)
            .await?;
        collator::ensure_reentry_capacity(&config.id, current)?;
        let replies = self
            .store
            .commit(vec![
                TxnOp::IncrementLedger {
                    job_id: meta.jid.clone(),
                    activity_id: config.id.clone(),
                    dads: Self::reentry_addresses(&dad),
                    delta: Stage::Reentry.activity_delta(),
                },
                TxnOp::IncrementGuidLedger {
                    job_id: meta.jid.clone(),
                    guid: meta.guid.clone(),
                    delta: ledger::REENTRY_WEIGHT,
                },
            ])
            .await?;
        let act_post = replies[0].ledger();
        let guid_post = replies[1].ledger();
        match collator::verify_reentry(&config.id, act_post, guid_post, true) {
            Ok(_) => {}
            Err(e) if e.is_silent_ack() => {
                self.ack(&stream, env).await?;
                return Ok(Outcome::Stale);
            }
            Err(e) => return Err(e),
        }

        if !ledger::step2_done(guid_post) {
            let paths = consumed_paths(&config.consumes);
            let input = match self.store.read_flat_state(&meta.jid, &paths, &dad).await? {
                Some((state, _)) => state::materialize(state),
                None => json!({}),
            };
            let backoff_ms = 10u64.pow((try_count + 1).min(3));
            tracing::info!(
                activity_id = %config.id,
                try_count,
                backoff_ms,
                "retryable worker error; re-dispatching"
            );
            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
            self.store
                .commit(vec![
                    TxnOp::StreamAppend {
                        stream: worker_stream(&worker_topic),
                        message: TransitionMessage {
                            metadata: MessageMetadata {
                                guid: Self::guid(),
                                jid: meta.jid.clone(),
                                gid: meta.gid.clone(),
                                dad: dad.clone(),
                                aid: config.id.clone(),
                                topic: Some(worker_topic.clone()),
                                spn: meta.spn.clone(),
                                trc: meta.trc.clone(),
                            },
                            kind: MessageType::Await,
                            data: json!({ "input": input, "tryCount": try_count + 1 }),
                            policies: config.retry.clone(),
                        },
                    },
                    TxnOp::IncrementGuidLedger {
                        job_id: meta.jid.clone(),
                        guid: meta.guid.clone(),
                        delta: Stage::Step1.activity_delta() + Stage::Step2.activity_delta(),
                    },
                    TxnOp::IncrementLedger {
                        job_id: meta.jid.clone(),
                        activity_id: config.id.clone(),
                        dads: vec![dad.clone()],
                        delta: Stage::Continuation.activity_delta(),
                    },
                    TxnOp::AppendEvent {
                        job_id: meta.jid.clone(),
                        event: JobEvent::WorkerDispatched {
                            activity_id: config.id.clone(),
                            topic: worker_topic,
                            guid: meta.guid.clone(),
                        },
                    },
                ])
                .await?;
        }
        self.ack(&stream, env).await?;
        Ok(Outcome::Processed { job_closed: false })
    }

    /// Iterate fan-out: one child per collection element per qualifying
    /// target, each in its own dimensional subspace with the element staged
    /// in its state. Returns N.
    async fn push_iterate_ops(
        &self,
        ops: &mut Vec<TxnOp>,
        graph: &CompiledGraph,
        config: &ActivityConfig,
        job: &Job,
        dad: &DimensionalAddress,
        targets: &[ActivityConfig],
    ) -> EngineResult<i64> {
        let path = config
            .iterate_path
            .clone()
            .ok_or_else(|| EngineError::ActivityNotFound(config.id.clone()))?;
        let items = match self
            .store
            .read_flat_state(&job.job_id, &[path.clone()], &dad.trimmed())
            .await?
        {
            Some((state, _)) => state
                .get(&path)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let mut n = 0i64;
        for (i, item) in items.iter().enumerate() {
            let item_dad = dad.trimmed().push(i as u32).trimmed();
            ops.push(TxnOp::WriteFlatState {
                job_id: job.job_id.clone(),
                dad: item_dad.clone(),
                entries: vec![(format!("{}.item", config.id), item.clone())],
            });
            self.push_child_ops(ops, graph, job, &config.id, targets, &item_dad);
            n += targets.len() as i64;
        }
        Ok(n)
    }

    /// Prime each child's ledger and append its Leg 1 message; both commit
    /// with the producer's semaphore delta, so no child is ever visible
    /// without it.
    fn push_child_ops(
        &self,
        ops: &mut Vec<TxnOp>,
        graph: &CompiledGraph,
        job: &Job,
        source_id: &str,
        targets: &[ActivityConfig],
        child_dad: &DimensionalAddress,
    ) {
        for target in targets {
            // Fan-in targets get one invocation per incoming edge, each in
            // its own dimensional subspace keyed by the edge ordinal.
            let incoming = graph.incoming(&target.id);
            let target_dad = if incoming.len() > 1 {
                let ordinal = incoming
                    .iter()
                    .position(|s| s == source_id)
                    .unwrap_or(0) as u32;
                child_dad.push(ordinal).trimmed()
            } else {
                child_dad.clone()
            };
            let child_guid = Self::guid();
            ops.push(TxnOp::IncrementLedger {
                job_id: job.job_id.clone(),
                activity_id: target.id.clone(),
                dads: vec![target_dad.clone()],
                delta: BASE_SEED,
            });
            ops.push(TxnOp::StreamAppend {
                stream: topic_stream(&graph.subscribes),
                message: TransitionMessage {
                    metadata: MessageMetadata {
                        guid: child_guid.clone(),
                        jid: job.job_id.clone(),
                        gid: job.generation_id.clone(),
                        dad: target_dad.clone(),
                        aid: target.id.clone(),
                        topic: None,
                        spn: None,
                        trc: None,
                    },
                    kind: MessageType::Transition,
                    data: json!({}),
                    policies: None,
                },
            });
            ops.push(TxnOp::AppendEvent {
                job_id: job.job_id.clone(),
                event: JobEvent::ChildSpawned {
                    source_activity_id: source_id.to_string(),
                    target_activity_id: target.id.clone(),
                    dad: target_dad,
                    guid: child_guid,
                },
            });
        }
    }

    /// The one-time completion tasks: terminal publish, parent response,
    /// expiration schedule — bundled with the step-3 markers so the
    /// snapshot holder commits them exactly once.
    async fn run_completion_tasks(
        &self,
        graph: &CompiledGraph,
        job_id: &str,
        guid: &str,
        closing_activity: Option<(&str, &DimensionalAddress)>,
    ) -> EngineResult<()> {
        let job = self
            .store
            .read_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        let code = job.error.as_ref().map(|e| e.code).unwrap_or(codes::SUCCESS);

        let mut ops = vec![TxnOp::StreamAppend {
            stream: publish_stream(&graph.publishes),
            message: TransitionMessage {
                metadata: MessageMetadata {
                    guid: Self::guid(),
                    jid: job.job_id.clone(),
                    gid: job.generation_id.clone(),
                    dad: DimensionalAddress::root(),
                    aid: "$job".to_string(),
                    topic: Some(graph.publishes.clone()),
                    spn: None,
                    trc: None,
                },
                kind: MessageType::Response,
                data: json!({ "code": code, "jobId": job.job_id }),
                policies: None,
            },
        }];
        if let Some(parent) = &job.parent {
            if let Some(parent_job) = self.store.read_job(&parent.job_id).await? {
                ops.push(TxnOp::StreamAppend {
                    stream: topic_stream(&parent.topic),
                    message: TransitionMessage {
                        metadata: MessageMetadata {
                            guid: Self::guid(),
                            jid: parent.job_id.clone(),
                            gid: parent_job.generation_id.clone(),
                            dad: parent.dad.clone(),
                            aid: parent.activity_id.clone(),
                            topic: Some(parent.topic.clone()),
                            spn: None,
                            trc: None,
                        },
                        kind: MessageType::Response,
                        data: json!({ "code": code, "jobId": job.job_id }),
                        policies: None,
                    },
                });
            }
        }
        if let Some(ttl) = job.expire_ms {
            let at = now_ms() + ttl;
            ops.push(TxnOp::ScheduleExpire {
                job_id: job.job_id.clone(),
                at,
            });
            ops.push(TxnOp::AppendEvent {
                job_id: job.job_id.clone(),
                event: JobEvent::ExpireScheduled { at },
            });
        }
        ops.push(TxnOp::IncrementGuidLedger {
            job_id: job.job_id.clone(),
            guid: guid.to_string(),
            delta: Stage::Step3.activity_delta(),
        });
        if let Some((activity_id, dad)) = closing_activity {
            ops.push(TxnOp::IncrementLedger {
                job_id: job.job_id.clone(),
                activity_id: activity_id.to_string(),
                dads: vec![dad.trimmed()],
                delta: Stage::Step3.activity_delta(),
            });
        }
        ops.push(TxnOp::AppendEvent {
            job_id: job.job_id.clone(),
            event: JobEvent::JobClosed {
                guid: guid.to_string(),
            },
        });
        ops.push(TxnOp::AppendEvent {
            job_id: job.job_id.clone(),
            event: JobEvent::CompletionTasksRan {
                guid: guid.to_string(),
            },
        });
        self.store.commit(ops).await?;
        Ok(())
    }
}

fn segments_to_dad(segs: &[u32]) -> DimensionalAddress {
    let mut s = String::new();
    for seg in segs {
        s.push(',');
        s.push_str(&seg.to_string());
    }
    if s.is_empty() {
        DimensionalAddress::root()
    } else {
        DimensionalAddress::parse(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentry_addresses_cover_ancestor_prefixes() {
        let root = DimensionalAddress::root();
        assert_eq!(
            ActivityMachine::reentry_addresses(&root),
            vec![DimensionalAddress::parse(",0")]
        );
        let nested = DimensionalAddress::parse(",0,1,2");
        assert_eq!(
            ActivityMachine::reentry_addresses(&nested),
            vec![
                DimensionalAddress::parse(",0,1,2"),
                DimensionalAddress::parse(",0,1"),
                DimensionalAddress::parse(",0"),
            ]
        );
        // Trailing zeros collapse into the base before prefixing.
        let padded = DimensionalAddress::parse(",0,1,0");
        assert_eq!(
            ActivityMachine::reentry_addresses(&padded),
            vec![
                DimensionalAddress::parse(",0,1"),
                DimensionalAddress::parse(",0"),
            ]
        );
    }

    #[test]
    fn segments_round_trip() {
        assert_eq!(segments_to_dad(&[0, 1]).as_str(), ",0,1");
        assert_eq!(segments_to_dad(&[]).as_str(), ",0");
    }
}
