//! Engine facade: wires the compiled graphs, the store provider, and the
//! activity state machine together. Server handlers and tests delegate to
//! this; nothing here is a global — the engine value is threaded through
//! constructors explicitly.

use crate::activity::{ActivityMachine, Outcome, ENGINE_GROUP};
use crate::error::{EngineError, EngineResult};
use crate::events::JobEvent;
use crate::graph::{CompiledGraph, GraphRegistry, SignalScope};
use crate::ledger;
use crate::router::dead_letter;
use crate::state::{key_string, materialize, value_at};
use crate::store::{topic_stream, worker_stream, JobStore, TxnOp};
use crate::types::*;
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

pub struct Engine {
    store: Arc<dyn JobStore>,
    graphs: Arc<GraphRegistry>,
    machine: ActivityMachine,
    /// One-shot completion subscribers, notified after the completion
    /// tasks commit.
    subscribers: Mutex<HashMap<String, Vec<oneshot::Sender<JobStatus>>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn JobStore>) -> Arc<Self> {
        let graphs = Arc::new(GraphRegistry::new());
        let machine = ActivityMachine::new(store.clone(), graphs.clone());
        Arc::new(Self {
            store,
            graphs,
            machine,
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn graphs(&self) -> &Arc<GraphRegistry> {
        &self.graphs
    }

    fn guid() -> String {
        Uuid::now_v7().to_string()
    }

    /// Compile and register a graph manifest; creates the topic stream's
    /// consumer group.
    pub async fn register_graph_yaml(&self, yaml: &str) -> Result<Arc<CompiledGraph>> {
        let graph = CompiledGraph::from_yaml(yaml)?;
        self.register_graph(graph).await
    }

    pub async fn register_graph(&self, graph: CompiledGraph) -> Result<Arc<CompiledGraph>> {
        let stream = topic_stream(&graph.subscribes);
        self.store.stream_group_create(&stream, ENGINE_GROUP).await?;
        tracing::info!(topic = %graph.subscribes, version = %hex_prefix(&graph.version), "graph registered");
        Ok(self.graphs.register(graph))
    }

    fn graph_for(&self, topic: &str) -> EngineResult<Arc<CompiledGraph>> {
        self.graphs
            .get(topic)
            .ok_or_else(|| EngineError::GraphNotFound(topic.to_string()))
    }

    fn graph_for_job(&self, job: &Job) -> EngineResult<Arc<CompiledGraph>> {
        self.graph_for(&job.topic)
    }

    // ─── Client API ───────────────────────────────────────────

    /// Start a job. The trigger runs inline so duplicate starts surface
    /// synchronously; everything downstream flows through streams.
    pub async fn start(
        &self,
        topic: &str,
        data: Value,
        options: StartOptions,
    ) -> EngineResult<String> {
        let graph = self.graph_for(topic)?;
        let job_id = options.job_id.clone().unwrap_or_else(Self::guid);

        let mut payload = match data {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        if options.pending {
            payload.insert("$pending".to_string(), json!(true));
        }
        if let Some(expire) = options.expire {
            payload.insert("$expire".to_string(), json!(expire));
        }
        if !options.search.is_empty() {
            payload.insert("$search".to_string(), json!(options.search));
        }
        if let Some(parent) = &options.parent {
            payload.insert(
                "$parent".to_string(),
                serde_json::to_value(parent).map_err(anyhow::Error::from)?,
            );
        }

        let env = StreamEnvelope {
            // Synthesized envelope: not on any stream, nothing to ack.
            id: String::new(),
            delivery_count: 1,
            message: TransitionMessage {
                metadata: MessageMetadata {
                    guid: Self::guid(),
                    jid: job_id.clone(),
                    gid: String::new(),
                    dad: DimensionalAddress::root(),
                    aid: graph.trigger_id.clone(),
                    topic: Some(topic.to_string()),
                    spn: None,
                    trc: None,
                },
                kind: MessageType::Transition,
                data: Value::Object(payload),
                policies: None,
            },
        };
        self.process_envelope(&graph, &env).await?;
        Ok(job_id)
    }

    /// Resume a job started with `pending`: evaluate the trigger's
    /// adjacency list and commit the deferred dispatch. Idempotent via the
    /// trigger guid's step-2 marker.
    pub async fn resume(&self, job_id: &str) -> EngineResult<()> {
        let job = self
            .store
            .read_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        let graph = self.graph_for_job(&job)?;
        let root = DimensionalAddress::root();
        let Some((state, _)) = self
            .store
            .read_flat_state(job_id, &["$start.guid".to_string()], &root)
            .await?
        else {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        };
        let guid = state
            .get("$start.guid")
            .map(key_string)
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        let guid_value = self.store.read_guid_ledger(job_id, &guid).await?;
        if ledger::step2_done(guid_value) {
            return Ok(());
        }

        let trigger = graph
            .activity(&graph.trigger_id)
            .ok_or_else(|| EngineError::ActivityNotFound(graph.trigger_id.clone()))?;
        let cond_paths = graph.condition_paths(&trigger.id);
        let eval_state = self
            .store
            .read_flat_state(job_id, &cond_paths, &root)
            .await?
            .map(|(s, _)| s)
            .unwrap_or_default();
        let targets: Vec<_> = graph
            .qualifying_targets(&trigger.id, &eval_state)
            .into_iter()
            .cloned()
            .collect();
        let child_dad = root.push(0).trimmed();
        let n = targets.len() as i64;

        let mut ops = Vec::new();
        for target in &targets {
            let child_guid = Self::guid();
            ops.push(TxnOp::IncrementLedger {
                job_id: job_id.to_string(),
                activity_id: target.id.clone(),
                dads: vec![child_dad.clone()],
                delta: ledger::BASE_SEED,
            });
            ops.push(TxnOp::StreamAppend {
                stream: topic_stream(&graph.subscribes),
                message: TransitionMessage {
                    metadata: MessageMetadata {
                        guid: child_guid.clone(),
                        jid: job_id.to_string(),
                        gid: job.generation_id.clone(),
                        dad: child_dad.clone(),
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
                job_id: job_id.to_string(),
                event: JobEvent::ChildSpawned {
                    source_activity_id: trigger.id.clone(),
                    target_activity_id: target.id.clone(),
                    dad: child_dad.clone(),
                    guid: child_guid,
                },
            });
        }
        ops.push(TxnOp::SetStatusAndCollateGuid {
            job_id: job_id.to_string(),
            delta: n - 1,
            threshold: graph.completion_threshold,
            guid: guid.clone(),
            snapshot_weight: ledger::SNAPSHOT_WEIGHT,
        });
        ops.push(TxnOp::IncrementGuidLedger {
            job_id: job_id.to_string(),
            guid,
            delta: ledger::STEP2_WEIGHT,
        });
        self.store.commit(ops).await?;
        Ok(())
    }

    /// Deliver a signal payload to paused hooks on `topic`. With a
    /// resolvable correlation key this is signal-one; otherwise every hook
    /// on the topic is woken best-effort.
    pub async fn signal(&self, topic: &str, payload: Value) -> EngineResult<()> {
        let key = value_at(&payload, "id").map(key_string);
        let bindings = match &key {
            Some(k) => self
                .store
                .hook_by_key(topic, k)
                .await?
                .into_iter()
                .collect::<Vec<_>>(),
            None => self.store.hooks_for_topic(topic).await?,
        };
        if bindings.is_empty() {
            tracing::warn!(topic, "signal matched no hooks");
            return Ok(());
        }
        for binding in bindings {
            let Some(target) = self.store.read_job(&binding.job_id).await? else {
                continue;
            };
            let result = self
                .store
                .commit(vec![
                    TxnOp::StreamAppend {
                        stream: topic_stream(&target.topic),
                        message: TransitionMessage {
                            metadata: MessageMetadata {
                                guid: Self::guid(),
                                jid: binding.job_id.clone(),
                                gid: target.generation_id.clone(),
                                dad: binding.dad.clone(),
                                aid: binding.activity_id.clone(),
                                topic: Some(topic.to_string()),
                                spn: None,
                                trc: None,
                            },
                            kind: MessageType::Response,
                            data: payload.clone(),
                            policies: None,
                        },
                    },
                    TxnOp::RemoveHook {
                        topic: binding.topic.clone(),
                        key: binding.key.clone(),
                    },
                ])
                .await;
            if let Err(e) = result {
                tracing::error!(topic, target = %binding.job_id, error = %e, "signal delivery failed");
            }
        }
        Ok(())
    }

    /// Interrupt a job: set the negative semaphore sentinel, record the
    /// error, wake paused hooks, and optionally cascade to child jobs.
    pub async fn interrupt(&self, job_id: &str, options: InterruptOptions) -> EngineResult<()> {
        let mut pending = vec![job_id.to_string()];
        while let Some(jid) = pending.pop() {
            let Some(job) = self.store.read_job(&jid).await? else {
                if jid == job_id {
                    return Err(EngineError::JobNotFound(jid));
                }
                continue;
            };
            if job.semaphore <= INTERRUPT_SENTINEL {
                continue;
            }
            self.store
                .commit(vec![
                    TxnOp::MarkJobInterrupted {
                        job_id: jid.clone(),
                        error: Some(JobError {
                            code: codes::INTERRUPTED,
                            message: options
                                .reason
                                .clone()
                                .unwrap_or_else(|| "interrupted".to_string()),
                            stack: None,
                        }),
                    },
                    TxnOp::AppendEvent {
                        job_id: jid.clone(),
                        event: JobEvent::Interrupted {
                            reason: options.reason.clone(),
                        },
                    },
                ])
                .await?;
            self.machine.wake_hooks(&jid).await?;
            if options.descend {
                pending.extend(self.store.child_jobs(&jid).await?);
            }
        }
        Ok(())
    }

    /// Materialized hierarchical view of the job's state. Engine-internal
    /// paths (`$`-prefixed) are stripped.
    pub async fn get_state(&self, job_id: &str) -> EngineResult<Value> {
        let root = DimensionalAddress::root();
        let Some((state, _)) = self.store.read_flat_state(job_id, &[], &root).await? else {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        };
        Ok(materialize(
            state.into_iter().filter(|(path, _)| !path.starts_with('$')),
        ))
    }

    pub async fn get_status(&self, job_id: &str) -> EngineResult<JobStatus> {
        let job = self
            .store
            .read_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        let threshold = self
            .graphs
            .get(&job.topic)
            .map(|g| g.completion_threshold)
            .unwrap_or(0);
        Ok(JobStatus {
            job_id: job.job_id.clone(),
            state: job.state(threshold),
            semaphore: job.semaphore,
            error: job.error,
        })
    }

    /// The durable per-job timeline.
    pub async fn export(&self, job_id: &str) -> EngineResult<Vec<(u64, JobEvent)>> {
        Ok(self.store.read_events(job_id, 0).await?)
    }

    /// Resolve when the job's completion tasks run (or immediately, if they
    /// already have).
    pub async fn subscribe(&self, job_id: &str) -> EngineResult<oneshot::Receiver<JobStatus>> {
        let (tx, rx) = oneshot::channel();
        let status = self.get_status(job_id).await?;
        if status.state != JobState::Running {
            let _ = tx.send(status);
            return Ok(rx);
        }
        self.subscribers
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn notify_subscribers(&self, job_id: &str) {
        let senders = self.subscribers.lock().await.remove(job_id);
        let Some(senders) = senders else { return };
        if let Ok(status) = self.get_status(job_id).await {
            for tx in senders {
                let _ = tx.send(status.clone());
            }
        }
    }

    // ─── Processing ───────────────────────────────────────────

    /// Run one claimed envelope through the state machine, firing one-shot
    /// subscribers when its completion tasks committed.
    pub async fn process_envelope(
        &self,
        graph: &CompiledGraph,
        env: &StreamEnvelope,
    ) -> EngineResult<Outcome> {
        let outcome = self.machine.process(graph, env).await?;
        if let Outcome::Processed { job_closed: true } = outcome {
            self.notify_subscribers(&env.message.metadata.jid).await;
        }
        Ok(outcome)
    }

    /// Claim due timers and wake their hook activities with a Leg 2
    /// message.
    pub async fn fire_due_timers(&self, now: Timestamp) -> EngineResult<u64> {
        let due = self.store.claim_due_timers(now, 64).await?;
        let mut fired = 0;
        for timer in due {
            let Some(job) = self.store.read_job(&timer.job_id).await? else {
                continue;
            };
            self.store
                .commit(vec![TxnOp::StreamAppend {
                    stream: topic_stream(&job.topic),
                    message: TransitionMessage {
                        metadata: MessageMetadata {
                            guid: Self::guid(),
                            jid: timer.job_id.clone(),
                            gid: job.generation_id.clone(),
                            dad: timer.dad.clone(),
                            aid: timer.activity_id.clone(),
                            topic: None,
                            spn: None,
                            trc: None,
                        },
                        kind: MessageType::Response,
                        data: json!({ "code": codes::SUCCESS, "timer": true }),
                        policies: None,
                    },
                }])
                .await?;
            fired += 1;
        }
        Ok(fired)
    }

    /// Drain every registered topic stream until no message remains,
    /// reclaiming unacked deliveries along the way. The test harness and
    /// single-process deployments drive the engine with this; production
    /// uses `StreamRouter` consumers.
    pub async fn run_to_quiescence(&self) -> EngineResult<u64> {
        let consumer = "drain";
        let mut processed = 0u64;
        loop {
            let mut progressed = false;
            for topic in self.graphs.topics() {
                let graph = self.graph_for(&topic)?;
                let stream = topic_stream(&topic);
                loop {
                    let mut batch = self
                        .store
                        .stream_read(&stream, ENGINE_GROUP, consumer, 0, 16)
                        .await?;
                    if batch.is_empty() {
                        batch = self
                            .store
                            .stream_claim_pending(&stream, ENGINE_GROUP, consumer, 0, 16)
                            .await?;
                    }
                    if batch.is_empty() {
                        break;
                    }
                    for env in &batch {
                        match self.process_envelope(&graph, env).await {
                            Ok(_) => {}
                            Err(e) => {
                                dead_letter(
                                    self.store.as_ref(),
                                    &graph,
                                    &stream,
                                    env,
                                    e.code(),
                                    &e.to_string(),
                                )
                                .await?;
                            }
                        }
                        processed += 1;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                return Ok(processed);
            }
        }
    }

    // ─── Worker surface ───────────────────────────────────────

    /// Claim AWAIT dispatches from a worker topic.
    pub async fn claim_worker_tasks(
        &self,
        worker_topic: &str,
        count: usize,
    ) -> EngineResult<Vec<StreamEnvelope>> {
        let stream = worker_stream(worker_topic);
        self.store.stream_group_create(&stream, ENGINE_GROUP).await?;
        let mut batch = self
            .store
            .stream_read(&stream, ENGINE_GROUP, "worker", 0, count)
            .await?;
        if batch.is_empty() {
            batch = self
                .store
                .stream_claim_pending(&stream, ENGINE_GROUP, "worker", 0, count)
                .await?;
        }
        Ok(batch)
    }

    /// Publish a worker's RESPONSE and ack the AWAIT in one commit.
    pub async fn complete_worker_task(
        &self,
        worker_topic: &str,
        env: &StreamEnvelope,
        data: Value,
    ) -> EngineResult<()> {
        let meta = &env.message.metadata;
        let job = self
            .store
            .read_job(&meta.jid)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(meta.jid.clone()))?;
        let mut data = data;
        if let (Value::Object(map), Some(try_count)) =
            (&mut data, env.message.data.get("tryCount"))
        {
            map.entry("tryCount".to_string())
                .or_insert_with(|| try_count.clone());
        }
        self.store
            .commit(vec![
                TxnOp::StreamAppend {
                    stream: topic_stream(&job.topic),
                    message: TransitionMessage {
                        metadata: MessageMetadata {
                            guid: Self::guid(),
                            jid: meta.jid.clone(),
                            gid: meta.gid.clone(),
                            dad: meta.dad.clone(),
                            aid: meta.aid.clone(),
                            topic: Some(job.topic.clone()),
                            spn: meta.spn.clone(),
                            trc: meta.trc.clone(),
                        },
                        kind: MessageType::Response,
                        data,
                        policies: None,
                    },
                },
                TxnOp::StreamAckDelete {
                    stream: worker_stream(worker_topic),
                    group: ENGINE_GROUP.to_string(),
                    id: env.id.clone(),
                },
            ])
            .await?;
        Ok(())
    }

    /// Remove expired jobs; returns how many were swept.
    pub async fn sweep_expired(&self, now: Timestamp) -> EngineResult<u64> {
        Ok(self.store.sweep_expired(now).await?)
    }

    /// Signal-scope helper for server handlers that need to know whether a
    /// topic is served by a registered graph's signal activity.
    pub fn signal_scope(&self, topic: &str) -> Option<SignalScope> {
        for graph_topic in self.graphs.topics() {
            if let Some(graph) = self.graphs.get(&graph_topic) {
                for activity in graph.activities.values() {
                    if let Some(spec) = &activity.signal {
                        if spec.topic == topic {
                            return Some(spec.scope);
                        }
                    }
                }
            }
        }
        None
    }
}

fn hex_prefix(version: &[u8; 32]) -> String {
    version[..4].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    const LINEAR: &str = r#"
subscribes: order.test
activities:
  - id: t1
    type: trigger
  - id: a1
    type: await
transitions:
  t1:
    a1: {}
"#;

    async fn engine_with(yaml: &str) -> Arc<Engine> {
        let engine = Engine::new(Arc::new(MemoryStore::new()));
        engine.register_graph_yaml(yaml).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn start_runs_trigger_inline() {
        let engine = engine_with(LINEAR).await;
        let job_id = engine
            .start("order.test", json!({"order": {"id": "o-1"}}), StartOptions::default())
            .await
            .unwrap();
        let status = engine.get_status(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.semaphore, 1);

        engine.run_to_quiescence().await.unwrap();
        let status = engine.get_status(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.semaphore, 0);
    }

    #[tokio::test]
    async fn duplicate_start_is_surfaced() {
        let engine = engine_with(LINEAR).await;
        let options = StartOptions {
            job_id: Some("job-1".to_string()),
            ..Default::default()
        };
        engine
            .start("order.test", json!({}), options.clone())
            .await
            .unwrap();
        let err = engine.start("order.test", json!({}), options).await;
        assert!(matches!(err, Err(EngineError::DuplicateJob(_))));
    }

    #[tokio::test]
    async fn unknown_topic_is_rejected() {
        let engine = engine_with(LINEAR).await;
        let err = engine.start("no.such.topic", json!({}), StartOptions::default()).await;
        assert!(matches!(err, Err(EngineError::GraphNotFound(_))));
    }

    #[tokio::test]
    async fn pending_start_defers_dispatch_until_resume() {
        let engine = engine_with(LINEAR).await;
        let job_id = engine
            .start(
                "order.test",
                json!({}),
                StartOptions {
                    pending: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.run_to_quiescence().await.unwrap();
        assert_eq!(
            engine.get_status(&job_id).await.unwrap().state,
            JobState::Running
        );

        engine.resume(&job_id).await.unwrap();
        // A second resume is a no-op thanks to the step-2 marker.
        engine.resume(&job_id).await.unwrap();
        engine.run_to_quiescence().await.unwrap();
        assert_eq!(
            engine.get_status(&job_id).await.unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn state_view_strips_internal_paths() {
        let engine = engine_with(LINEAR).await;
        let job_id = engine
            .start("order.test", json!({"order": {"id": "o-9"}}), StartOptions::default())
            .await
            .unwrap();
        engine.run_to_quiescence().await.unwrap();
        let state = engine.get_state(&job_id).await.unwrap();
        assert_eq!(state["t1"]["order"]["id"], json!("o-9"));
        assert!(state.get("$start").is_none());
    }

    #[tokio::test]
    async fn subscribe_resolves_on_completion() {
        let engine = engine_with(LINEAR).await;
        let job_id = engine
            .start("order.test", json!({}), StartOptions::default())
            .await
            .unwrap();
        let rx = engine.subscribe(&job_id).await.unwrap();
        engine.run_to_quiescence().await.unwrap();
        let status = rx.await.unwrap();
        assert_eq!(status.state, JobState::Completed);
    }

    #[tokio::test]
    async fn interrupt_sets_sentinel_and_status() {
        let engine = engine_with(LINEAR).await;
        let job_id = engine
            .start(
                "order.test",
                json!({}),
                StartOptions {
                    pending: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine
            .interrupt(
                &job_id,
                InterruptOptions {
                    reason: Some("operator stop".to_string()),
                    descend: false,
                },
            )
            .await
            .unwrap();
        let status = engine.get_status(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Interrupted);
        assert_eq!(status.error.unwrap().code, codes::INTERRUPTED);
    }
}
