//! Stream router: at-least-once delivery of transition messages between
//! activities.
//!
//! One consumer loop per (topic × consumer name). The loop block-reads new
//! entries with a bounded duration so shutdown is observed promptly, claims
//! idle pending entries left behind by dead consumers, enforces the
//! delivery-count cap with a dead-letter path, and retries retryable
//! errors locally with exponential backoff before publishing an error
//! response.

use crate::activity::ENGINE_GROUP;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::JobEvent;
use crate::graph::CompiledGraph;
use crate::store::{publish_stream, topic_stream, JobStore, TxnOp};
use crate::types::*;
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Commands published to every consumer of a router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Run,
    /// Pause between polls, in milliseconds.
    Throttle(u64),
    Stop,
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Block duration for stream reads; bounds shutdown latency.
    pub block_ms: u64,
    pub batch: usize,
    /// Pending entries idle longer than this are reclaimed.
    pub reclaim_delay_ms: u64,
    /// Entries delivered more times than this are dead-lettered.
    pub reclaim_count: u32,
    /// Local retries for retryable errors before dead-lettering.
    pub max_local_retries: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            block_ms: 1_000,
            batch: 16,
            reclaim_delay_ms: 15_000,
            reclaim_count: 5,
            max_local_retries: 3,
        }
    }
}

/// Consumer driver for one engine's topic streams.
pub struct StreamRouter {
    engine: Arc<Engine>,
    config: RouterConfig,
    control: watch::Sender<ControlCommand>,
}

impl StreamRouter {
    pub fn new(engine: Arc<Engine>, config: RouterConfig) -> Self {
        let (control, _) = watch::channel(ControlCommand::Run);
        Self {
            engine,
            config,
            control,
        }
    }

    /// Broadcast a throttle to every consumer loop.
    pub fn throttle(&self, pause_ms: u64) {
        let _ = self.control.send(ControlCommand::Throttle(pause_ms));
    }

    /// Broadcast stop; consumers drain their current batch and exit.
    pub fn stop(&self) {
        let _ = self.control.send(ControlCommand::Stop);
    }

    /// Consume one topic stream until stopped. Spawn one task per
    /// (topic × consumer).
    pub async fn run(&self, topic: &str, consumer: &str) -> Result<()> {
        let graph = self
            .engine
            .graphs()
            .get(topic)
            .ok_or_else(|| anyhow::anyhow!("no graph registered for topic {topic}"))?;
        let store = self.engine.store().clone();
        let stream = topic_stream(topic);
        store.stream_group_create(&stream, ENGINE_GROUP).await?;
        let mut ctrl = self.control.subscribe();
        tracing::info!(topic, consumer, "router consumer started");

        loop {
            let command = *ctrl.borrow();
            match command {
                ControlCommand::Stop => break,
                ControlCommand::Throttle(pause_ms) => {
                    tokio::time::sleep(std::time::Duration::from_millis(pause_ms)).await;
                }
                ControlCommand::Run => {}
            }

            let mut batch = store
                .stream_read(
                    &stream,
                    ENGINE_GROUP,
                    consumer,
                    self.config.block_ms,
                    self.config.batch,
                )
                .await?;
            if batch.is_empty() {
                batch = store
                    .stream_claim_pending(
                        &stream,
                        ENGINE_GROUP,
                        consumer,
                        self.config.reclaim_delay_ms,
                        self.config.batch,
                    )
                    .await?;
            }
            for env in &batch {
                self.process_one(&graph, &stream, env).await?;
            }
        }
        tracing::info!(topic, consumer, "router consumer stopped");
        Ok(())
    }

    async fn process_one(
        &self,
        graph: &CompiledGraph,
        stream: &str,
        env: &StreamEnvelope,
    ) -> Result<()> {
        let store = self.engine.store().as_ref();
        if env.delivery_count > self.config.reclaim_count {
            dead_letter(
                store,
                graph,
                stream,
                env,
                codes::UNACKED,
                "delivery count exceeded",
            )
            .await?;
            return Ok(());
        }

        let mut tries = 0u32;
        loop {
            match self.engine.process_envelope(graph, env).await {
                Ok(_) => return Ok(()),
                Err(e) if e.code() == codes::RETRYABLE && tries < self.config.max_local_retries => {
                    tries += 1;
                    let backoff_ms = 10u64.pow(tries.min(3));
                    tracing::warn!(
                        guid = %env.message.metadata.guid,
                        tries,
                        backoff_ms,
                        error = %e,
                        "retryable stream error; backing off"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    dead_letter(store, graph, stream, env, e.code(), &e.to_string()).await?;
                    return Ok(());
                }
            }
        }
    }
}

/// Best-effort dead-letter: publish an error response, record the event,
/// ack-and-delete the message, and log a fatal marker.
pub(crate) async fn dead_letter(
    store: &dyn JobStore,
    graph: &CompiledGraph,
    stream: &str,
    env: &StreamEnvelope,
    code: u16,
    reason: &str,
) -> Result<()> {
    let meta = &env.message.metadata;
    tracing::error!(
        guid = %meta.guid,
        job_id = %meta.jid,
        activity_id = %meta.aid,
        delivery_count = env.delivery_count,
        code,
        reason,
        "FATAL: dead-lettering stream message"
    );
    let mut ops = vec![TxnOp::StreamAppend {
        stream: publish_stream(&graph.publishes),
        message: TransitionMessage {
            metadata: MessageMetadata {
                guid: Uuid::now_v7().to_string(),
                jid: meta.jid.clone(),
                gid: meta.gid.clone(),
                dad: meta.dad.clone(),
                aid: meta.aid.clone(),
                topic: Some(graph.publishes.clone()),
                spn: meta.spn.clone(),
                trc: meta.trc.clone(),
            },
            kind: MessageType::Response,
            data: json!({ "code": code, "message": reason }),
            policies: None,
        },
    }];
    if !env.id.is_empty() {
        ops.push(TxnOp::StreamAckDelete {
            stream: stream.to_string(),
            group: ENGINE_GROUP.to_string(),
            id: env.id.clone(),
        });
    }
    ops.push(TxnOp::AppendEvent {
        job_id: meta.jid.clone(),
        event: JobEvent::DeadLettered {
            stream: stream.to_string(),
            guid: meta.guid.clone(),
            delivery_count: env.delivery_count,
        },
    });
    store.commit(ops).await?;
    Ok(())
}
