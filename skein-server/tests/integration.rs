//! End-to-end protocol scenarios, driven through the engine facade against
//! the memory store — the same pipeline the gRPC handlers delegate to.
//!
//! Crash points are simulated by claiming a stream message, committing the
//! exact op sequence the state machine would have committed up to the crash
//! point, and then letting the drain loop reclaim and resume the unacked
//! message.

use std::sync::Arc;

use serde_json::{json, Value};
use skein_core::activity::ENGINE_GROUP;
use skein_core::engine::Engine;
use skein_core::error::EngineError;
use skein_core::events::JobEvent;
use skein_core::ledger;
use skein_core::store::{publish_stream, topic_stream, JobStore, TxnOp};
use skein_core::store_memory::MemoryStore;
use skein_core::types::*;

const LINEAR: &str = r#"
subscribes: linear.flow
activities:
  - id: t1
    type: trigger
  - id: a1
    type: await
transitions:
  t1:
    a1: {}
"#;

const FAN: &str = r#"
subscribes: fan.flow
activities:
  - id: t1
    type: trigger
  - id: a1
    type: await
  - id: a2
    type: await
  - id: a3
    type: await
transitions:
  t1:
    a1: {}
    a2: {}
  a1:
    a3: {}
  a2:
    a3: {}
"#;

const CYCLE: &str = r#"
subscribes: cycling.flow
activities:
  - id: t1
    type: trigger
  - id: a0
    type: await
  - id: c1
    type: cycle
    cycle_ancestor: a0
transitions:
  t1:
    a0: {}
  a0:
    c1: {}
"#;

const HOOK_SIGNAL: &str = r#"
subscribes: approval.flow
activities:
  - id: t1
    type: trigger
  - id: h1
    type: hook
    hook: { topic: approvals }
  - id: s1
    type: signal
    signal: { topic: approvals }
transitions:
  t1:
    h1: {}
    s1: {}
"#;

const WORKER: &str = r#"
subscribes: worked.flow
activities:
  - id: t1
    type: trigger
  - id: w1
    type: worker
    worker_topic: tasks
    retry: { maximum_attempts: 3 }
  - id: a2
    type: await
transitions:
  t1:
    w1: {}
  w1:
    a2: {}
"#;

const SLEEPER: &str = r#"
subscribes: sleeping.flow
activities:
  - id: t1
    type: trigger
  - id: h1
    type: hook
    hook: { sleep_ms: 50 }
transitions:
  t1:
    h1: {}
"#;

const ITERATE: &str = r#"
subscribes: iterating.flow
activities:
  - id: t1
    type: trigger
  - id: it1
    type: iterate
    iterate_path: t1.items
  - id: a1
    type: await
transitions:
  t1:
    it1: {}
  it1:
    a1: {}
"#;

async fn engine_with(yaml: &str) -> Arc<Engine> {
    let engine = Engine::new(Arc::new(MemoryStore::new()));
    engine.register_graph_yaml(yaml).await.unwrap();
    engine
}

fn count_events<F: Fn(&JobEvent) -> bool>(timeline: &[(u64, JobEvent)], pred: F) -> usize {
    timeline.iter().filter(|(_, e)| pred(e)).count()
}

fn child_guid(timeline: &[(u64, JobEvent)], target: &str) -> String {
    timeline
        .iter()
        .find_map(|(_, e)| match e {
            JobEvent::ChildSpawned {
                target_activity_id,
                guid,
                ..
            } if target_activity_id == target => Some(guid.clone()),
            _ => None,
        })
        .expect("child spawn event present")
}

fn closing_guid(timeline: &[(u64, JobEvent)]) -> String {
    timeline
        .iter()
        .find_map(|(_, e)| match e {
            JobEvent::JobClosed { guid } => Some(guid.clone()),
            _ => None,
        })
        .expect("job closed event present")
}

/// Scenario 1 — single-activity linear workflow with literal ledger seeds.
#[tokio::test]
async fn linear_workflow_ledger_trace() {
    let engine = engine_with(LINEAR).await;
    let job_id = engine
        .start("linear.flow", json!({"order": "o-1"}), StartOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.get_status(&job_id).await.unwrap().semaphore, 1);

    engine.run_to_quiescence().await.unwrap();

    let status = engine.get_status(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.semaphore, 0);

    let store = engine.store();
    let root = DimensionalAddress::root();
    assert_eq!(
        store.read_activity_ledger(&job_id, "t1", &root).await.unwrap(),
        ledger::TRIGGER_SEED
    );
    assert_eq!(
        store.read_activity_ledger(&job_id, "a1", &root).await.unwrap(),
        888_011_101_000_001
    );

    // The t1→a1 message's GUID ledger carries all three step markers and
    // the job-closed snapshot bit.
    let timeline = engine.export(&job_id).await.unwrap();
    let guid = child_guid(&timeline, "a1");
    let guid_value = store.read_guid_ledger(&job_id, &guid).await.unwrap();
    assert!(ledger::step1_done(guid_value));
    assert!(ledger::step2_done(guid_value));
    assert!(ledger::step3_done(guid_value));
    assert!(ledger::snapshot_set(guid_value));
    assert_eq!(
        guid_value,
        ledger::SNAPSHOT_WEIGHT
            + ledger::STEP1_WEIGHT
            + ledger::STEP2_WEIGHT
            + ledger::STEP3_WEIGHT
            + ledger::REENTRY_WEIGHT
    );
    assert_eq!(closing_guid(&timeline), guid);
}

/// Scenario 2 — fan-out fan-in: the semaphore traverses 1→2→0 and exactly
/// one message carries the snapshot bit.
#[tokio::test]
async fn fan_out_fan_in_single_snapshot() {
    let engine = engine_with(FAN).await;
    let job_id = engine
        .start("fan.flow", json!({}), StartOptions::default())
        .await
        .unwrap();
    // After the trigger's dispatch: 1 + (2 - 1).
    assert_eq!(engine.get_status(&job_id).await.unwrap().semaphore, 2);

    engine.run_to_quiescence().await.unwrap();
    let status = engine.get_status(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.semaphore, 0);

    let timeline = engine.export(&job_id).await.unwrap();
    assert_eq!(
        count_events(&timeline, |e| matches!(e, JobEvent::JobClosed { .. })),
        1
    );
    assert_eq!(
        count_events(&timeline, |e| matches!(e, JobEvent::CompletionTasksRan { .. })),
        1
    );
    // Exactly one terminal response on the publish stream.
    assert_eq!(
        engine
            .store()
            .stream_depth(&publish_stream("fan.flow"))
            .await
            .unwrap(),
        1
    );
}

/// Scenario 3 — crash immediately after Step 2 of the closing activity.
/// The redelivered message observes `step2Done && !step3Done && snapshot`
/// and runs the completion tasks exactly once.
#[tokio::test]
async fn crash_after_step2_of_closing_activity() {
    let engine = engine_with(FAN).await;
    let graph = engine.graphs().get("fan.flow").unwrap();
    let store = engine.store().clone();
    let stream = topic_stream("fan.flow");
    let job_id = engine
        .start("fan.flow", json!({}), StartOptions::default())
        .await
        .unwrap();

    // Drive a1, a2, and the first a3 invocation; the second a3 message is
    // the closer.
    for _ in 0..3 {
        let batch = store
            .stream_read(&stream, ENGINE_GROUP, "t", 0, 1)
            .await
            .unwrap();
        engine.process_envelope(&graph, &batch[0]).await.unwrap();
    }
    assert_eq!(engine.get_status(&job_id).await.unwrap().semaphore, 1);

    // Claim the closing message and replicate the machine's commits through
    // Step 2, then "crash" before Step 3 and before the ack.
    let batch = store
        .stream_read(&stream, ENGINE_GROUP, "t", 0, 1)
        .await
        .unwrap();
    let env = &batch[0];
    let meta = &env.message.metadata;
    assert_eq!(meta.aid, "a3");
    let dad = meta.dad.trimmed();
    let guid = meta.guid.clone();
    let inc = |delta| TxnOp::IncrementLedger {
        job_id: job_id.clone(),
        activity_id: "a3".to_string(),
        dads: vec![dad.clone()],
        delta,
    };
    let ginc = |delta| TxnOp::IncrementGuidLedger {
        job_id: job_id.clone(),
        guid: guid.clone(),
        delta,
    };
    store.commit(vec![inc(ledger::ENTRY_DELTA)]).await.unwrap();
    store.commit(vec![inc(ledger::AUTHORIZE_DELTA)]).await.unwrap();
    store
        .commit(vec![inc(ledger::REENTRY_WEIGHT), ginc(ledger::REENTRY_WEIGHT)])
        .await
        .unwrap();
    store
        .commit(vec![ginc(ledger::STEP1_WEIGHT), inc(ledger::STEP1_WEIGHT)])
        .await
        .unwrap();
    store
        .commit(vec![
            TxnOp::SetStatusAndCollateGuid {
                job_id: job_id.clone(),
                delta: -1,
                threshold: 0,
                guid: guid.clone(),
                snapshot_weight: ledger::SNAPSHOT_WEIGHT,
            },
            ginc(ledger::STEP2_WEIGHT),
            inc(ledger::STEP2_WEIGHT),
        ])
        .await
        .unwrap();

    // The crash signature: step 2 committed, step 3 pending, snapshot held.
    let guid_value = store.read_guid_ledger(&job_id, &guid).await.unwrap();
    assert!(ledger::step2_done(guid_value));
    assert!(!ledger::step3_done(guid_value));
    assert!(ledger::snapshot_set(guid_value));
    assert_eq!(engine.get_status(&job_id).await.unwrap().semaphore, 0);

    // Redelivery resumes only the unfinished tail.
    engine.run_to_quiescence().await.unwrap();
    assert_eq!(
        engine.get_status(&job_id).await.unwrap().state,
        JobState::Completed
    );
    let timeline = engine.export(&job_id).await.unwrap();
    assert_eq!(
        count_events(&timeline, |e| matches!(e, JobEvent::CompletionTasksRan { .. })),
        1
    );
    assert_eq!(
        engine
            .store()
            .stream_depth(&publish_stream("fan.flow"))
            .await
            .unwrap(),
        1
    );
    assert!(ledger::step3_done(
        store.read_guid_ledger(&job_id, &guid).await.unwrap()
    ));
}

/// Scenario 4 — duplicate trigger: a fresh-guid restart surfaces
/// DuplicateJob; a same-guid redelivery after a crash during the first
/// attempt resumes the tail with no duplicate.
#[tokio::test]
async fn duplicate_trigger_and_crash_recovery() {
    let engine = engine_with(LINEAR).await;
    let options = StartOptions {
        job_id: Some("dup-1".to_string()),
        ..Default::default()
    };
    engine
        .start("linear.flow", json!({}), options.clone())
        .await
        .unwrap();
    let err = engine.start("linear.flow", json!({}), options).await;
    assert!(matches!(err, Err(EngineError::DuplicateJob(_))));

    // Crash-during-first-call: the conditional insert and the guid seed
    // committed, then the process died before the dispatch transaction.
    let store = engine.store().clone();
    let job_id = "crashed-1".to_string();
    let guid = "trigger-guid-1".to_string();
    let now = now_ms();
    store
        .commit(vec![
            TxnOp::CreateJobIfAbsent {
                job: Job {
                    job_id: job_id.clone(),
                    app_id: "linear.flow".into(),
                    topic: "linear.flow".into(),
                    generation_id: "gen-crash".into(),
                    semaphore: 1,
                    error: None,
                    parent: None,
                    created_at: now,
                    updated_at: now,
                    expire_ms: None,
                    expires_at: None,
                },
            },
            TxnOp::IncrementGuidLedger {
                job_id: job_id.clone(),
                guid: guid.clone(),
                delta: ledger::REENTRY_WEIGHT,
            },
        ])
        .await
        .unwrap();

    // The redelivered trigger message (same guid) observes a guid ledger
    // above the seed and resumes instead of raising DuplicateJob.
    store
        .commit(vec![TxnOp::StreamAppend {
            stream: topic_stream("linear.flow"),
            message: TransitionMessage {
                metadata: MessageMetadata {
                    guid,
                    jid: job_id.clone(),
                    gid: String::new(),
                    dad: DimensionalAddress::root(),
                    aid: "t1".into(),
                    topic: None,
                    spn: None,
                    trc: None,
                },
                kind: MessageType::Transition,
                data: json!({}),
                policies: None,
            },
        }])
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    let status = engine.get_status(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    let timeline = engine.export(&job_id).await.unwrap();
    assert_eq!(
        count_events(&timeline, |e| matches!(e, JobEvent::CompletionTasksRan { .. })),
        1
    );
}

/// Scenario 5 — cycle: the ancestor re-runs in a fresh, independent
/// dimensional subspace one past the previous iteration.
#[tokio::test]
async fn cycle_reenters_ancestor_at_fresh_dimension() {
    let engine = engine_with(CYCLE).await;
    let graph = engine.graphs().get("cycling.flow").unwrap();
    let store = engine.store().clone();
    let stream = topic_stream("cycling.flow");
    let job_id = engine
        .start("cycling.flow", json!({}), StartOptions::default())
        .await
        .unwrap();

    // a0 at ,0 then the cycle activity.
    for _ in 0..2 {
        let batch = store
            .stream_read(&stream, ENGINE_GROUP, "t", 0, 1)
            .await
            .unwrap();
        engine.process_envelope(&graph, &batch[0]).await.unwrap();
    }

    let root = DimensionalAddress::root();
    let iter1 = DimensionalAddress::parse(",0,1");
    let a0_first = store.read_activity_ledger(&job_id, "a0", &root).await.unwrap();
    assert_eq!(a0_first, 888_011_101_000_001);
    // The cycle primed the ancestor's next subspace and left the first
    // iteration untouched.
    assert_eq!(
        store.read_activity_ledger(&job_id, "a0", &iter1).await.unwrap(),
        ledger::BASE_SEED
    );

    // The re-targeting message names a0 at ,0,1.
    let batch = store
        .stream_read(&stream, ENGINE_GROUP, "t", 0, 1)
        .await
        .unwrap();
    let env = &batch[0];
    assert_eq!(env.message.metadata.aid, "a0");
    assert_eq!(env.message.metadata.dad.as_str(), ",0,1");

    engine.process_envelope(&graph, env).await.unwrap();
    assert_eq!(
        store.read_activity_ledger(&job_id, "a0", &iter1).await.unwrap(),
        888_011_101_000_001
    );
    // The base subspace accumulated only the re-entry tick that indexes
    // the next iteration.
    assert_eq!(
        store.read_activity_ledger(&job_id, "a0", &root).await.unwrap(),
        a0_first + ledger::REENTRY_WEIGHT
    );
}

/// Scenario 6 — hook + signal-one: the signal's Leg 1 bundles the hook
/// publish with its own completion marker; the paused hook resumes and
/// closes the job.
#[tokio::test]
async fn hook_and_signal_one() {
    let engine = engine_with(HOOK_SIGNAL).await;
    let job_id = engine
        .start("approval.flow", json!({"request": "r-7"}), StartOptions::default())
        .await
        .unwrap();

    engine.run_to_quiescence().await.unwrap();

    let status = engine.get_status(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);

    // The hook binding was consumed by the delivery.
    assert!(engine
        .store()
        .hook_by_key("approvals", &job_id)
        .await
        .unwrap()
        .is_none());

    let timeline = engine.export(&job_id).await.unwrap();
    assert_eq!(
        count_events(&timeline, |e| matches!(e, JobEvent::SignalDelivered { .. })),
        1
    );
    assert_eq!(
        count_events(&timeline, |e| matches!(e, JobEvent::HookRegistered { .. })),
        1
    );
    // The hook's wake message is the closer and carries the snapshot.
    let guid = closing_guid(&timeline);
    let guid_value = engine.store().read_guid_ledger(&job_id, &guid).await.unwrap();
    assert!(ledger::snapshot_set(guid_value));
    assert!(ledger::step3_done(guid_value));
}

/// Client-facing signal: a payload correlated by id wakes the paused hook.
#[tokio::test]
async fn client_signal_wakes_hook() {
    const HOOK_ONLY: &str = r#"
subscribes: waiting.flow
activities:
  - id: t1
    type: trigger
  - id: h1
    type: hook
    hook: { topic: reviews }
transitions:
  t1:
    h1: {}
"#;
    let engine = engine_with(HOOK_ONLY).await;
    let job_id = engine
        .start("waiting.flow", json!({}), StartOptions::default())
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();
    assert_eq!(
        engine.get_status(&job_id).await.unwrap().state,
        JobState::Running
    );

    engine
        .signal("reviews", json!({"id": job_id, "approved": true}))
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();
    assert_eq!(
        engine.get_status(&job_id).await.unwrap().state,
        JobState::Completed
    );
    let state = engine.get_state(&job_id).await.unwrap();
    assert_eq!(state["h1"]["output"]["approved"], json!(true));
}

/// Redelivering a fully processed Leg 2 message produces no writes beyond
/// the attempt counters.
#[tokio::test]
async fn redelivery_after_completion_is_inert() {
    let engine = engine_with(LINEAR).await;
    let store = engine.store().clone();
    let job_id = engine
        .start("linear.flow", json!({}), StartOptions::default())
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    let timeline = engine.export(&job_id).await.unwrap();
    let guid = child_guid(&timeline, "a1");
    let job = store.read_job(&job_id).await.unwrap().unwrap();

    // Replay the t1→a1 message verbatim.
    store
        .commit(vec![TxnOp::StreamAppend {
            stream: topic_stream("linear.flow"),
            message: TransitionMessage {
                metadata: MessageMetadata {
                    guid: guid.clone(),
                    jid: job_id.clone(),
                    gid: job.generation_id.clone(),
                    dad: DimensionalAddress::root(),
                    aid: "a1".into(),
                    topic: None,
                    spn: None,
                    trc: None,
                },
                kind: MessageType::Transition,
                data: json!({}),
                policies: None,
            },
        }])
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    // Attempt counters moved; nothing else did.
    let root = DimensionalAddress::root();
    let a1 = store.read_activity_ledger(&job_id, "a1", &root).await.unwrap();
    assert_eq!(a1, 888_011_101_000_001 + ledger::ENTRY_DELTA + ledger::REENTRY_WEIGHT);
    let timeline = engine.export(&job_id).await.unwrap();
    assert_eq!(
        count_events(&timeline, |e| matches!(e, JobEvent::CompletionTasksRan { .. })),
        1
    );
    assert_eq!(
        store.stream_depth(&publish_stream("linear.flow")).await.unwrap(),
        1
    );
}

/// Worker dispatch and response, including the retryable error path.
#[tokio::test]
async fn worker_roundtrip_with_retry() {
    let engine = engine_with(WORKER).await;
    let job_id = engine
        .start("worked.flow", json!({}), StartOptions::default())
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    // w1 parked on the worker stream.
    assert_eq!(
        engine.get_status(&job_id).await.unwrap().state,
        JobState::Running
    );
    let tasks = engine.claim_worker_tasks("tasks", 4).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].message.kind, MessageType::Await);

    // First attempt fails with a retryable code.
    engine
        .complete_worker_task(
            "tasks",
            &tasks[0],
            json!({"code": codes::RETRYABLE, "message": "transient"}),
        )
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    // The AWAIT was re-dispatched with a bumped try count.
    let tasks = engine.claim_worker_tasks("tasks", 4).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(
        tasks[0].message.data.get("tryCount").and_then(Value::as_u64),
        Some(1)
    );

    engine
        .complete_worker_task("tasks", &tasks[0], json!({"result": 42}))
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    let status = engine.get_status(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    let state = engine.get_state(&job_id).await.unwrap();
    assert_eq!(state["w1"]["output"]["result"], json!(42));
}

/// A fatal worker error closes the branch, records the job error, and
/// still runs the completion tasks.
#[tokio::test]
async fn fatal_worker_error_still_completes_job() {
    let engine = engine_with(WORKER).await;
    let job_id = engine
        .start("worked.flow", json!({}), StartOptions::default())
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    let tasks = engine.claim_worker_tasks("tasks", 1).await.unwrap();
    engine
        .complete_worker_task(
            "tasks",
            &tasks[0],
            json!({"code": codes::FATAL, "message": "unrecoverable"}),
        )
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    let status = engine.get_status(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Errored);
    assert_eq!(status.error.as_ref().unwrap().code, codes::FATAL);
    let timeline = engine.export(&job_id).await.unwrap();
    assert_eq!(
        count_events(&timeline, |e| matches!(e, JobEvent::CompletionTasksRan { .. })),
        1
    );
}

/// Sleep hooks wake through the durable timer index.
#[tokio::test]
async fn sleep_hook_wakes_on_deadline() {
    let engine = engine_with(SLEEPER).await;
    let job_id = engine
        .start("sleeping.flow", json!({}), StartOptions::default())
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();
    assert_eq!(
        engine.get_status(&job_id).await.unwrap().state,
        JobState::Running
    );

    // Nothing fires before the deadline.
    assert_eq!(engine.fire_due_timers(now_ms() - 1_000).await.unwrap(), 0);
    assert_eq!(engine.fire_due_timers(now_ms() + 1_000).await.unwrap(), 1);
    engine.run_to_quiescence().await.unwrap();
    assert_eq!(
        engine.get_status(&job_id).await.unwrap().state,
        JobState::Completed
    );
}

/// Iterate fans out one isolated invocation per collection element.
#[tokio::test]
async fn iterate_fans_out_per_element() {
    let engine = engine_with(ITERATE).await;
    let job_id = engine
        .start(
            "iterating.flow",
            json!({"items": [1, 2, 3]}),
            StartOptions::default(),
        )
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    let status = engine.get_status(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    let timeline = engine.export(&job_id).await.unwrap();
    assert_eq!(
        count_events(&timeline, |e| matches!(
            e,
            JobEvent::ChildSpawned { source_activity_id, .. } if source_activity_id == "it1"
        )),
        3
    );
}

/// Leg-1 attempts beyond the wire cap fail with MAXED before the increment
/// is applied.
#[tokio::test]
async fn maxed_enforced_before_entry_increment() {
    let engine = engine_with(LINEAR).await;
    let graph = engine.graphs().get("linear.flow").unwrap();
    let store = engine.store().clone();
    let job_id = engine
        .start("linear.flow", json!({}), StartOptions::default())
        .await
        .unwrap();
    let job = store.read_job(&job_id).await.unwrap().unwrap();

    let env = StreamEnvelope {
        id: String::new(),
        delivery_count: ledger::MAX_LEG1_ATTEMPTS + 1,
        message: TransitionMessage {
            metadata: MessageMetadata {
                guid: "overtried".into(),
                jid: job_id.clone(),
                gid: job.generation_id.clone(),
                dad: DimensionalAddress::root(),
                aid: "a1".into(),
                topic: None,
                spn: None,
                trc: None,
            },
            kind: MessageType::Transition,
            data: json!({}),
            policies: None,
        },
    };
    let before = store
        .read_activity_ledger(&job_id, "a1", &DimensionalAddress::root())
        .await
        .unwrap();
    let err = engine.process_envelope(&graph, &env).await.unwrap_err();
    assert!(matches!(err, EngineError::Maxed { .. }));
    assert_eq!(err.code(), codes::MAXED);
    // Enforced before the increment, not after.
    let after = store
        .read_activity_ledger(&job_id, "a1", &DimensionalAddress::root())
        .await
        .unwrap();
    assert_eq!(before, after);
}

/// Expired jobs are physically removed by the sweep.
#[tokio::test]
async fn completed_job_expires_and_sweeps() {
    let engine = engine_with(LINEAR).await;
    let job_id = engine
        .start(
            "linear.flow",
            json!({}),
            StartOptions {
                expire: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();
    assert_eq!(
        engine.get_status(&job_id).await.unwrap().state,
        JobState::Completed
    );

    let swept = engine.sweep_expired(now_ms() + 60_000).await.unwrap();
    assert_eq!(swept, 1);
    assert!(matches!(
        engine.get_status(&job_id).await,
        Err(EngineError::JobNotFound(_))
    ));
}

/// Child workflows: an await activity starts a child job and resumes on
/// its terminal response.
#[tokio::test]
async fn child_workflow_roundtrip() {
    const PARENT: &str = r#"
subscribes: parent.flow
activities:
  - id: t1
    type: trigger
  - id: spawn
    type: await
    child_topic: child.flow
transitions:
  t1:
    spawn: {}
"#;
    const CHILD: &str = r#"
subscribes: child.flow
activities:
  - id: t1
    type: trigger
  - id: a1
    type: await
transitions:
  t1:
    a1: {}
"#;
    let engine = Engine::new(Arc::new(MemoryStore::new()));
    engine.register_graph_yaml(PARENT).await.unwrap();
    engine.register_graph_yaml(CHILD).await.unwrap();

    let job_id = engine
        .start("parent.flow", json!({}), StartOptions::default())
        .await
        .unwrap();
    engine.run_to_quiescence().await.unwrap();

    assert_eq!(
        engine.get_status(&job_id).await.unwrap().state,
        JobState::Completed
    );
    let child_id = format!("{job_id}:spawn");
    let child = engine.get_status(&child_id).await.unwrap();
    assert_eq!(child.state, JobState::Completed);
    // The child's terminal response resumed the parent activity.
    let state = engine.get_state(&job_id).await.unwrap();
    assert_eq!(state["spawn"]["output"]["jobId"], json!(child_id));
}
