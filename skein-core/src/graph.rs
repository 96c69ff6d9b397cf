//! Compiled workflow graphs.
//!
//! A graph manifest (YAML) names activities and the transition rules between
//! them. Compilation validates the shape (exactly one trigger, acyclic
//! transition edges — cycles are expressed by `Cycle` activities, not
//! edges), precomputes each activity's ancestor list by DFS from the
//! trigger, and stamps a content-addressed version key.

use crate::types::RetryPolicy;
use anyhow::{anyhow, bail, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

// ─── Activity model ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    /// Creates the job row; the unique graph entry point.
    Trigger,
    /// Plain duplex activity; both legs run on one claimed message.
    Await,
    /// Dispatches payload to a worker topic; Leg 2 on the response.
    Worker,
    /// Leg-1-only; re-targets an ancestor at a fresh dimensional index.
    Cycle,
    /// Pauses on a webhook topic and/or a sleep duration.
    Hook,
    /// Leg-1-only; delivers a payload into paused hooks.
    Signal,
    /// Fans out one child per element of a collection in job state.
    Iterate,
    /// Leg-1-only; sets the interrupt sentinel and wakes paused hooks.
    Interrupt,
}

/// How a signal activity resolves its targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalScope {
    /// One hook, resolved by correlation key, delivered transactionally.
    One,
    /// Every hook registered under the topic, best-effort per target.
    All,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookSpec {
    /// Webhook topic to pause on.
    #[serde(default)]
    pub topic: Option<String>,
    /// Path into job state resolved to the correlation key at registration;
    /// defaults to the job id.
    #[serde(default)]
    pub key_path: Option<String>,
    /// Sleep duration in milliseconds; registers a durable timer.
    #[serde(default)]
    pub sleep_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalSpec {
    pub topic: String,
    /// Path into the signal payload resolved to the correlation key;
    /// defaults to the payload's `id` field.
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default = "default_signal_scope")]
    pub scope: SignalScope,
}

fn default_signal_scope() -> SignalScope {
    SignalScope::One
}

/// One node of a compiled graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    #[serde(default)]
    pub subtype: Option<String>,
    /// Ordered activity ids from the trigger to (excluding) this activity.
    /// Computed at compile time; empty in manifests.
    #[serde(default)]
    pub ancestors: Vec<String>,
    /// Producer activity id → paths this activity reads.
    #[serde(default)]
    pub consumes: BTreeMap<String, Vec<String>>,
    /// Paths this activity writes.
    #[serde(default)]
    pub produces: Vec<String>,
    /// Keeps Leg 2 open across re-entries.
    #[serde(default)]
    pub cyclic: bool,
    /// Worker topic (Worker activities).
    #[serde(default)]
    pub worker_topic: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Hook registration (Hook activities).
    #[serde(default)]
    pub hook: Option<HookSpec>,
    /// Signal delivery (Signal activities).
    #[serde(default)]
    pub signal: Option<SignalSpec>,
    /// Ancestor re-targeted by a Cycle activity.
    #[serde(default)]
    pub cycle_ancestor: Option<String>,
    /// Topic of the child graph started by an Await-child activity.
    #[serde(default)]
    pub child_topic: Option<String>,
    /// Path to the collection an Iterate activity fans out over.
    #[serde(default)]
    pub iterate_path: Option<String>,
}

// ─── Transition rules ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Exists,
}

/// Boolean expression over flat job state gating one transition edge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub path: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn eval(&self, state: &BTreeMap<String, Value>) -> bool {
        let actual = state.get(&self.path);
        match self.op {
            ConditionOp::Exists => actual.is_some(),
            ConditionOp::Eq => actual == Some(&self.value),
            ConditionOp::Neq => actual != Some(&self.value),
            ConditionOp::Lt => cmp_f64(actual, &self.value).map(|o| o.is_lt()).unwrap_or(false),
            ConditionOp::Gt => cmp_f64(actual, &self.value).map(|o| o.is_gt()).unwrap_or(false),
        }
    }
}

fn cmp_f64(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let a = actual?.as_f64()?;
    let b = expected.as_f64()?;
    a.partial_cmp(&b)
}

/// One outgoing edge: unconditional when `condition` is absent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransitionRule {
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl TransitionRule {
    pub fn qualifies(&self, state: &BTreeMap<String, Value>) -> bool {
        self.condition.as_ref().map(|c| c.eval(state)).unwrap_or(true)
    }
}

// ─── Manifest and compiled form ───────────────────────────────

/// The YAML-authored graph definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphManifest {
    /// Topic this graph subscribes to; `Engine::start` routes by it.
    pub subscribes: String,
    /// Topic terminal responses are published on; defaults to `subscribes`.
    #[serde(default)]
    pub publishes: Option<String>,
    /// Job completion threshold; 0 unless an expiring-persistent flow
    /// raises it.
    #[serde(default)]
    pub completion_threshold: i64,
    pub activities: Vec<ActivityConfig>,
    /// source activity id → (target activity id → rule).
    #[serde(default)]
    pub transitions: BTreeMap<String, BTreeMap<String, TransitionRule>>,
}

/// A validated graph with ancestors attached and a version key.
#[derive(Clone, Debug)]
pub struct CompiledGraph {
    pub subscribes: String,
    pub publishes: String,
    pub completion_threshold: i64,
    /// SHA-256 of the canonical manifest — the version key.
    pub version: [u8; 32],
    pub trigger_id: String,
    pub activities: BTreeMap<String, ActivityConfig>,
    /// source activity id → ordered (target id, rule) pairs.
    pub transitions: BTreeMap<String, Vec<(String, TransitionRule)>>,
    /// target activity id → ordered source ids (fan-in edges).
    pub parents: BTreeMap<String, Vec<String>>,
}

impl CompiledGraph {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: GraphManifest = serde_yaml::from_str(yaml)?;
        compile(manifest)
    }

    pub fn activity(&self, id: &str) -> Option<&ActivityConfig> {
        self.activities.get(id)
    }

    /// Ordered incoming edges of `target`. A target with several parents
    /// gets one invocation per edge, each in its own dimensional subspace.
    pub fn incoming(&self, target: &str) -> &[String] {
        self.parents
            .get(target)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Paths read by the transition conditions out of `source`; the Leg 2
    /// driver fetches exactly these before evaluating the adjacency list.
    pub fn condition_paths(&self, source: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .transitions
            .get(source)
            .map(|edges| {
                edges
                    .iter()
                    .filter_map(|(_, rule)| rule.condition.as_ref())
                    .map(|c| c.path.clone())
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out.dedup();
        out
    }

    /// Evaluate the adjacency list for `source` against flat state: the
    /// targets whose rules qualify, in manifest order.
    pub fn qualifying_targets(
        &self,
        source: &str,
        state: &BTreeMap<String, Value>,
    ) -> Vec<&ActivityConfig> {
        self.transitions
            .get(source)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|(_, rule)| rule.qualifies(state))
                    .filter_map(|(target, _)| self.activities.get(target))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Compiled graphs by subscribed topic. Read-only after registration, so
/// lookups clone an `Arc` and never hold the lock across awaits.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: std::sync::RwLock<HashMap<String, std::sync::Arc<CompiledGraph>>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, graph: CompiledGraph) -> std::sync::Arc<CompiledGraph> {
        let arc = std::sync::Arc::new(graph);
        self.graphs
            .write()
            .expect("graph registry poisoned")
            .insert(arc.subscribes.clone(), arc.clone());
        arc
    }

    pub fn get(&self, topic: &str) -> Option<std::sync::Arc<CompiledGraph>> {
        self.graphs
            .read()
            .expect("graph registry poisoned")
            .get(topic)
            .cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        self.graphs
            .read()
            .expect("graph registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// Validate a manifest and attach the compile-time artifacts.
pub fn compile(manifest: GraphManifest) -> Result<CompiledGraph> {
    let canonical = serde_json::to_vec(&manifest)?;
    let version: [u8; 32] = Sha256::digest(&canonical).into();

    let mut activities = BTreeMap::new();
    for activity in &manifest.activities {
        if activities.insert(activity.id.clone(), activity.clone()).is_some() {
            bail!("duplicate activity id: {}", activity.id);
        }
    }

    let triggers: Vec<&ActivityConfig> = manifest
        .activities
        .iter()
        .filter(|a| a.kind == ActivityKind::Trigger)
        .collect();
    let trigger_id = match triggers.as_slice() {
        [one] => one.id.clone(),
        [] => bail!("graph {} has no trigger", manifest.subscribes),
        many => bail!(
            "graph {} has {} triggers; exactly one required",
            manifest.subscribes,
            many.len()
        ),
    };

    // Transition edges form a DAG; cyclic flow is expressed by Cycle
    // activities re-targeting ancestors, never by edges.
    let mut dag: DiGraph<String, ()> = DiGraph::new();
    let mut index: HashMap<String, NodeIndex> = HashMap::new();
    for id in activities.keys() {
        index.insert(id.clone(), dag.add_node(id.clone()));
    }
    let mut transitions: BTreeMap<String, Vec<(String, TransitionRule)>> = BTreeMap::new();
    let mut parents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (source, edges) in &manifest.transitions {
        let from = *index
            .get(source)
            .ok_or_else(|| anyhow!("transition source {source} is not an activity"))?;
        for (target, rule) in edges {
            let to = *index
                .get(target)
                .ok_or_else(|| anyhow!("transition target {target} is not an activity"))?;
            dag.add_edge(from, to, ());
            transitions
                .entry(source.clone())
                .or_default()
                .push((target.clone(), rule.clone()));
            parents
                .entry(target.clone())
                .or_default()
                .push(source.clone());
        }
    }
    if petgraph::algo::is_cyclic_directed(&dag) {
        bail!("graph {} has cyclic transition edges", manifest.subscribes);
    }

    for activity in activities.values() {
        if activity.kind == ActivityKind::Cycle {
            let ancestor = activity
                .cycle_ancestor
                .as_deref()
                .ok_or_else(|| anyhow!("cycle activity {} names no ancestor", activity.id))?;
            if !activities.contains_key(ancestor) {
                bail!("cycle activity {} targets unknown ancestor {ancestor}", activity.id);
            }
        }
        if activity.kind == ActivityKind::Worker && activity.worker_topic.is_none() {
            bail!("worker activity {} has no worker topic", activity.id);
        }
        if activity.kind == ActivityKind::Signal && activity.signal.is_none() {
            bail!("signal activity {} has no signal spec", activity.id);
        }
        if activity.kind == ActivityKind::Hook && activity.hook.is_none() {
            bail!("hook activity {} has no hook spec", activity.id);
        }
    }

    // Ancestor lists: the DFS path from the trigger at first visit.
    let mut ancestors: HashMap<String, Vec<String>> = HashMap::new();
    let mut path: Vec<String> = Vec::new();
    dfs_ancestors(&trigger_id, &transitions, &mut path, &mut ancestors);
    for activity in activities.values_mut() {
        activity.ancestors = ancestors.remove(&activity.id).unwrap_or_default();
    }

    // Cycle ancestors must actually be ancestors of the cycle activity.
    for activity in activities.values() {
        if let Some(ancestor) = activity.cycle_ancestor.as_deref() {
            if !activity.ancestors.iter().any(|a| a == ancestor) {
                bail!(
                    "cycle activity {} targets {ancestor}, which is not among its ancestors",
                    activity.id
                );
            }
        }
    }

    let publishes = manifest
        .publishes
        .clone()
        .unwrap_or_else(|| manifest.subscribes.clone());

    Ok(CompiledGraph {
        subscribes: manifest.subscribes,
        publishes,
        completion_threshold: manifest.completion_threshold,
        version,
        trigger_id,
        activities,
        transitions,
        parents,
    })
}

fn dfs_ancestors(
    current: &str,
    transitions: &BTreeMap<String, Vec<(String, TransitionRule)>>,
    path: &mut Vec<String>,
    out: &mut HashMap<String, Vec<String>>,
) {
    out.entry(current.to_string()).or_insert_with(|| path.clone());
    path.push(current.to_string());
    if let Some(edges) = transitions.get(current) {
        for (target, _) in edges {
            if !out.contains_key(target) {
                dfs_ancestors(target, transitions, path, out);
            }
        }
    }
    path.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LINEAR: &str = r#"
subscribes: order.process
activities:
  - id: t1
    type: trigger
  - id: a1
    type: await
    produces: [a1.output]
transitions:
  t1:
    a1: {}
"#;

    const FAN_OUT: &str = r#"
subscribes: fan.out
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
    a3:
      condition: { path: "a2.skip", op: neq, value: true }
"#;

    #[test]
    fn compiles_linear_graph() {
        let graph = CompiledGraph::from_yaml(LINEAR).unwrap();
        assert_eq!(graph.trigger_id, "t1");
        assert_eq!(graph.publishes, "order.process");
        assert_eq!(graph.activity("a1").unwrap().ancestors, vec!["t1"]);
        assert!(graph.activity("t1").unwrap().ancestors.is_empty());
    }

    #[test]
    fn ancestors_follow_first_dfs_visit() {
        let graph = CompiledGraph::from_yaml(FAN_OUT).unwrap();
        assert_eq!(graph.activity("a3").unwrap().ancestors, vec!["t1", "a1"]);
    }

    #[test]
    fn rejects_multiple_triggers() {
        let yaml = r#"
subscribes: bad
activities:
  - id: t1
    type: trigger
  - id: t2
    type: trigger
"#;
        let err = CompiledGraph::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("2 triggers"));
    }

    #[test]
    fn rejects_missing_trigger() {
        let yaml = r#"
subscribes: bad
activities:
  - id: a1
    type: await
"#;
        assert!(CompiledGraph::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_cyclic_edges() {
        let yaml = r#"
subscribes: bad
activities:
  - id: t1
    type: trigger
  - id: a1
    type: await
transitions:
  t1:
    a1: {}
  a1:
    t1: {}
"#;
        let err = CompiledGraph::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("cyclic"));
    }

    #[test]
    fn cycle_activity_must_target_real_ancestor() {
        let yaml = r#"
subscribes: bad
activities:
  - id: t1
    type: trigger
  - id: a1
    type: await
  - id: c1
    type: cycle
    cycle_ancestor: a2
  - id: a2
    type: await
transitions:
  t1:
    a1: {}
  a1:
    c1: {}
"#;
        let err = CompiledGraph::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("not among its ancestors"));
    }

    #[test]
    fn transition_conditions_gate_targets() {
        let graph = CompiledGraph::from_yaml(FAN_OUT).unwrap();
        let mut state = BTreeMap::new();
        let targets: Vec<&str> = graph
            .qualifying_targets("a2", &state)
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(targets, vec!["a3"]);
        state.insert("a2.skip".to_string(), json!(true));
        assert!(graph.qualifying_targets("a2", &state).is_empty());
        // Unconditional edges always qualify.
        assert_eq!(graph.qualifying_targets("t1", &state).len(), 2);
    }

    #[test]
    fn version_is_content_addressed() {
        let g1 = CompiledGraph::from_yaml(LINEAR).unwrap();
        let g2 = CompiledGraph::from_yaml(LINEAR).unwrap();
        let g3 = CompiledGraph::from_yaml(FAN_OUT).unwrap();
        assert_eq!(g1.version, g2.version);
        assert_ne!(g1.version, g3.version);
    }

    #[test]
    fn condition_operators() {
        let mut state = BTreeMap::new();
        state.insert("n".to_string(), json!(5));
        let lt = Condition {
            path: "n".into(),
            op: ConditionOp::Lt,
            value: json!(10),
        };
        assert!(lt.eval(&state));
        let gt = Condition {
            path: "n".into(),
            op: ConditionOp::Gt,
            value: json!(10),
        };
        assert!(!gt.eval(&state));
        let exists = Condition {
            path: "missing".into(),
            op: ConditionOp::Exists,
            value: Value::Null,
        };
        assert!(!exists.eval(&state));
    }
}
