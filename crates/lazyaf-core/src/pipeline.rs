//! Pipeline graph definitions and edge-condition semantics.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::runner::Labels;
use crate::step::{StepConfig, StepOutcome};
use crate::{Error, Result};

pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

fn default_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

/// One node in the step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub config: StepConfig,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Pins the next step along outgoing edges to the same runner.
    #[serde(default)]
    pub continue_in_context: bool,
    #[serde(default)]
    pub on_success: SuccessPolicy,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Label requirements that drive remote routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Labels>,
}

/// What to do when a step succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SuccessPolicy {
    #[default]
    Next,
    Stop,
    /// Merge the run's working branch into the named branch.
    Merge(String),
}

/// What to do when a step fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    Next,
    #[default]
    Stop,
    /// Enqueue another pipeline or card as a side action.
    Trigger(String),
}

impl std::fmt::Display for SuccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuccessPolicy::Next => write!(f, "next"),
            SuccessPolicy::Stop => write!(f, "stop"),
            SuccessPolicy::Merge(branch) => write!(f, "merge:{branch}"),
        }
    }
}

impl std::str::FromStr for SuccessPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "next" => Ok(SuccessPolicy::Next),
            "stop" => Ok(SuccessPolicy::Stop),
            _ => match s.strip_prefix("merge:") {
                Some(branch) if !branch.is_empty() => Ok(SuccessPolicy::Merge(branch.to_string())),
                _ => Err(Error::Validation(format!("bad on_success policy: {s}"))),
            },
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Next => write!(f, "next"),
            FailurePolicy::Stop => write!(f, "stop"),
            FailurePolicy::Trigger(id) => write!(f, "trigger:{id}"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "next" => Ok(FailurePolicy::Next),
            "stop" => Ok(FailurePolicy::Stop),
            _ => match s.strip_prefix("trigger:") {
                Some(id) if !id.is_empty() => Ok(FailurePolicy::Trigger(id.to_string())),
                _ => Err(Error::Validation(format!("bad on_failure policy: {s}"))),
            },
        }
    }
}

// Policies serialize as their string forms ("next", "merge:main", ...).
impl Serialize for SuccessPolicy {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SuccessPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for FailurePolicy {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FailurePolicy {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Condition carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    Success,
    Failure,
    Always,
}

impl EdgeCondition {
    pub fn matches(&self, outcome: StepOutcome) -> bool {
        match self {
            EdgeCondition::Success => outcome == StepOutcome::Success,
            EdgeCondition::Failure => outcome == StepOutcome::Failure,
            EdgeCondition::Always => true,
        }
    }
}

/// A directed edge between steps. Insertion order in the edge list is the
/// tie-break order for simultaneously satisfied edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default = "Edge::default_condition")]
    pub condition: EdgeCondition,
}

impl Edge {
    fn default_condition() -> EdgeCondition {
        EdgeCondition::Success
    }
}

/// The full step graph of a pipeline. Entry points are modeled as edges from
/// a synthetic start node, satisfied at run start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepsGraph {
    pub steps: BTreeMap<String, PipelineStep>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position: Option<String>,
}

impl StepsGraph {
    /// A single-step graph, used for standalone card jobs.
    pub fn single(step: PipelineStep) -> Self {
        let id = step.id.clone();
        let mut steps = BTreeMap::new();
        steps.insert(id.clone(), step);
        Self {
            steps,
            edges: Vec::new(),
            entry_points: vec![id],
            start_position: None,
        }
    }

    /// Edges leaving `step_id`, in insertion order.
    pub fn outbound(&self, step_id: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == step_id)
    }

    /// Edges entering `step_id`, in insertion order.
    pub fn inbound(&self, step_id: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == step_id)
    }

    /// Stable index of a step, used to build execution keys.
    pub fn step_index(&self, step_id: &str) -> Option<u32> {
        self.steps.keys().position(|k| k == step_id).map(|i| i as u32)
    }

    /// Reject graphs the walker cannot execute: dangling edge endpoints,
    /// unknown entry points, no entry point at all, or a cycle.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::Validation("pipeline has no steps".into()));
        }
        let entry_points = self.effective_entry_points();
        if entry_points.is_empty() {
            return Err(Error::Validation("pipeline has no entry points".into()));
        }
        for ep in &entry_points {
            if !self.steps.contains_key(ep) {
                return Err(Error::Validation(format!("unknown entry point: {ep}")));
            }
        }
        for edge in &self.edges {
            if !self.steps.contains_key(&edge.from) {
                return Err(Error::Validation(format!("edge from unknown step: {}", edge.from)));
            }
            if !self.steps.contains_key(&edge.to) {
                return Err(Error::Validation(format!("edge to unknown step: {}", edge.to)));
            }
        }
        self.check_acyclic()?;
        Ok(())
    }

    /// Declared entry points, or every step without inbound edges when none
    /// are declared.
    pub fn effective_entry_points(&self) -> Vec<String> {
        if !self.entry_points.is_empty() {
            return self.entry_points.clone();
        }
        self.steps
            .keys()
            .filter(|id| self.inbound(id).next().is_none())
            .cloned()
            .collect()
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

        fn visit<'a>(
            graph: &'a StepsGraph,
            id: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
        ) -> Result<()> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(Error::Validation(format!("cycle through step {id}")));
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            for edge in graph.outbound(id) {
                visit(graph, &edge.to, marks)?;
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for id in self.steps.keys() {
            visit(self, id, &mut marks)?;
        }
        Ok(())
    }

    /// Steps reachable from the entry points; anything else never runs.
    pub fn reachable(&self) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = self.effective_entry_points();
        while let Some(id) = stack.pop() {
            if seen.insert(id.clone()) {
                for edge in self.outbound(&id) {
                    stack.push(edge.to.clone());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepConfig;

    fn script_step(id: &str) -> PipelineStep {
        PipelineStep {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::Script {
                command: "true".to_string(),
                working_dir: None,
            },
            timeout_seconds: DEFAULT_STEP_TIMEOUT_SECS,
            continue_in_context: false,
            on_success: SuccessPolicy::Next,
            on_failure: FailurePolicy::Stop,
            requires: None,
        }
    }

    fn graph(steps: &[&str], edges: &[(&str, &str, EdgeCondition)], entries: &[&str]) -> StepsGraph {
        StepsGraph {
            steps: steps.iter().map(|id| (id.to_string(), script_step(id))).collect(),
            edges: edges
                .iter()
                .map(|(from, to, condition)| Edge {
                    from: from.to_string(),
                    to: to.to_string(),
                    condition: *condition,
                })
                .collect(),
            entry_points: entries.iter().map(|s| s.to_string()).collect(),
            start_position: None,
        }
    }

    #[test]
    fn policies_round_trip() {
        for s in ["next", "stop", "merge:main", "merge:release/1.0"] {
            let p: SuccessPolicy = s.parse().unwrap();
            assert_eq!(p.to_string(), s);
        }
        for s in ["next", "stop", "trigger:abc123"] {
            let p: FailurePolicy = s.parse().unwrap();
            assert_eq!(p.to_string(), s);
        }
        assert!("merge:".parse::<SuccessPolicy>().is_err());
        assert!("retry".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn edge_conditions() {
        assert!(EdgeCondition::Success.matches(StepOutcome::Success));
        assert!(!EdgeCondition::Success.matches(StepOutcome::Failure));
        assert!(EdgeCondition::Failure.matches(StepOutcome::Failure));
        assert!(EdgeCondition::Always.matches(StepOutcome::Success));
        assert!(EdgeCondition::Always.matches(StepOutcome::Failure));
    }

    #[test]
    fn validate_rejects_cycles() {
        let g = graph(
            &["a", "b"],
            &[
                ("a", "b", EdgeCondition::Success),
                ("b", "a", EdgeCondition::Success),
            ],
            &["a"],
        );
        assert!(g.validate().is_err());
    }

    #[test]
    fn validate_rejects_dangling_edges() {
        let g = graph(&["a"], &[("a", "ghost", EdgeCondition::Success)], &["a"]);
        assert!(g.validate().is_err());
    }

    #[test]
    fn entry_points_default_to_roots() {
        let g = graph(&["a", "b"], &[("a", "b", EdgeCondition::Success)], &[]);
        assert_eq!(g.effective_entry_points(), vec!["a".to_string()]);
        g.validate().unwrap();
    }

    #[test]
    fn reachability_ignores_detached_steps() {
        let g = graph(
            &["a", "b", "island"],
            &[("a", "b", EdgeCondition::Success)],
            &["a"],
        );
        let reachable = g.reachable();
        assert!(reachable.contains("a"));
        assert!(reachable.contains("b"));
        assert!(!reachable.contains("island"));
    }

    #[test]
    fn step_index_is_stable() {
        let g = graph(&["a", "b", "c"], &[], &["a"]);
        assert_eq!(g.step_index("a"), Some(0));
        assert_eq!(g.step_index("c"), Some(2));
        assert_eq!(g.step_index("nope"), None);
    }
}
