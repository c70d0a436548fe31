//! Repo-side pipeline definitions: `.lazyaf/pipelines/*.yaml`.
//!
//! Definitions are read live from the branch's HEAD. A document declares its
//! steps as a list; edges are explicit, or implied sequentially when absent.

use serde::{Deserialize, Serialize};

use lazyaf_core::pipeline::{Edge, EdgeCondition, PipelineStep, StepsGraph};
use lazyaf_core::trigger::TriggerSpec;

use crate::{ConfigError, ConfigResult};

/// Directory inside a repository that holds pipeline definitions.
pub const PIPELINE_DIR: &str = ".lazyaf/pipelines";

/// One parsed pipeline document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDoc {
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    pub steps: Vec<PipelineStep>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub entry_points: Vec<String>,
}

impl PipelineDoc {
    /// Convert to the executable graph form. Documents without explicit
    /// edges chain their steps in declaration order.
    pub fn into_graph(self) -> ConfigResult<(String, Vec<TriggerSpec>, StepsGraph)> {
        let mut edges = self.edges;
        let mut entry_points = self.entry_points;

        if edges.is_empty() && self.steps.len() > 1 {
            edges = self
                .steps
                .windows(2)
                .map(|pair| Edge {
                    from: pair[0].id.clone(),
                    to: pair[1].id.clone(),
                    condition: EdgeCondition::Success,
                })
                .collect();
        }
        if entry_points.is_empty() {
            if let Some(first) = self.steps.first() {
                entry_points = vec![first.id.clone()];
            }
        }

        let graph = StepsGraph {
            steps: self
                .steps
                .into_iter()
                .map(|step| (step.id.clone(), step))
                .collect(),
            edges,
            entry_points,
            start_position: None,
        };
        graph
            .validate()
            .map_err(|e| ConfigError::InvalidPipeline(e.to_string()))?;
        Ok((self.name, self.triggers, graph))
    }
}

/// Parse a single YAML document.
pub fn parse_pipeline_yaml(yaml: &str) -> ConfigResult<PipelineDoc> {
    let doc: PipelineDoc = serde_yaml::from_str(yaml)?;
    if doc.name.is_empty() {
        return Err(ConfigError::InvalidPipeline("pipeline has no name".into()));
    }
    if doc.steps.is_empty() {
        return Err(ConfigError::InvalidPipeline(format!(
            "pipeline {} has no steps",
            doc.name
        )));
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyaf_core::pipeline::{FailurePolicy, SuccessPolicy};
    use lazyaf_core::step::StepKind;

    const BASIC: &str = r#"
name: ci
triggers:
  - type: push
    branches: ["main", "release/*"]
steps:
  - id: test
    name: Run tests
    type: script
    command: cargo test
  - id: publish
    name: Publish
    type: docker
    image: ghcr.io/acme/publisher:1
    on_success: "merge:main"
"#;

    #[test]
    fn parses_and_chains_sequentially() {
        let doc = parse_pipeline_yaml(BASIC).unwrap();
        let (name, triggers, graph) = doc.into_graph().unwrap();
        assert_eq!(name, "ci");
        assert_eq!(triggers.len(), 1);
        assert_eq!(graph.steps.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].from, "test");
        assert_eq!(graph.edges[0].to, "publish");
        assert_eq!(graph.effective_entry_points(), vec!["test".to_string()]);
        assert_eq!(graph.steps["test"].config.kind(), StepKind::Script);
        assert_eq!(
            graph.steps["publish"].on_success,
            SuccessPolicy::Merge("main".into())
        );
        assert_eq!(graph.steps["publish"].on_failure, FailurePolicy::Stop);
    }

    #[test]
    fn explicit_edges_win() {
        let yaml = r#"
name: fanout
steps:
  - id: a
    name: a
    type: script
    command: "true"
  - id: b
    name: b
    type: script
    command: "true"
  - id: cleanup
    name: cleanup
    type: script
    command: "true"
edges:
  - from: a
    to: b
    condition: success
  - from: a
    to: cleanup
    condition: always
entry_points: [a]
"#;
        let (_, _, graph) = parse_pipeline_yaml(yaml).unwrap().into_graph().unwrap();
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.outbound("a").count(), 2);
    }

    #[test]
    fn agent_steps_parse() {
        let yaml = r#"
name: fixer
steps:
  - id: fix
    name: Fix the bug
    type: agent
    title: Fix flaky test
    description: The websocket test is flaky on CI
    runner_type: claude
    continue_in_context: true
    timeout_seconds: 1200
"#;
        let (_, _, graph) = parse_pipeline_yaml(yaml).unwrap().into_graph().unwrap();
        let step = &graph.steps["fix"];
        assert_eq!(step.config.kind(), StepKind::Agent);
        assert!(step.continue_in_context);
        assert_eq!(step.timeout_seconds, 1200);
    }

    #[test]
    fn rejects_nameless_and_empty() {
        assert!(parse_pipeline_yaml("name: \"\"\nsteps: []").is_err());
        assert!(parse_pipeline_yaml("name: x\nsteps: []").is_err());
    }
}
