//! Trigger events, dedup keys, and completion action plans.

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::card::CardStatus;

pub const TRIGGER_DEDUP_WINDOW_SECS: u64 = 3600;

/// An external event that may start a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    Manual {
        pipeline_id: ResourceId,
        run_id: ResourceId,
    },
    CardComplete {
        card_id: ResourceId,
        status: CardStatus,
    },
    Push {
        repo_id: ResourceId,
        #[serde(rename = "ref")]
        git_ref: String,
        old_sha: String,
        new_sha: String,
    },
}

impl TriggerEvent {
    /// Dedup identifier. Identical keys within the window produce at most
    /// one run. Manual keys are unique by construction.
    pub fn trigger_key(&self) -> String {
        match self {
            TriggerEvent::Manual { pipeline_id, run_id } => {
                format!("manual:{pipeline_id}:{run_id}")
            }
            TriggerEvent::CardComplete { card_id, status } => {
                format!("card:{card_id}:{status}")
            }
            TriggerEvent::Push { repo_id, git_ref, new_sha, .. } => {
                format!("push:{repo_id}:{git_ref}:{new_sha}")
            }
        }
    }

    pub fn trigger_type(&self) -> &'static str {
        match self {
            TriggerEvent::Manual { .. } => "manual",
            TriggerEvent::CardComplete { .. } => "card_complete",
            TriggerEvent::Push { .. } => "push",
        }
    }
}

/// Action to run when the pipeline completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassAction {
    /// Merge the card branch into the repo's default branch, card → done.
    Merge,
    /// Just mark the card done.
    Done,
}

/// Action to run when the pipeline fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailAction {
    /// Card → failed.
    Fail,
    /// Card back to todo.
    Reject,
}

/// Stored in the run row; consulted once the run reaches a terminal state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_id: Option<ResourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<ResourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_pass: Option<PassAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<FailAction>,
}

/// A pipeline's declared trigger, matched against incoming events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    Manual,
    CardComplete {
        /// Card status that fires this trigger, `in_review` by default.
        #[serde(default = "TriggerSpec::default_card_status")]
        status: CardStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        on_pass: Option<PassAction>,
        #[serde(skip_serializing_if = "Option::is_none")]
        on_fail: Option<FailAction>,
    },
    Push {
        /// Branch patterns with glob semantics, all branches by default.
        #[serde(default = "TriggerSpec::default_branches")]
        branches: Vec<String>,
    },
}

impl TriggerSpec {
    fn default_card_status() -> CardStatus {
        CardStatus::InReview
    }

    fn default_branches() -> Vec<String> {
        vec!["*".to_string()]
    }
}

/// Glob match of a branch name against the declared patterns.
pub fn branch_matches(patterns: &[String], branch: &str) -> bool {
    patterns
        .iter()
        .any(|p| Pattern::new(p).map(|p| p.matches(branch)).unwrap_or(false))
}

/// Strip `refs/heads/` from a full ref; tags and other refs yield `None`.
pub fn branch_of_ref(git_ref: &str) -> Option<&str> {
    git_ref.strip_prefix("refs/heads/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_keys_follow_the_scheme() {
        let card = ResourceId::new();
        let event = TriggerEvent::CardComplete {
            card_id: card,
            status: CardStatus::InReview,
        };
        assert_eq!(event.trigger_key(), format!("card:{card}:in_review"));

        let repo = ResourceId::new();
        let event = TriggerEvent::Push {
            repo_id: repo,
            git_ref: "refs/heads/main".into(),
            old_sha: "0".repeat(40),
            new_sha: "a".repeat(40),
        };
        assert_eq!(
            event.trigger_key(),
            format!("push:{repo}:refs/heads/main:{}", "a".repeat(40))
        );
    }

    #[test]
    fn identical_pushes_share_a_key() {
        let repo = ResourceId::new();
        let make = || TriggerEvent::Push {
            repo_id: repo,
            git_ref: "refs/heads/main".into(),
            old_sha: "b".repeat(40),
            new_sha: "c".repeat(40),
        };
        assert_eq!(make().trigger_key(), make().trigger_key());
    }

    #[test]
    fn branch_glob_semantics() {
        let patterns = vec!["main".to_string(), "release/*".to_string()];
        assert!(branch_matches(&patterns, "main"));
        assert!(branch_matches(&patterns, "release/1.2"));
        assert!(!branch_matches(&patterns, "feature/x"));
        assert!(branch_matches(&["*".to_string()], "anything"));
    }

    #[test]
    fn only_heads_are_branches() {
        assert_eq!(branch_of_ref("refs/heads/main"), Some("main"));
        assert_eq!(branch_of_ref("refs/tags/v1"), None);
    }
}
