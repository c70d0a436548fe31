//! Runner state machine and label matching.

use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// A label value. Runners advertise strings (`arch=arm64`) and booleans
/// (`has=gpio` registers as `gpio: true`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    Bool(bool),
    Str(String),
}

impl From<&str> for LabelValue {
    fn from(s: &str) -> Self {
        LabelValue::Str(s.to_string())
    }
}

impl From<bool> for LabelValue {
    fn from(b: bool) -> Self {
        LabelValue::Bool(b)
    }
}

/// A set of labels. BTreeMap for stable serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(pub BTreeMap<String, LabelValue>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<LabelValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&LabelValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this label set (a runner's advertisement) satisfies every
    /// requirement. A boolean requirement is satisfied by `true`; a string
    /// requirement must match exactly.
    pub fn satisfies(&self, requirements: &Labels) -> bool {
        requirements.0.iter().all(|(key, required)| {
            match (self.0.get(key), required) {
                (Some(LabelValue::Bool(have)), LabelValue::Bool(want)) => have == want,
                (Some(LabelValue::Str(have)), LabelValue::Str(want)) => have == want,
                // "has=gpio" style requirements accept a string value too.
                (Some(LabelValue::Str(_)), LabelValue::Bool(true)) => true,
                _ => false,
            }
        })
    }
}

/// States of a runner connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    #[display("idle")]
    Idle,
    /// A step was pushed; awaiting the ACK.
    #[display("assigned")]
    Assigned,
    #[display("busy")]
    Busy,
    #[display("disconnected")]
    Disconnected,
    /// Heartbeat expired while assigned or busy.
    #[display("dead")]
    Dead,
}

impl RunnerState {
    /// Whether the heartbeat watchdog applies.
    pub fn is_working(&self) -> bool {
        matches!(self, RunnerState::Assigned | RunnerState::Busy)
    }

    pub fn can_transition_to(&self, next: RunnerState) -> bool {
        use RunnerState::*;
        match self {
            Idle => matches!(next, Assigned | Disconnected | Dead),
            Assigned => matches!(next, Busy | Idle | Disconnected | Dead),
            Busy => matches!(next, Idle | Disconnected | Dead),
            // Rows survive disconnection so recovery can find them.
            Disconnected => matches!(next, Idle | Dead),
            Dead => matches!(next, Idle),
        }
    }

    pub fn parse(s: &str) -> Option<RunnerState> {
        use RunnerState::*;
        Some(match s {
            "idle" => Idle,
            "assigned" => Assigned,
            "busy" => Busy,
            "disconnected" => Disconnected,
            "dead" => Dead,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, LabelValue)]) -> Labels {
        let mut l = Labels::new();
        for (k, v) in pairs {
            l.insert(*k, v.clone());
        }
        l
    }

    #[test]
    fn empty_requirements_always_satisfied() {
        let runner = labels(&[("arch", "arm64".into())]);
        assert!(runner.satisfies(&Labels::new()));
    }

    #[test]
    fn string_labels_match_exactly() {
        let runner = labels(&[("arch", "arm64".into())]);
        assert!(runner.satisfies(&labels(&[("arch", "arm64".into())])));
        assert!(!runner.satisfies(&labels(&[("arch", "x86_64".into())])));
    }

    #[test]
    fn boolean_capability_labels() {
        let runner = labels(&[("gpio", true.into()), ("arch", "arm64".into())]);
        assert!(runner.satisfies(&labels(&[("gpio", true.into())])));
        assert!(!runner.satisfies(&labels(&[("cuda", true.into())])));
    }

    #[test]
    fn dead_runner_revives_only_to_idle() {
        assert!(RunnerState::Dead.can_transition_to(RunnerState::Idle));
        assert!(!RunnerState::Dead.can_transition_to(RunnerState::Busy));
    }
}
