//! Execution router: local or remote, and to which runner.

use std::sync::Arc;

use lazyaf_config::Settings;
use lazyaf_core::ResourceId;
use lazyaf_core::pipeline::PipelineStep;
use lazyaf_core::runner::{LabelValue, Labels};

/// Where the step goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Local,
    Remote,
}

/// The router's verdict for one step.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub pinned_runner_id: Option<ResourceId>,
}

/// Where the previous step of an affinity chain ran.
#[derive(Debug, Clone, Copy)]
pub enum PreviousSite {
    Local,
    Remote(ResourceId),
}

pub struct ExecutionRouter {
    settings: Settings,
    local_labels: Labels,
}

impl ExecutionRouter {
    pub fn new(settings: Settings) -> Arc<Self> {
        let mut local_labels = Labels::new();
        local_labels.insert("arch", std::env::consts::ARCH);
        local_labels.insert("type", "docker");
        Arc::new(Self {
            settings,
            local_labels,
        })
    }

    #[cfg(test)]
    fn with_labels(settings: Settings, local_labels: Labels) -> Arc<Self> {
        Arc::new(Self {
            settings,
            local_labels,
        })
    }

    /// Decision rules, in order:
    /// 1. `requires.runner_id` pins an explicit runner.
    /// 2. A `continue_in_context` predecessor pins the previous site.
    /// 3. Labels the local host cannot satisfy force a remote runner.
    /// 4. Otherwise local, unless the local executor is disabled.
    pub fn route(&self, step: &PipelineStep, previous: Option<PreviousSite>) -> RoutingDecision {
        if let Some(requires) = &step.requires {
            if let Some(LabelValue::Str(runner_id)) = requires.get("runner_id") {
                if let Ok(id) = runner_id.parse() {
                    return RoutingDecision {
                        target: RouteTarget::Remote,
                        pinned_runner_id: Some(id),
                    };
                }
            }
        }

        if let Some(site) = previous {
            return match site {
                PreviousSite::Local => RoutingDecision {
                    target: RouteTarget::Local,
                    pinned_runner_id: None,
                },
                PreviousSite::Remote(runner_id) => RoutingDecision {
                    target: RouteTarget::Remote,
                    pinned_runner_id: Some(runner_id),
                },
            };
        }

        if let Some(requires) = &step.requires {
            if !requires.is_empty() && !self.local_labels.satisfies(requires) {
                return RoutingDecision {
                    target: RouteTarget::Remote,
                    pinned_runner_id: None,
                };
            }
        }

        if self.settings.use_local_executor {
            RoutingDecision {
                target: RouteTarget::Local,
                pinned_runner_id: None,
            }
        } else {
            RoutingDecision {
                target: RouteTarget::Remote,
                pinned_runner_id: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyaf_core::pipeline::{FailurePolicy, SuccessPolicy};
    use lazyaf_core::step::StepConfig;

    fn settings() -> Settings {
        Settings::from_env().unwrap()
    }

    fn step(requires: Option<Labels>) -> PipelineStep {
        PipelineStep {
            id: "s".into(),
            name: "s".into(),
            config: StepConfig::Script {
                command: "true".into(),
                working_dir: None,
            },
            timeout_seconds: 300,
            continue_in_context: false,
            on_success: SuccessPolicy::Next,
            on_failure: FailurePolicy::Stop,
            requires,
        }
    }

    fn local_labels() -> Labels {
        let mut l = Labels::new();
        l.insert("arch", "x86_64");
        l.insert("type", "docker");
        l
    }

    #[test]
    fn plain_steps_run_locally() {
        let router = ExecutionRouter::with_labels(settings(), local_labels());
        let decision = router.route(&step(None), None);
        assert_eq!(decision.target, RouteTarget::Local);
        assert!(decision.pinned_runner_id.is_none());
    }

    #[test]
    fn explicit_runner_id_pins_remote() {
        let runner = ResourceId::new();
        let mut requires = Labels::new();
        requires.insert("runner_id", runner.to_string().as_str());
        let router = ExecutionRouter::with_labels(settings(), local_labels());
        let decision = router.route(&step(Some(requires)), None);
        assert_eq!(decision.target, RouteTarget::Remote);
        assert_eq!(decision.pinned_runner_id, Some(runner));
    }

    #[test]
    fn affinity_overrides_labels() {
        let runner = ResourceId::new();
        let mut requires = Labels::new();
        requires.insert("gpio", true);
        let router = ExecutionRouter::with_labels(settings(), local_labels());
        let decision = router.route(&step(Some(requires)), Some(PreviousSite::Remote(runner)));
        assert_eq!(decision.target, RouteTarget::Remote);
        assert_eq!(decision.pinned_runner_id, Some(runner));
    }

    #[test]
    fn unsatisfied_labels_route_remote() {
        let mut requires = Labels::new();
        requires.insert("cuda", true);
        let router = ExecutionRouter::with_labels(settings(), local_labels());
        let decision = router.route(&step(Some(requires)), None);
        assert_eq!(decision.target, RouteTarget::Remote);
        assert!(decision.pinned_runner_id.is_none());
    }

    #[test]
    fn matching_arch_stays_local() {
        let mut requires = Labels::new();
        requires.insert("arch", "x86_64");
        let router = ExecutionRouter::with_labels(settings(), local_labels());
        let decision = router.route(&step(Some(requires)), None);
        assert_eq!(decision.target, RouteTarget::Local);
    }
}
