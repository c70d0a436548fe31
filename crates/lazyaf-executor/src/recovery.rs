//! Restart recovery for locally managed containers.
//!
//! On backend start, containers labeled as ours are matched against
//! execution rows in `preparing`/`running`: matched containers get a
//! re-attached waiter, unmatched ones are killed.

use std::collections::HashMap;

use bollard::Docker;
use bollard::container::{ListContainersOptions, RemoveContainerOptions, WaitContainerOptions};
use futures::StreamExt;
use tracing::{info, warn};

use lazyaf_core::step::StepState;
use lazyaf_core::{ResourceId, Result};
use lazyaf_db::StepStore;

use crate::local::{MANAGED_LABEL, STEP_LABEL};

/// Sweep managed containers and reconcile them with execution rows.
pub async fn recover_local_containers(docker: &Docker, steps: &StepStore) -> Result<()> {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![format!("{MANAGED_LABEL}=true")],
    );
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .map_err(|e| lazyaf_core::Error::Infrastructure(e.to_string()))?;

    let recoverable = steps.recoverable().await?;
    let live: HashMap<String, ResourceId> = recoverable
        .iter()
        .map(|r| (r.id.to_string(), ResourceId::from(r.id)))
        .collect();

    for container in containers {
        let Some(step_label) = container
            .labels
            .as_ref()
            .and_then(|labels| labels.get(STEP_LABEL))
            .cloned()
        else {
            continue;
        };
        let container_id = container.id.clone().unwrap_or_default();

        match live.get(&step_label) {
            Some(&step_execution_id) => {
                info!(step = %step_execution_id, container = %container_id, "re-attaching to recovered container");
                spawn_reattached_waiter(docker.clone(), steps.clone(), step_execution_id, container_id);
            }
            None => {
                // No live row behind it: a leftover from a finished or
                // vanished execution. Kill it.
                warn!(container = %container_id, step_label = %step_label, "removing unmatched managed container");
                let _ = docker
                    .remove_container(
                        &container_id,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
            }
        }
    }
    Ok(())
}

/// Wait out a recovered container and record its exit. The pipeline
/// executor's re-entry attaches to the same row and observes the result.
fn spawn_reattached_waiter(
    docker: Docker,
    steps: StepStore,
    step_execution_id: ResourceId,
    container_id: String,
) {
    tokio::spawn(async move {
        let mut wait = docker.wait_container(
            &container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let exit_code = match wait.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            _ => None,
        };
        let state = match exit_code {
            Some(0) => StepState::Completed,
            Some(_) => StepState::Failed,
            None => StepState::Failed,
        };
        let moved = steps
            .transition(
                step_execution_id,
                &[StepState::Preparing, StepState::Running],
                state,
                exit_code,
                (exit_code.is_none()).then_some("container wait failed after recovery"),
            )
            .await;
        match moved {
            Ok(true) => info!(step = %step_execution_id, ?exit_code, "recovered container finished"),
            Ok(false) => {}
            Err(e) => warn!(step = %step_execution_id, error = %e, "recovery transition failed"),
        }
        let _ = docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    });
}
