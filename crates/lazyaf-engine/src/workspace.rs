//! Workspace service: lifecycle of the per-run working directory.
//!
//! Layout: `repo/` (git checkout), `home/` (persisted HOME), `.control/`
//! (step metadata), `.lazyaf-context/` (committed cross-step context).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use lazyaf_config::Settings;
use lazyaf_core::workspace::{
    CONTEXT_DIR, CONTROL_DIR, HOME_DIR, REPO_DIR, WorkspaceState, workspace_id_for_run,
};
use lazyaf_core::{Error, ResourceId, Result};
use lazyaf_db::{WorkspaceRecord, WorkspaceStore};

use crate::git::GitOps;

const CREATE_WAIT_INTERVAL: Duration = Duration::from_millis(500);
const CREATE_WAIT_DEADLINE: Duration = Duration::from_secs(300);

pub struct WorkspaceService {
    settings: Settings,
    store: WorkspaceStore,
    git: GitOps,
    /// Serializes creation attempts within this process; cross-process
    /// exclusion is the row insert.
    create_lock: Mutex<()>,
}

impl WorkspaceService {
    pub fn new(settings: Settings, store: WorkspaceStore, git: GitOps) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            git,
            create_lock: Mutex::new(()),
        })
    }

    /// Idempotent get-or-create. The caller that wins the row insert
    /// materializes the directory and clones the repo; everyone else waits
    /// for `ready`.
    pub async fn get_or_create(
        &self,
        pipeline_run_id: ResourceId,
        repo_id: ResourceId,
        branch: Option<&str>,
    ) -> Result<WorkspaceRecord> {
        let id = workspace_id_for_run(pipeline_run_id);
        let _guard = self.create_lock.lock().await;
        let (record, created) = self.store.get_or_insert(&id, pipeline_run_id).await?;

        if created {
            match self.materialize(&id, repo_id, branch).await {
                Ok(()) => {
                    self.store
                        .transition(&id, &[WorkspaceState::Creating], WorkspaceState::Ready)
                        .await?;
                    info!(workspace = %id, "workspace ready");
                    return self.store.get(&id).await.map_err(Into::into);
                }
                Err(e) => {
                    warn!(workspace = %id, error = %e, "workspace creation failed");
                    self.store
                        .transition(&id, &[WorkspaceState::Creating], WorkspaceState::Failed)
                        .await?;
                    return Err(Error::Resource(format!("workspace creation failed: {e}")));
                }
            }
        }

        match record.state()? {
            WorkspaceState::Ready | WorkspaceState::InUse => Ok(record),
            WorkspaceState::Creating => self.wait_ready(&id).await,
            state => Err(Error::Resource(format!("workspace {id} is {state}"))),
        }
    }

    async fn wait_ready(&self, id: &str) -> Result<WorkspaceRecord> {
        let started = tokio::time::Instant::now();
        loop {
            let record = self.store.get(id).await?;
            match record.state()? {
                WorkspaceState::Ready | WorkspaceState::InUse => return Ok(record),
                WorkspaceState::Creating => {
                    if started.elapsed() > CREATE_WAIT_DEADLINE {
                        return Err(Error::Timeout(format!("workspace {id} stuck in creating")));
                    }
                    tokio::time::sleep(CREATE_WAIT_INTERVAL).await;
                }
                state => return Err(Error::Resource(format!("workspace {id} is {state}"))),
            }
        }
    }

    async fn materialize(&self, id: &str, repo_id: ResourceId, branch: Option<&str>) -> Result<()> {
        let root = self.settings.workspace_dir(id);
        for dir in [HOME_DIR, CONTROL_DIR, CONTEXT_DIR] {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .map_err(|e| Error::Infrastructure(e.to_string()))?;
        }
        self.git
            .clone_into(repo_id, branch, &root.join(REPO_DIR))
            .await?;
        Ok(())
    }

    pub async fn acquire_shared(&self, id: &str) -> Result<WorkspaceRecord> {
        self.store.acquire_shared(id).await.map_err(Into::into)
    }

    pub async fn release_shared(&self, id: &str) -> Result<WorkspaceRecord> {
        self.store.release_shared(id).await.map_err(Into::into)
    }

    /// Exclusive cleanup: refuses while in use, removes the directory,
    /// marks the row destroyed. Idempotent.
    pub async fn cleanup(&self, id: &str) -> Result<bool> {
        if !self.store.begin_cleanup(id).await? {
            return Ok(false);
        }
        let root = self.settings.workspace_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&root).await {
            if root.exists() {
                warn!(workspace = %id, error = %e, "workspace removal failed");
                return Err(Error::Infrastructure(e.to_string()));
            }
        }
        self.store.mark_destroyed(id).await?;
        info!(workspace = %id, "workspace destroyed");
        Ok(true)
    }

    /// One audit pass: clean quiescent workspaces of terminal runs past the
    /// grace window, and remove directories that have no row at all.
    pub async fn audit(&self) -> Result<()> {
        let grace = self.settings.workspace_grace.as_secs() as i64;
        for record in self.store.audit_candidates(grace).await? {
            if let Err(e) = self.cleanup(&record.id).await {
                warn!(workspace = %record.id, error = %e, "audit cleanup failed");
            }
        }

        // Orphan sweep: directories with no live row.
        let live: std::collections::HashSet<String> = self
            .store
            .all_live()
            .await?
            .into_iter()
            .map(|w| w.id)
            .collect();
        let dir = self.settings.workspaces_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if !live.contains(&name) {
                warn!(workspace = %name, "removing orphaned workspace directory");
                let _ = tokio::fs::remove_dir_all(entry.path()).await;
            }
        }
        Ok(())
    }

    /// Spawn the periodic auditor.
    pub fn spawn_auditor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.settings.workspace_grace;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.audit().await {
                    warn!(error = %e, "workspace audit failed");
                }
            }
        })
    }
}
