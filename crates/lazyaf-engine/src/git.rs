//! Git operations against the internally hosted bare repositories.
//!
//! Everything shells out to the `git` binary; merges happen in a throwaway
//! clone and are pushed back, so a conflict fails loudly with git's own
//! stderr and touches nothing.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use lazyaf_config::Settings;
use lazyaf_core::{Error, ResourceId, Result};

#[derive(Clone)]
pub struct GitOps {
    settings: Settings,
}

impl GitOps {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::Infrastructure(format!("git spawn failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExecutionFailed(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Create the bare repository for a repo id.
    pub async fn init_bare(&self, repo_id: ResourceId, default_branch: &str) -> Result<PathBuf> {
        let dir = self.settings.repo_git_dir(repo_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Infrastructure(e.to_string()))?;
        self.git(
            &[
                "init",
                "--bare",
                &format!("--initial-branch={default_branch}"),
                &dir.to_string_lossy(),
            ],
            None,
        )
        .await?;
        info!(repo = %repo_id, path = %dir.display(), "bare repository created");
        Ok(dir)
    }

    pub fn bare_dir(&self, repo_id: ResourceId) -> PathBuf {
        self.settings.repo_git_dir(repo_id)
    }

    pub async fn bare_exists(&self, repo_id: ResourceId) -> bool {
        tokio::fs::try_exists(self.settings.repo_git_dir(repo_id).join("HEAD"))
            .await
            .unwrap_or(false)
    }

    /// Clone the bare repo into `dest` and check out `branch`, creating it
    /// from the default branch when it does not exist yet.
    pub async fn clone_into(
        &self,
        repo_id: ResourceId,
        branch: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let bare = self.settings.repo_git_dir(repo_id);
        self.git(
            &[
                "clone",
                &bare.to_string_lossy(),
                &dest.to_string_lossy(),
            ],
            None,
        )
        .await?;
        if let Some(branch) = branch {
            // Try the existing branch first, then create it.
            let checkout = self.git(&["checkout", branch], Some(dest)).await;
            if checkout.is_err() {
                debug!(%branch, "branch missing, creating from HEAD");
                self.git(&["checkout", "-b", branch], Some(dest)).await?;
            }
        }
        Ok(())
    }

    /// Content of `path` at `git_ref` in the bare repo, or None when the
    /// file or ref does not exist.
    pub async fn read_file_at_ref(
        &self,
        repo_id: ResourceId,
        git_ref: &str,
        path: &str,
    ) -> Result<Option<String>> {
        let bare = self.settings.repo_git_dir(repo_id);
        match self
            .git(&["show", &format!("{git_ref}:{path}")], Some(&bare))
            .await
        {
            Ok(content) => Ok(Some(content)),
            Err(_) => Ok(None),
        }
    }

    /// List files under `dir` at `git_ref` in the bare repo.
    pub async fn list_dir_at_ref(
        &self,
        repo_id: ResourceId,
        git_ref: &str,
        dir: &str,
    ) -> Result<Vec<String>> {
        let bare = self.settings.repo_git_dir(repo_id);
        match self
            .git(
                &["ls-tree", "--name-only", git_ref, &format!("{dir}/")],
                Some(&bare),
            )
            .await
        {
            Ok(listing) => Ok(listing
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Merge `source` into `target` with `--no-ff` in a throwaway clone and
    /// push the result back. Conflicts fail loudly; nothing is resolved.
    pub async fn merge_branch(
        &self,
        repo_id: ResourceId,
        source: &str,
        target: &str,
    ) -> Result<()> {
        let bare = self.settings.repo_git_dir(repo_id);
        let scratch = std::env::temp_dir().join(format!("lazyaf-merge-{}", ResourceId::new()));

        let result = self
            .merge_in_scratch(&bare, &scratch, source, target)
            .await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if scratch.exists() {
                warn!(path = %scratch.display(), error = %e, "scratch cleanup failed");
            }
        }
        result
    }

    async fn merge_in_scratch(
        &self,
        bare: &Path,
        scratch: &Path,
        source: &str,
        target: &str,
    ) -> Result<()> {
        self.git(
            &["clone", &bare.to_string_lossy(), &scratch.to_string_lossy()],
            None,
        )
        .await?;
        self.git(&["checkout", target], Some(scratch)).await?;
        self.git(
            &[
                "-c",
                "user.email=lazyaf@localhost",
                "-c",
                "user.name=lazyaf",
                "merge",
                "--no-ff",
                &format!("origin/{source}"),
                "-m",
                &format!("Merge {source} into {target}"),
            ],
            Some(scratch),
        )
        .await?;
        self.git(&["push", "origin", target], Some(scratch)).await?;
        info!(%source, %target, "branch merged");
        Ok(())
    }

    /// Context-cleanup commit: copy the workspace-level `.lazyaf-context/`
    /// into the checkout, commit, and push. A clean tree is not an error.
    pub async fn commit_context(&self, workspace_root: &Path, branch: &str) -> Result<()> {
        let context_dir = workspace_root.join(lazyaf_core::workspace::CONTEXT_DIR);
        let repo_dir = workspace_root.join(lazyaf_core::workspace::REPO_DIR);
        if !context_dir.is_dir() || !repo_dir.is_dir() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&context_dir)
            .await
            .map_err(|e| Error::Infrastructure(e.to_string()))?;
        if entries
            .next_entry()
            .await
            .map_err(|e| Error::Infrastructure(e.to_string()))?
            .is_none()
        {
            return Ok(());
        }
        let output = Command::new("cp")
            .arg("-a")
            .arg(format!("{}/.", context_dir.to_string_lossy()))
            .arg(repo_dir.join(".lazyaf-context"))
            .output()
            .await
            .map_err(|e| Error::Infrastructure(e.to_string()))?;
        if !output.status.success() {
            return Err(Error::Infrastructure(format!(
                "context copy failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let repo_dir = repo_dir.as_path();
        self.git(&["add", ".lazyaf-context"], Some(repo_dir)).await?;
        let status = self
            .git(&["status", "--porcelain", ".lazyaf-context"], Some(repo_dir))
            .await?;
        if status.trim().is_empty() {
            return Ok(());
        }
        self.git(
            &[
                "-c",
                "user.email=lazyaf@localhost",
                "-c",
                "user.name=lazyaf",
                "commit",
                "-m",
                "Update cross-step context",
            ],
            Some(repo_dir),
        )
        .await?;
        self.git(&["push", "origin", branch], Some(repo_dir)).await?;
        Ok(())
    }

    /// Current HEAD branch of the bare repo.
    pub async fn head_branch(&self, repo_id: ResourceId) -> Result<String> {
        let bare = self.settings.repo_git_dir(repo_id);
        let head = self
            .git(&["symbolic-ref", "--short", "HEAD"], Some(&bare))
            .await?;
        Ok(head.trim().to_string())
    }
}

/// Integration tests that require the `git` binary.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn git_ops(data_dir: &Path) -> GitOps {
        let mut settings = Settings::from_env().unwrap();
        settings.data_dir = data_dir.to_path_buf();
        GitOps::new(settings)
    }

    async fn sh_git(args: &[&str], cwd: &Path) {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@localhost")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@localhost")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .expect("git spawn");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    async fn seed_commit(work: &Path, file: &str, content: &str, message: &str) {
        tokio::fs::write(work.join(file), content).await.unwrap();
        sh_git(&["add", "."], work).await;
        sh_git(&["commit", "-m", message], work).await;
    }

    #[tokio::test]
    #[ignore]
    async fn init_clone_and_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let git = git_ops(tmp.path());
        let repo_id = ResourceId::new();

        git.init_bare(repo_id, "main").await.unwrap();
        assert!(git.bare_exists(repo_id).await);

        let work = tmp.path().join("seed");
        git.clone_into(repo_id, Some("main"), &work).await.unwrap();
        seed_commit(&work, "hello.txt", "hi\n", "initial").await;
        sh_git(&["push", "origin", "main"], &work).await;

        let content = git
            .read_file_at_ref(repo_id, "main", "hello.txt")
            .await
            .unwrap();
        assert_eq!(content.as_deref(), Some("hi\n"));
        assert!(
            git.read_file_at_ref(repo_id, "main", "missing.txt")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(git.head_branch(repo_id).await.unwrap(), "main");
    }

    #[tokio::test]
    #[ignore]
    async fn clone_creates_missing_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let git = git_ops(tmp.path());
        let repo_id = ResourceId::new();
        git.init_bare(repo_id, "main").await.unwrap();

        let seed = tmp.path().join("seed");
        git.clone_into(repo_id, Some("main"), &seed).await.unwrap();
        seed_commit(&seed, "a.txt", "a\n", "initial").await;
        sh_git(&["push", "origin", "main"], &seed).await;

        // A card branch that does not exist yet forks from HEAD.
        let work = tmp.path().join("card");
        git.clone_into(repo_id, Some("lazyaf/card-1234"), &work)
            .await
            .unwrap();
        assert!(work.join("a.txt").exists());
    }

    #[tokio::test]
    #[ignore]
    async fn merge_lands_a_branch_and_conflicts_fail_loudly() {
        let tmp = tempfile::tempdir().unwrap();
        let git = git_ops(tmp.path());
        let repo_id = ResourceId::new();
        git.init_bare(repo_id, "main").await.unwrap();

        let seed = tmp.path().join("seed");
        git.clone_into(repo_id, Some("main"), &seed).await.unwrap();
        seed_commit(&seed, "x.txt", "base\n", "initial").await;
        sh_git(&["push", "origin", "main"], &seed).await;

        // Feature branch adds a file; the merge lands it on main.
        let feature = tmp.path().join("feature");
        git.clone_into(repo_id, Some("feature"), &feature)
            .await
            .unwrap();
        seed_commit(&feature, "y.txt", "feature\n", "add y").await;
        sh_git(&["push", "origin", "feature"], &feature).await;

        git.merge_branch(repo_id, "feature", "main").await.unwrap();
        assert!(
            git.read_file_at_ref(repo_id, "main", "y.txt")
                .await
                .unwrap()
                .is_some()
        );

        // Diverging edits to the same file conflict; nothing is resolved.
        let left = tmp.path().join("left");
        git.clone_into(repo_id, Some("left"), &left).await.unwrap();
        seed_commit(&left, "x.txt", "left\n", "left edit").await;
        sh_git(&["push", "origin", "left"], &left).await;

        let main_edit = tmp.path().join("main-edit");
        git.clone_into(repo_id, Some("main"), &main_edit)
            .await
            .unwrap();
        seed_commit(&main_edit, "x.txt", "mainline\n", "main edit").await;
        sh_git(&["push", "origin", "main"], &main_edit).await;

        let err = git.merge_branch(repo_id, "left", "main").await;
        assert!(err.is_err());
        // The failed merge must not have touched main.
        assert_eq!(
            git.read_file_at_ref(repo_id, "main", "x.txt")
                .await
                .unwrap()
                .as_deref(),
            Some("mainline\n")
        );
    }
}
