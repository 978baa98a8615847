//! Sync engine (component E): owns the root directory, decides whether a
//! new revision needs fetching, creates and atomically swaps worktrees, and
//! maintains readiness.

use std::fmt;
use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthMethod};
use crate::git::{CommitHash, GcPolicy, GitRepo, SubmoduleMode};
use crate::process::CommandRunner;
use crate::status::{Outcome, Status};
use crate::util::IoResultExt;

/// Sentinel revision meaning "tip of `branch`", per the glossary.
pub const HEAD_REVISION: &str = "HEAD";

/// Immutable repository request, built once from CLI/env and shared
/// read-only across tasks - spec.md §3 "Repository request".
#[derive(Clone, Debug)]
pub struct RepoSpec {
    pub remote: String,
    pub branch: String,
    pub rev: String,
    pub depth: u32,
    pub submodule_mode: SubmoduleMode,
    pub sparse_checkout_file: Option<PathBuf>,
    pub change_permissions: u32,
    pub gc_policy: GcPolicy,
    pub root: PathBuf,
    pub dest: PathBuf,
    pub askpass_url: Option<String>,
    pub auth: AuthMethod,
}

impl RepoSpec {
    /// Per spec.md §4.C "Ref resolution rule": `HEAD` resolves against the
    /// branch, anything else is looked up as a tag (tag beats branch name).
    fn remote_ref(&self) -> String {
        if self.rev == HEAD_REVISION {
            format!("refs/heads/{}", self.branch)
        } else {
            format!("refs/tags/{}", self.rev)
        }
    }

    /// Absolute path the public symlink should live at.
    fn dest_path(&self) -> PathBuf {
        if self.dest.is_absolute() {
            self.dest.clone()
        } else {
            self.root.join(&self.dest)
        }
    }
}

/// Multiple non-fatal errors gathered after a successful publish (spec.md
/// §4.E step 8, §7.6). Never prevents readiness or hook invocation.
#[derive(Debug, Default)]
pub struct CleanupError(pub Vec<anyhow::Error>);

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        write!(f, "{joined}")
    }
}

impl std::error::Error for CleanupError {}

/// Outcome of one sync cycle: did the published hash change, and what is it
/// now (if a worktree is published at all).
pub struct CycleResult {
    pub changed: bool,
    pub hash: Option<CommitHash>,
}

pub struct SyncEngine {
    spec: RepoSpec,
    repo: GitRepo,
    runner: CommandRunner,
    status: Arc<Status>,
}

impl SyncEngine {
    pub fn new(spec: RepoSpec, git_binary: PathBuf, runner: CommandRunner, status: Arc<Status>) -> Self {
        let repo = GitRepo::new(spec.root.clone(), git_binary, runner.clone());
        Self { spec, repo, runner, status }
    }

    pub fn spec(&self) -> &RepoSpec {
        &self.spec
    }

    /// Overwrites the remote URL used for clone/fetch/ls-remote, e.g. after a
    /// GitHub-App token refresh rewrites the embedded credential.
    pub fn set_remote(&mut self, remote: String) {
        self.spec.remote = remote;
    }

    /// Resolve the public symlink to the hash of the worktree it currently
    /// points at, if it resolves at all.
    fn published_hash(&self) -> Option<CommitHash> {
        let dest = self.spec.dest_path();
        let target = fs::read_link(&dest).ok()?;
        let name = target.file_name()?.to_str()?;
        Some(CommitHash::new(name.to_owned()))
    }

    /// One full cycle, per spec.md §4.E. Returns whether the published hash
    /// changed and what it is now; auth/fetch/worktree failures surface as
    /// `Err`, in which case the caller should treat the cycle as a failure,
    /// not a no-op.
    pub async fn one_cycle(&self, ct: &CancellationToken) -> Result<CycleResult> {
        // Step 1: re-run ASKPASS if configured.
        if let Some(url) = &self.spec.askpass_url {
            let result = auth::bootstrap(
                ct,
                &self.runner,
                &AuthMethod::Askpass { url: url.clone() },
                &self.spec.remote,
            )
            .await;
            match result {
                Ok(_) => self.status.record_askpass(Outcome::Success),
                Err(e) => {
                    self.status.record_askpass(Outcome::Error);
                    return Err(e.context("askpass bootstrap failed"));
                }
            }
        }

        let published = self.published_hash();

        // Step 2/3: decide whether there's anything to do.
        let hash = match &published {
            None => {
                // First sync: no link yet, so clone then take whatever rev
                // resolves to locally.
                self.repo
                    .clone(ct, &self.spec.remote, &self.spec.branch, self.spec.depth, self.spec.sparse_checkout_file.as_deref())
                    .await
                    .context("initial clone failed")?;
                self.repo.local_hash(ct, &self.spec.rev).await.context("resolving initial revision")?
            }
            Some(current) => {
                let local = self.repo.local_hash(ct, &self.spec.rev).await.context("resolving local revision")?;
                let remote = self
                    .repo
                    .remote_hash(ct, &self.spec.remote, &self.spec.remote_ref())
                    .await
                    .context("ls-remote failed")?
                    .unwrap_or_else(|| local.clone());
                if local == remote {
                    return Ok(CycleResult { changed: false, hash: Some(current.clone()) });
                }
                // Step 3 guard: the ls-remote race may have already been
                // resolved by a concurrent run; re-check against what's
                // actually published.
                if &remote == current {
                    return Ok(CycleResult { changed: false, hash: Some(current.clone()) });
                }
                remote
            }
        };

        // Step 4: fetch, then confirm the hash actually landed - a shallow
        // fetch can lose a race with the upstream.
        self.repo
            .fetch(ct, &self.spec.remote, &self.spec.branch, self.spec.depth)
            .await
            .context("fetch failed")?;
        if !self.repo.rev_is_commit(ct, hash.as_str()).await.context("rev-is-commit check failed")? {
            warn!("hash {hash} not present as a commit after fetch, treating as a shallow-fetch race; will retry next cycle");
            return Ok(CycleResult { changed: false, hash: published });
        }

        // Step 5: prepare the new worktree.
        let worktree_path = self.repo.worktree_path(&hash);
        if worktree_path.exists() {
            fs::remove_dir_all(&worktree_path)
                .with_context(|| format!("removing stale worktree directory {worktree_path:?}"))?;
            self.repo.worktree_prune(ct).await.context("worktree prune failed")?;
        }
        self.repo.add_worktree(ct, &hash).await.context("add_worktree failed")?;
        self.repo.reset_hard(ct, &hash).await.context("reset_hard failed")?;
        self.repo
            .update_submodules(ct, &hash, self.spec.submodule_mode, self.spec.depth)
            .await
            .context("update_submodules failed")?;
        self.repo
            .chmod_r(self.spec.change_permissions, &worktree_path)
            .context("chmod_r failed")?;

        // Step 6: atomically swap the public symlink.
        let old = self.swap_symlink(&hash).context("symlink swap failed")?;

        // Step 7: readiness.
        self.status.mark_ready();

        // Step 8: best-effort cleanup, never lets a failure here undo
        // readiness or suppress the hook notification.
        let mut errors = Vec::new();
        if let Some(old_hash) = old {
            let old_path = self.repo.worktree_path(&old_hash);
            if let Err(e) = fs::remove_dir_all(&old_path).ignore(std::io::ErrorKind::NotFound) {
                errors.push(anyhow::anyhow!("removing old worktree {old_path:?}: {e}"));
            }
            if let Err(e) = self.repo.worktree_prune(ct).await {
                errors.push(e.context("worktree prune after swap"));
            }
        }
        if let Err(e) = self.repo.gc(ct, self.spec.gc_policy).await {
            errors.push(e.context("gc"));
        }
        if !errors.is_empty() {
            warn!("cleanup errors after publishing {hash}: {}", CleanupError(errors));
        }

        Ok(CycleResult { changed: true, hash: Some(hash) })
    }

    /// Create `tmp-link -> <relative path to new worktree>` then rename it
    /// over the final dest name - rename is the atomic step. Returns the
    /// previously-linked hash, if any.
    fn swap_symlink(&self, hash: &CommitHash) -> Result<Option<CommitHash>> {
        let dest = self.spec.dest_path();
        let parent = dest.parent().ok_or_else(|| anyhow::anyhow!("dest {dest:?} has no parent"))?;
        fs::create_dir_all(parent).with_context(|| format!("creating dest parent {parent:?}"))?;

        let old = self.published_hash();

        let target = Path::new(hash.as_str());
        let tmp_link = parent.join("tmp-link");
        let _ = fs::remove_file(&tmp_link);
        unix_fs::symlink(target, &tmp_link).with_context(|| format!("creating symlink {tmp_link:?} -> {target:?}"))?;
        fs::rename(&tmp_link, &dest).with_context(|| format!("renaming {tmp_link:?} onto {dest:?}"))?;
        debug!("published {hash} at {dest:?}");

        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_utils::TempRepo;

    fn spec_for(remote: &str, root: &Path) -> RepoSpec {
        RepoSpec {
            remote: remote.to_owned(),
            branch: "master".to_owned(),
            rev: HEAD_REVISION.to_owned(),
            depth: 0,
            submodule_mode: SubmoduleMode::Off,
            sparse_checkout_file: None,
            change_permissions: 0,
            gc_policy: GcPolicy::Off,
            root: root.to_owned(),
            dest: PathBuf::from("current"),
            askpass_url: None,
            auth: AuthMethod::None,
        }
    }

    #[tokio::test]
    async fn first_sync_publishes_tip() {
        let remote = TempRepo::init().await;
        let hash = remote.commit("first").await;

        let local_dir = tempfile::TempDir::with_prefix("gitsync-sync-").unwrap();
        let status = Arc::new(Status::new(None));
        let engine = SyncEngine::new(
            spec_for(remote.path().to_str().unwrap(), local_dir.path()),
            PathBuf::from("git"),
            CommandRunner::default(),
            status.clone(),
        );

        let ct = CancellationToken::new();
        let result = engine.one_cycle(&ct).await.unwrap();
        assert!(result.changed);
        assert_eq!(result.hash, Some(hash.clone()));
        assert!(status.ready());

        let dest = local_dir.path().join("current");
        let target = fs::read_link(&dest).unwrap();
        assert_eq!(target, Path::new(hash.as_str()));
    }

    #[tokio::test]
    async fn second_cycle_with_no_upstream_change_is_noop() {
        let remote = TempRepo::init().await;
        remote.commit("first").await;

        let local_dir = tempfile::TempDir::with_prefix("gitsync-sync-").unwrap();
        let status = Arc::new(Status::new(None));
        let engine = SyncEngine::new(
            spec_for(remote.path().to_str().unwrap(), local_dir.path()),
            PathBuf::from("git"),
            CommandRunner::default(),
            status,
        );

        let ct = CancellationToken::new();
        engine.one_cycle(&ct).await.unwrap();
        let second = engine.one_cycle(&ct).await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn upstream_update_swaps_and_removes_old_worktree() {
        let remote = TempRepo::init().await;
        let first_hash = remote.commit("first").await;

        let local_dir = tempfile::TempDir::with_prefix("gitsync-sync-").unwrap();
        let status = Arc::new(Status::new(None));
        let engine = SyncEngine::new(
            spec_for(remote.path().to_str().unwrap(), local_dir.path()),
            PathBuf::from("git"),
            CommandRunner::default(),
            status,
        );

        let ct = CancellationToken::new();
        engine.one_cycle(&ct).await.unwrap();

        let second_hash = remote.commit("second").await;
        let result = engine.one_cycle(&ct).await.unwrap();
        assert!(result.changed);
        assert_eq!(result.hash, Some(second_hash));

        assert!(!local_dir.path().join(first_hash.as_str()).exists());
    }
}
