//! Git adapter (component C).
//!
//! A thin domain wrapper around [`crate::process::CommandRunner`]. Every
//! method here does exactly one git-shaped thing and returns either the
//! parsed textual result or an error that still carries the underlying
//! stdout/stderr (see [`crate::process::CommandError`]), so callers can
//! decide whether a given git failure is retriable.
//!
//! None of this module parses git's object model - it shells out to the
//! real binary for everything, same as the teacher's git adapter does.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::process::CommandRunner;

/// A git commit hash: 40 lowercase hex characters. Constructing one doesn't
/// guarantee the object actually exists in any particular repo - like any
/// mutable database, you still have to handle the "it's not there" case
/// wherever you look it up.
#[derive(Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct CommitHash(String);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        OsStr::new(&self.0)
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SubmoduleMode {
    Recursive,
    Shallow,
    #[default]
    Off,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GcPolicy {
    #[default]
    Auto,
    Always,
    Aggressive,
    Off,
}

/// Default per-command deadline used by the sync engine. Individual calls
/// may override it (e.g. `ls-remote` against a slow host).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
    git_binary: PathBuf,
    runner: CommandRunner,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>, git_binary: impl Into<PathBuf>, runner: CommandRunner) -> Self {
        Self {
            root: root.into(),
            git_binary: git_binary.into(),
            runner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worktree_path(&self, hash: &CommitHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    async fn git<I, S>(
        &self,
        ct: &CancellationToken,
        cwd: &Path,
        timeout: Duration,
        args: I,
    ) -> Result<String, crate::process::CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self
            .runner
            .run(ct, Some(cwd), None, timeout, &self.git_binary, args)
            .await?;
        Ok(out.stdout_string())
    }

    /// No-checkout clone into `root`. If `root` already exists and is
    /// non-empty, git will refuse; we empty its *contents* (never the
    /// directory itself, which may be a bind mount) and retry exactly once.
    pub async fn clone(
        &self,
        ct: &CancellationToken,
        remote: &str,
        branch: &str,
        depth: u32,
        sparse_checkout: Option<&Path>,
    ) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating root directory {:?}", self.root))?;

        let do_clone = || async {
            let mut args: Vec<String> = vec![
                "clone".into(),
                "--no-checkout".into(),
                "--branch".into(),
                branch.into(),
            ];
            if depth > 0 {
                args.push("--depth".into());
                args.push(depth.to_string());
            }
            args.push(remote.into());
            args.push(".".into());
            self.git(ct, &self.root, DEFAULT_TIMEOUT, &args).await
        };

        if let Err(e) = do_clone().await {
            debug!("initial clone into {:?} failed, clearing and retrying: {e}", self.root);
            empty_directory_contents(&self.root)
                .with_context(|| format!("clearing non-empty root {:?}", self.root))?;
            do_clone()
                .await
                .context("git clone failed after clearing root")?;
        }

        if let Some(spec_path) = sparse_checkout {
            self.install_sparse_checkout(ct, spec_path).await?;
        }

        Ok(())
    }

    async fn install_sparse_checkout(&self, ct: &CancellationToken, spec_path: &Path) -> Result<()> {
        let spec = fs::read_to_string(spec_path)
            .with_context(|| format!("reading sparse-checkout spec {spec_path:?}"))?;
        self.git(ct, &self.root, DEFAULT_TIMEOUT, ["sparse-checkout", "init", "--cone"])
            .await
            .context("git sparse-checkout init failed")?;
        self.runner
            .run_with_stdin(
                ct,
                Some(&self.root),
                None,
                DEFAULT_TIMEOUT,
                spec.as_bytes(),
                &self.git_binary,
                ["sparse-checkout", "set", "--stdin"],
            )
            .await
            .context("git sparse-checkout set --stdin failed")?;
        Ok(())
    }

    pub async fn fetch(
        &self,
        ct: &CancellationToken,
        remote: &str,
        branch: &str,
        depth: u32,
    ) -> Result<()> {
        let mut args: Vec<String> = vec!["fetch".into()];
        if depth > 0 {
            args.push("--depth".into());
            args.push(depth.to_string());
        }
        args.push(remote.into());
        args.push(branch.into());
        self.git(ct, &self.root, DEFAULT_TIMEOUT, &args)
            .await
            .context("git fetch failed")?;
        Ok(())
    }

    pub async fn local_hash(&self, ct: &CancellationToken, rev: &str) -> Result<CommitHash> {
        let out = self
            .git(ct, &self.root, DEFAULT_TIMEOUT, ["rev-parse", rev])
            .await
            .with_context(|| format!("git rev-parse {rev} failed"))?;
        Ok(CommitHash::new(out.trim().to_owned()))
    }

    /// `ls-remote -q remote ref`; returns the hash portion of the first
    /// matching line, or `None` if the ref doesn't exist upstream.
    pub async fn remote_hash(
        &self,
        ct: &CancellationToken,
        remote: &str,
        git_ref: &str,
    ) -> Result<Option<CommitHash>> {
        let out = self
            .git(ct, &self.root, DEFAULT_TIMEOUT, ["ls-remote", "-q", remote, git_ref])
            .await
            .with_context(|| format!("git ls-remote {remote} {git_ref} failed"))?;
        let Some(first_line) = out.lines().next() else {
            return Ok(None);
        };
        let hash = first_line
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("unparsable ls-remote output line {:?}", first_line))?;
        Ok(Some(CommitHash::new(hash.to_owned())))
    }

    /// True iff `rev` names a commit object (not e.g. an annotated tag
    /// object) *and* `rev-parse rev` starts with `rev` - this second check
    /// is what excludes tag names (whose rev-parse output is a different
    /// hash) while still allowing abbreviated hash prefixes through.
    pub async fn rev_is_commit(&self, ct: &CancellationToken, rev: &str) -> Result<bool> {
        let is_commit_obj = match self
            .git(ct, &self.root, DEFAULT_TIMEOUT, ["cat-file", "-t", rev])
            .await
        {
            Ok(out) => out.trim() == "commit",
            Err(_) => return Ok(false),
        };
        if !is_commit_obj {
            return Ok(false);
        }
        let resolved = self.local_hash(ct, rev).await?;
        Ok(resolved.as_str().starts_with(rev))
    }

    pub async fn add_worktree(&self, ct: &CancellationToken, hash: &CommitHash) -> Result<PathBuf> {
        let path = self.worktree_path(hash);
        self.git(
            ct,
            &self.root,
            DEFAULT_TIMEOUT,
            [
                OsStr::new("worktree"),
                OsStr::new("add"),
                OsStr::new("--detach"),
                OsStr::new("--no-checkout"),
                path.as_os_str(),
                hash.as_ref(),
            ],
        )
        .await
        .with_context(|| format!("git worktree add {hash} failed"))?;
        self.rewrite_worktree_gitdir_relative(&path)
            .context("rewriting worktree .git pointer as relative")?;
        Ok(path)
    }

    /// `git worktree add` leaves `<worktree>/.git` pointing at an absolute
    /// path under the main repo's `.git/worktrees/`. Rewrite it relative to
    /// the worktree directory so the whole root can be bind-mounted under a
    /// different absolute path downstream without breaking the pointer.
    fn rewrite_worktree_gitdir_relative(&self, worktree_path: &Path) -> Result<()> {
        let git_file = worktree_path.join(".git");
        let contents = fs::read_to_string(&git_file)
            .with_context(|| format!("reading {git_file:?}"))?;
        let abs_gitdir = contents
            .strip_prefix("gitdir:")
            .ok_or_else(|| anyhow!("unexpected format in {git_file:?}: {contents:?}"))?
            .trim();
        let abs_gitdir = PathBuf::from(abs_gitdir);
        let relative = pathdiff(&abs_gitdir, worktree_path)
            .ok_or_else(|| anyhow!("couldn't compute relative path to {abs_gitdir:?}"))?;
        fs::write(&git_file, format!("gitdir: {}\n", relative.display()))
            .with_context(|| format!("writing {git_file:?}"))?;
        Ok(())
    }

    pub async fn reset_hard(&self, ct: &CancellationToken, hash: &CommitHash) -> Result<()> {
        let path = self.worktree_path(hash);
        self.git(ct, &path, DEFAULT_TIMEOUT, ["reset", "--hard", hash.as_str()])
            .await
            .with_context(|| format!("git reset --hard {hash} failed"))?;
        Ok(())
    }

    pub async fn update_submodules(
        &self,
        ct: &CancellationToken,
        hash: &CommitHash,
        mode: SubmoduleMode,
        depth: u32,
    ) -> Result<()> {
        if mode == SubmoduleMode::Off {
            return Ok(());
        }
        let path = self.worktree_path(hash);
        let mut args: Vec<String> = vec!["submodule".into(), "update".into(), "--init".into()];
        if mode == SubmoduleMode::Recursive {
            args.push("--recursive".into());
        }
        if depth > 0 {
            args.push("--depth".into());
            args.push(depth.to_string());
        }
        self.git(ct, &path, DEFAULT_TIMEOUT, &args)
            .await
            .context("git submodule update failed")?;
        Ok(())
    }

    /// Recursive permission change. A no-op when `mode == 0`, per the data
    /// model's "requested file-permission bitmask (0 = leave alone)".
    pub fn chmod_r(&self, mode: u32, path: &Path) -> Result<()> {
        if mode == 0 {
            return Ok(());
        }
        chmod_recursive(path, mode)
    }

    pub async fn gc(&self, ct: &CancellationToken, policy: GcPolicy) -> Result<()> {
        let args: &[&str] = match policy {
            GcPolicy::Off => return Ok(()),
            GcPolicy::Auto => &["gc", "--auto"],
            GcPolicy::Always => &["gc"],
            GcPolicy::Aggressive => &["gc", "--aggressive"],
        };
        self.git(ct, &self.root, DEFAULT_TIMEOUT, args)
            .await
            .context("git gc failed")?;
        Ok(())
    }

    pub async fn worktree_prune(&self, ct: &CancellationToken) -> Result<()> {
        self.git(ct, &self.root, DEFAULT_TIMEOUT, ["worktree", "prune"])
            .await
            .context("git worktree prune failed")?;
        Ok(())
    }
}

fn chmod_recursive(path: &Path, mode: u32) -> Result<()> {
    let metadata = fs::symlink_metadata(path).with_context(|| format!("stat {path:?}"))?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {path:?}"))?;
    if metadata.is_dir() {
        for entry in fs::read_dir(path).with_context(|| format!("reading dir {path:?}"))? {
            let entry = entry?;
            chmod_recursive(&entry.path(), mode)?;
        }
    }
    Ok(())
}

/// Remove everything inside `dir`, but not `dir` itself - it may be a mount
/// point, so replacing it outright isn't an option.
fn empty_directory_contents(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Relative path from `base` to `target`, assuming both are absolute.
fn pathdiff(target: &Path, base: &Path) -> Option<PathBuf> {
    use std::path::Component;
    let target_components: Vec<_> = target.components().collect();
    let base_components: Vec<_> = base.components().collect();
    let common_len = target_components
        .iter()
        .zip(base_components.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut result = PathBuf::new();
    for _ in common_len..base_components.len() {
        result.push(Component::ParentDir);
    }
    for component in &target_components[common_len..] {
        result.push(component);
    }
    Some(result)
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use crate::process::CommandRunner;
    use tempfile::TempDir;

    /// An empty repository in a scratch directory, torn down on drop. Used
    /// as the "remote" in sync-engine tests, and sometimes as the local
    /// root directly.
    pub struct TempRepo {
        pub dir: TempDir,
        pub repo: GitRepo,
    }

    impl TempRepo {
        pub async fn init() -> Self {
            let dir = TempDir::with_prefix("gitsync-test-").expect("tempdir");
            let repo = GitRepo::new(dir.path(), "git", CommandRunner::default());
            let ct = CancellationToken::new();
            repo.git(&ct, dir.path(), DEFAULT_TIMEOUT, ["init", "--initial-branch=master"])
                .await
                .expect("git init");
            repo.git(&ct, dir.path(), DEFAULT_TIMEOUT, ["config", "user.email", "t@example.com"])
                .await
                .expect("git config email");
            repo.git(&ct, dir.path(), DEFAULT_TIMEOUT, ["config", "user.name", "test"])
                .await
                .expect("git config name");
            Self { dir, repo }
        }

        pub fn path(&self) -> &Path {
            self.dir.path()
        }

        pub async fn commit(&self, message: &str) -> CommitHash {
            let ct = CancellationToken::new();
            self.repo
                .git(&ct, self.path(), DEFAULT_TIMEOUT, ["commit", "--allow-empty", "-m", message])
                .await
                .expect("git commit");
            self.repo.local_hash(&ct, "HEAD").await.expect("rev-parse HEAD")
        }

        pub async fn tag(&self, name: &str, rev: &str) {
            let ct = CancellationToken::new();
            self.repo
                .git(&ct, self.path(), DEFAULT_TIMEOUT, ["tag", name, rev])
                .await
                .expect("git tag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::TempRepo;
    use super::*;

    #[tokio::test]
    async fn local_hash_resolves_head() {
        let remote = TempRepo::init().await;
        let hash = remote.commit("first").await;
        let resolved = remote.repo.local_hash(&CancellationToken::new(), "HEAD").await.unwrap();
        assert_eq!(resolved, hash);
    }

    #[tokio::test]
    async fn remote_hash_reads_branch_tip() {
        let remote = TempRepo::init().await;
        let hash = remote.commit("first").await;
        let ct = CancellationToken::new();
        let got = remote
            .repo
            .remote_hash(&ct, remote.path().to_str().unwrap(), "refs/heads/master")
            .await
            .unwrap();
        assert_eq!(got, Some(hash));
    }

    #[tokio::test]
    async fn remote_hash_missing_ref_is_none() {
        let remote = TempRepo::init().await;
        remote.commit("first").await;
        let ct = CancellationToken::new();
        let got = remote
            .repo
            .remote_hash(&ct, remote.path().to_str().unwrap(), "refs/heads/nonexistent")
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn rev_is_commit_true_for_commit_false_for_tag_name() {
        let remote = TempRepo::init().await;
        let hash = remote.commit("first").await;
        remote.tag("v1", hash.as_str()).await;
        let ct = CancellationToken::new();
        assert!(remote.repo.rev_is_commit(&ct, hash.as_str()).await.unwrap());
        // Tag names must be excluded even though they resolve to a commit,
        // because rev-parse("v1") != "v1" as a string prefix.
        assert!(!remote.repo.rev_is_commit(&ct, "v1").await.unwrap());
    }

    #[tokio::test]
    async fn rev_is_commit_allows_abbreviated_hash() {
        let remote = TempRepo::init().await;
        let hash = remote.commit("first").await;
        let ct = CancellationToken::new();
        let abbrev = &hash.as_str()[..10];
        assert!(remote.repo.rev_is_commit(&ct, abbrev).await.unwrap());
    }

    #[tokio::test]
    async fn clone_and_add_worktree_round_trip() {
        let remote = TempRepo::init().await;
        let hash = remote.commit("first").await;

        let local_dir = tempfile::TempDir::with_prefix("gitsync-local-").unwrap();
        let local = GitRepo::new(local_dir.path(), "git", CommandRunner::default());
        let ct = CancellationToken::new();
        local
            .clone(&ct, remote.path().to_str().unwrap(), "master", 0, None)
            .await
            .unwrap();

        let worktree_path = local.add_worktree(&ct, &hash).await.unwrap();
        assert!(worktree_path.exists());
        local.reset_hard(&ct, &hash).await.unwrap();

        let git_file = worktree_path.join(".git");
        let contents = std::fs::read_to_string(&git_file).unwrap();
        assert!(
            !contents.trim_start_matches("gitdir:").trim().starts_with('/'),
            "expected relative gitdir pointer, got {contents:?}"
        );
    }

    #[tokio::test]
    async fn clone_into_nonempty_root_clears_and_retries() {
        let remote = TempRepo::init().await;
        remote.commit("first").await;

        let local_dir = tempfile::TempDir::with_prefix("gitsync-local-").unwrap();
        std::fs::write(local_dir.path().join("stale.txt"), b"leftover").unwrap();

        let local = GitRepo::new(local_dir.path(), "git", CommandRunner::default());
        let ct = CancellationToken::new();
        local
            .clone(&ct, remote.path().to_str().unwrap(), "master", 0, None)
            .await
            .unwrap();
        assert!(!local_dir.path().join("stale.txt").exists());
        assert!(local_dir.path().join(".git").exists());
    }
}
