//! Hook subsystem (component F): a coalescing data slot plus a runner that
//! invokes a hook at most once per published hash, with fixed backoff and
//! optional synchronous completion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_condvar_fair::Condvar;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::git::CommitHash;
use crate::process::CommandRunner;
use crate::status::{Outcome, Status};

/// A user-supplied action invoked at-most-once per published hash.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ct: &CancellationToken, hash: &CommitHash) -> Result<()>;
}

/// Runs an operator-supplied executable with cwd = `<root>/<hash>` and
/// `GITSYNC_HASH` set in the environment.
pub struct CommandHook {
    name: String,
    command: PathBuf,
    root: PathBuf,
    timeout: Duration,
    runner: CommandRunner,
}

impl CommandHook {
    pub fn new(name: impl Into<String>, command: PathBuf, root: PathBuf, timeout: Duration, runner: CommandRunner) -> Self {
        Self {
            name: name.into(),
            command,
            root,
            timeout,
            runner,
        }
    }
}

#[async_trait]
impl Hook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ct: &CancellationToken, hash: &CommitHash) -> Result<()> {
        let cwd = self.root.join(hash.as_str());
        let mut env = HashMap::new();
        for (k, v) in std::env::vars() {
            env.insert(k, v);
        }
        env.insert("GITSYNC_HASH".to_owned(), hash.to_string());
        self.runner
            .run(ct, Some(&cwd), Some(&env), self.timeout, &self.command, Vec::<&str>::new())
            .await
            .with_context(|| format!("hook command {:?} failed for {hash}", self.command))?;
        Ok(())
    }
}

/// Issues a single HTTP request. Success is "any response" when
/// `success_status` is unset, else "status exactly equals it".
pub struct Webhook {
    name: String,
    url: String,
    method: reqwest::Method,
    success_status: Option<u16>,
    timeout: Duration,
    client: reqwest::Client,
}

impl Webhook {
    pub fn new(name: impl Into<String>, url: String, method: reqwest::Method, success_status: Option<u16>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            url,
            method,
            success_status,
            timeout,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Hook for Webhook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ct: &CancellationToken, hash: &CommitHash) -> Result<()> {
        // Build the request fully - method, URL, timeout, then the header -
        // before any dispatch, so a construction failure returns before the
        // Gitsync-Hash header is ever touched (spec.md §9, open question).
        let request = self
            .client
            .request(self.method.clone(), &self.url)
            .timeout(self.timeout)
            .header("Gitsync-Hash", hash.to_string());

        let response = request.send().await.with_context(|| format!("webhook {} request failed", self.url))?;

        match self.success_status {
            None => Ok(()),
            Some(expected) => {
                if response.status().as_u16() == expected {
                    Ok(())
                } else {
                    bail!("webhook {} returned {}, expected {expected}", self.url, response.status())
                }
            }
        }
    }
}

/// Mutex-protected latest hash plus a condvar used purely as a non-blocking
/// signal - the data and the "something changed" notification are separate,
/// per the coalescing channel contract of spec.md §3/§9.
struct Slot {
    mutex: Mutex<Option<CommitHash>>,
    condvar: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    fn send(&self, hash: CommitHash) {
        *self.mutex.lock() = Some(hash);
        self.condvar.notify_one();
    }
}

pub struct HookRunner {
    slot: Arc<Slot>,
    completions: watch::Sender<Option<(CommitHash, bool)>>,
    backoff: Duration,
}

impl HookRunner {
    /// Spawns the consumer loop as a task and returns a handle plus the
    /// future driving it, so callers compose it into an `ErrGroup`.
    pub fn spawn(
        hook: Arc<dyn Hook>,
        ct: CancellationToken,
        status: Arc<Status>,
        backoff: Duration,
    ) -> (Self, impl std::future::Future<Output = Result<()>>) {
        let slot = Arc::new(Slot::new());
        let (tx, _rx) = watch::channel(None);
        let runner = Self {
            slot: slot.clone(),
            completions: tx.clone(),
            backoff,
        };
        let task = run_consumer_loop(hook, slot, ct, status, tx, backoff);
        (runner, task)
    }

    /// Write the slot and attempt a non-blocking enqueue of the signal.
    pub fn send(&self, hash: CommitHash) {
        self.slot.send(hash);
    }

    /// Like [`Self::send`], but blocks until the consumer reports a
    /// terminal outcome (success or failure) for this exact hash. Used by
    /// one-shot mode, which must not exit before hooks have settled.
    pub async fn send_and_wait(&self, hash: CommitHash) -> bool {
        let mut rx = self.completions.subscribe();
        self.slot.send(hash.clone());
        loop {
            if rx.changed().await.is_err() {
                return false;
            }
            if let Some((completed_hash, success)) = rx.borrow_and_update().clone() {
                if completed_hash == hash {
                    return success;
                }
            }
        }
    }
}

async fn run_consumer_loop(
    hook: Arc<dyn Hook>,
    slot: Arc<Slot>,
    ct: CancellationToken,
    status: Arc<Status>,
    completions: watch::Sender<Option<(CommitHash, bool)>>,
    backoff: Duration,
) -> Result<()> {
    let mut last: Option<CommitHash> = None;

    loop {
        // Wait for a signal: block until the slot holds something other
        // than what we've already processed.
        {
            let mut guard = slot.mutex.lock();
            loop {
                if guard.as_ref() != last.as_ref() {
                    break;
                }
                let wait = slot.condvar.wait(guard);
                tokio::select! {
                    g = wait => guard = g,
                    () = ct.cancelled() => return Ok(()),
                }
            }
        }

        // Inner retry loop: keep re-reading the slot so a new hash arriving
        // mid-retry abandons the old attempt, per spec.md §4.F.
        loop {
            let current = slot.mutex.lock().clone();
            if current.as_ref() == last.as_ref() {
                break;
            }
            let Some(hash) = current else { break };

            tokio::select! {
                result = hook.run(&ct, &hash) => {
                    match result {
                        Ok(()) => {
                            status.record_hook(hook.name(), Outcome::Success);
                            let _ = completions.send(Some((hash.clone(), true)));
                            last = Some(hash);
                            break;
                        }
                        Err(e) => {
                            log::warn!("hook {} failed for {hash}: {e:#}", hook.name());
                            status.record_hook(hook.name(), Outcome::Error);
                            let _ = completions.send(Some((hash, false)));
                            tokio::select! {
                                () = tokio::time::sleep(backoff) => {}
                                () = ct.cancelled() => return Ok(()),
                            }
                        }
                    }
                }
                () = ct.cancelled() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        calls: Arc<AtomicUsize>,
        fail_first: bool,
    }

    #[async_trait]
    impl Hook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, _ct: &CancellationToken, _hash: &CommitHash) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                bail!("forced failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_single_send() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook = Arc::new(CountingHook { calls: calls.clone(), fail_first: false });
        let ct = CancellationToken::new();
        let status = Arc::new(Status::new(None));
        let (runner, task) = HookRunner::spawn(hook, ct.clone(), status, Duration::from_millis(10));
        let handle = tokio::spawn(task);

        let ok = runner.send_and_wait(CommitHash::new("a".repeat(40))).await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        ct.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn retries_after_failure_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook = Arc::new(CountingHook { calls: calls.clone(), fail_first: true });
        let ct = CancellationToken::new();
        let status = Arc::new(Status::new(None));
        let (runner, task) = HookRunner::spawn(hook, ct.clone(), status, Duration::from_millis(10));
        let handle = tokio::spawn(task);

        let ok = runner.send_and_wait(CommitHash::new("b".repeat(40))).await;
        assert!(ok);
        assert!(calls.load(Ordering::SeqCst) >= 2);

        ct.cancel();
        let _ = handle.await;
    }
}
