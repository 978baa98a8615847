//! Scheduler (component G): the outer periodic driver. Owns initial-sync
//! gating, failure accounting, and the one-shot / commit-pinned termination
//! policies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthMethod};
use crate::git::CommitHash;
use crate::hook::HookRunner;
use crate::process::CommandRunner;
use crate::status::{Outcome, Status};
use crate::sync::SyncEngine;
use crate::util::ResultExt;

pub struct SchedulerConfig {
    pub wait: Duration,
    pub sync_timeout: Duration,
    pub one_shot: bool,
    /// `< 0` means "never give up once a sync has succeeded", but per
    /// spec.md §4.G it still "enforces failure on the very first sync" -
    /// there is no known-good worktree yet to fall back on, so a negative
    /// budget only buys infinite retries *after* the initial publish.
    pub max_sync_failures: i64,
}

/// A named hook the scheduler notifies on every published hash.
pub struct NamedHookRunner {
    pub name: String,
    pub runner: HookRunner,
}

/// Tracks a short-lived credential (currently only the GitHub-App
/// installation token) that needs re-minting before it expires, per
/// spec.md §4.D. `None` when the configured auth method never expires.
pub struct AuthRefresh {
    pub method: AuthMethod,
    pub runner: CommandRunner,
    pub remote_template: String,
    pub next_refresh: SystemTime,
}

/// Runs the sync loop until cancelled, a one-shot cycle completes, or
/// `max_sync_failures` is exceeded. Returns the process exit code the
/// caller should use (relevant for one-shot / failure-exhaustion exits).
pub async fn run(
    ct: CancellationToken,
    config: SchedulerConfig,
    mut engine: SyncEngine,
    status: Arc<Status>,
    hooks: Vec<NamedHookRunner>,
    mut auth_refresh: Option<AuthRefresh>,
) -> Result<i32> {
    let mut initial = true;
    let mut fails: i64 = 0;

    loop {
        if ct.is_cancelled() {
            return Ok(0);
        }

        refresh_auth_if_due(&ct, &mut engine, &mut auth_refresh).await;

        let start = Instant::now();
        let cycle = tokio::select! {
            result = tokio::time::timeout(config.sync_timeout, engine.one_cycle(&ct)) => result,
            () = ct.cancelled() => return Ok(0),
        };

        let elapsed = start.elapsed();

        let outcome_result = match cycle {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow::anyhow!("sync cycle exceeded timeout of {:?}", config.sync_timeout)),
        };

        match outcome_result {
            Err(e) => {
                error!("sync cycle failed: {e:#}");
                status.record_sync(Outcome::Error, elapsed);
                let mut args = HashMap::new();
                args.insert("repo".to_owned(), engine.spec().remote.clone());
                status.write_error_file("sync cycle failed", &e, args);

                if should_give_up(initial, config.max_sync_failures, fails) {
                    return Ok(1);
                }
                fails += 1;
                sleep_or_cancelled(&ct, config.wait).await;
                continue;
            }
            Ok(cycle_result) => {
                fails = 0;
                let synchronous = initial && config.one_shot;
                let mut hooks_ok = true;

                if cycle_result.changed {
                    status.record_sync(Outcome::Success, elapsed);
                    if let Some(hash) = &cycle_result.hash {
                        hooks_ok = notify_hooks(&hooks, hash, synchronous).await;
                    }
                } else {
                    status.record_sync(Outcome::Noop, elapsed);
                }

                if initial {
                    if config.one_shot {
                        return Ok(if hooks_ok { 0 } else { 1 });
                    }
                    if engine.spec().rev != crate::sync::HEAD_REVISION
                        && looks_like_commit_hash(&engine.spec().rev)
                    {
                        info!("revision is a pinned commit; parking until termination signal");
                        ct.cancelled().await;
                        return Ok(0);
                    }
                    initial = false;
                }

                status.clear_error_file();
                sleep_or_cancelled(&ct, config.wait).await;
            }
        }
    }
}

/// Decide whether a sync failure should end the process. `max_sync_failures
/// < 0` means "retry forever", except on the very first sync: spec.md §4.G
/// is explicit that `-1` "still enforces failure on the very first sync",
/// since there's no previously-published worktree to keep serving while we
/// keep trying.
fn should_give_up(initial: bool, max_sync_failures: i64, fails: i64) -> bool {
    if max_sync_failures < 0 {
        initial
    } else {
        fails >= max_sync_failures
    }
}

/// Re-mints the GitHub-App installation token once it's within its expiry
/// window, updating the engine's remote in place so the next cycle picks up
/// the fresh credential. A refresh failure is logged and retried next cycle
/// rather than torn down as a sync failure - the existing token may still be
/// valid for a while yet.
async fn refresh_auth_if_due(ct: &CancellationToken, engine: &mut SyncEngine, auth_refresh: &mut Option<AuthRefresh>) {
    let Some(refresh) = auth_refresh else {
        return;
    };
    if SystemTime::now() < refresh.next_refresh {
        return;
    }

    let result = auth::bootstrap(ct, &refresh.runner, &refresh.method, &refresh.remote_template).await;
    result.or_log_error("github app token refresh failed");
    if let Ok(Some(token)) = result {
        info!("refreshed github app installation token, next refresh due at {:?}", token.expires_at);
        engine.set_remote(token.remote_url);
        refresh.next_refresh = token.expires_at;
    }
}

/// Best-effort heuristic matching spec.md §4.G's "rev is a commit hash (not
/// a branch/tag)": a 40-char (or any abbreviated) hex string.
fn looks_like_commit_hash(rev: &str) -> bool {
    !rev.is_empty() && rev.len() <= 40 && rev.chars().all(|c| c.is_ascii_hexdigit())
}

async fn sleep_or_cancelled(ct: &CancellationToken, wait: Duration) {
    tokio::select! {
        () = tokio::time::sleep(wait) => {}
        () = ct.cancelled() => {}
    }
}

/// Notifies every configured hook of the new hash. In steady state this is
/// fire-and-forget (coalescing is the hook runner's job); in one-shot mode
/// the scheduler instead waits for each hook to reach a terminal outcome
/// before the process is allowed to exit, returning whether all succeeded.
async fn notify_hooks(hooks: &[NamedHookRunner], hash: &CommitHash, synchronous: bool) -> bool {
    if !synchronous {
        for hook in hooks {
            hook.runner.send(hash.clone());
        }
        return true;
    }
    let mut all_ok = true;
    for hook in hooks {
        if !hook.runner.send_and_wait(hash.clone()).await {
            all_ok = false;
        }
    }
    all_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_hash_heuristic_rejects_branch_names() {
        assert!(!looks_like_commit_hash("master"));
        assert!(!looks_like_commit_hash("HEAD"));
        assert!(looks_like_commit_hash(&"a".repeat(40)));
        assert!(looks_like_commit_hash("deadbeef"));
    }

    #[test]
    fn should_give_up_matches_spec_g() {
        // -1 still fails the very first sync, per spec.md §4.G.
        assert!(should_give_up(true, -1, 0));
        // but retries forever once a sync has succeeded at least once.
        assert!(!should_give_up(false, -1, 0));
        assert!(!should_give_up(false, -1, 1_000));

        // a non-negative budget applies regardless of initial.
        assert!(!should_give_up(true, 2, 1));
        assert!(should_give_up(true, 2, 2));
        assert!(!should_give_up(false, 2, 1));
        assert!(should_give_up(false, 2, 2));

        // 0 means zero tolerance, initial or not.
        assert!(should_give_up(true, 0, 0));
        assert!(should_give_up(false, 0, 0));
    }
}
