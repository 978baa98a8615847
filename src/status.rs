//! Status surface (component H): readiness flag, metrics counters/summaries,
//! and the structured error-file lifecycle.
//!
//! Nothing here touches the sync engine's decision-making - it's a pure
//! sink that the driver and hook workers report into, and that the HTTP
//! server reads back out of.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::util::IoResultExt;

/// Status values a sync cycle (or hook invocation) can end in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Error,
    Noop,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::Noop => "noop",
        }
    }
}

#[derive(Default)]
struct OutcomeCounters {
    success: AtomicU64,
    error: AtomicU64,
    noop: AtomicU64,
}

impl OutcomeCounters {
    fn incr(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Success => &self.success,
            Outcome::Error => &self.error,
            Outcome::Noop => &self.noop,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Success => self.success.load(Ordering::Relaxed),
            Outcome::Error => self.error.load(Ordering::Relaxed),
            Outcome::Noop => self.noop.load(Ordering::Relaxed),
        }
    }
}

/// A crude duration summary: count and total, partitioned by outcome.
/// Enough to compute an average, which is all `/metrics` exposes - a real
/// histogram is outside what this rewrite needs.
#[derive(Default)]
struct DurationSummary {
    count: AtomicU64,
    total_millis: AtomicU64,
}

impl DurationSummary {
    fn observe(&self, d: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_millis
            .fetch_add(d.as_millis() as u64, Ordering::Relaxed);
    }

    fn sum_seconds(&self) -> f64 {
        self.total_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Process-wide status: readiness, sync counters, per-hook counters, and the
/// error file lifecycle. Cheap to clone (wrap in `Arc`) since every field is
/// independently atomic or mutex-guarded.
pub struct Status {
    ready: AtomicBool,
    sync_counts: OutcomeCounters,
    sync_duration: [DurationSummary; 3],
    askpass_counts: OutcomeCounters,
    hook_counts: Mutex<HashMap<(String, &'static str), u64>>,
    error_file: Option<PathBuf>,
}

#[derive(Serialize)]
struct ErrorRecord<'a> {
    #[serde(rename = "Msg")]
    msg: &'a str,
    #[serde(rename = "Err")]
    err: &'a str,
    #[serde(rename = "Args")]
    args: HashMap<String, String>,
}

impl Status {
    pub fn new(error_file: Option<PathBuf>) -> Self {
        Self {
            ready: AtomicBool::new(false),
            sync_counts: OutcomeCounters::default(),
            sync_duration: Default::default(),
            askpass_counts: OutcomeCounters::default(),
            hook_counts: Mutex::new(HashMap::new()),
            error_file,
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Set once, on the first successful publication. Never cleared - see
    /// invariant 5 (readiness monotonicity).
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn record_sync(&self, outcome: Outcome, elapsed: Duration) {
        self.sync_counts.incr(outcome);
        self.sync_duration[outcome as usize].observe(elapsed);
    }

    pub fn record_askpass(&self, outcome: Outcome) {
        self.askpass_counts.incr(outcome);
    }

    pub fn record_hook(&self, name: &str, outcome: Outcome) {
        let mut counts = self.hook_counts.lock().expect("hook_counts poisoned");
        *counts
            .entry((name.to_owned(), outcome.label()))
            .or_insert(0) += 1;
    }

    /// Write the most recent failure as a JSON record (atomic write-then-
    /// rename, then chmod 0644). `args` carries the logger-style key/value
    /// context named in spec.md §4.H.
    pub fn write_error_file(&self, msg: &str, err: &anyhow::Error, args: HashMap<String, String>) {
        let Some(path) = &self.error_file else {
            return;
        };
        if let Err(e) = self.write_error_file_inner(path, msg, err, args) {
            log::error!("failed to write error file {path:?}: {e:#}");
        }
    }

    fn write_error_file_inner(
        &self,
        path: &Path,
        msg: &str,
        err: &anyhow::Error,
        args: HashMap<String, String>,
    ) -> Result<()> {
        let record = ErrorRecord {
            msg,
            err: &format!("{err:#}"),
            args,
        };
        let body = serde_json::to_vec_pretty(&record).context("serializing error record")?;
        let tmp_path = sibling_temp_path(path);
        fs::write(&tmp_path, &body).with_context(|| format!("writing {tmp_path:?}"))?;
        fs::rename(&tmp_path, path).with_context(|| format!("renaming onto {path:?}"))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .with_context(|| format!("chmod {path:?}"))?;
        Ok(())
    }

    /// Deleted on each successful cycle completion - the file's mere
    /// presence is the "last sync failed" signal, per spec.md §3.
    pub fn clear_error_file(&self) {
        let Some(path) = &self.error_file else {
            return;
        };
        if let Err(e) = fs::remove_file(path).ignore(std::io::ErrorKind::NotFound) {
            log::warn!("failed to remove error file {path:?}: {e}");
        }
    }

    /// Render counters/summaries as Prometheus text exposition for
    /// `/metrics`.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for outcome in [Outcome::Success, Outcome::Error, Outcome::Noop] {
            out.push_str(&format!(
                "git_sync_count_total{{status=\"{}\"}} {}\n",
                outcome.label(),
                self.sync_counts.get(outcome)
            ));
            out.push_str(&format!(
                "git_sync_askpass_calls{{status=\"{}\"}} {}\n",
                outcome.label(),
                self.askpass_counts.get(outcome)
            ));
            let summary = &self.sync_duration[outcome as usize];
            out.push_str(&format!(
                "git_sync_duration_seconds_sum{{status=\"{}\"}} {}\n",
                outcome.label(),
                summary.sum_seconds()
            ));
            out.push_str(&format!(
                "git_sync_duration_seconds_count{{status=\"{}\"}} {}\n",
                outcome.label(),
                summary.count()
            ));
        }
        let hook_counts = self.hook_counts.lock().expect("hook_counts poisoned");
        for ((name, status), count) in hook_counts.iter() {
            out.push_str(&format!(
                "git_sync_hook_run_count_total{{name=\"{name}\",status=\"{status}\"}} {count}\n"
            ));
        }
        out
    }
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| format!("{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| "error-file.tmp".to_owned());
    path.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_is_monotonic() {
        let status = Status::new(None);
        assert!(!status.ready());
        status.mark_ready();
        assert!(status.ready());
        status.mark_ready();
        assert!(status.ready());
    }

    #[test]
    fn error_file_written_then_cleared() {
        let dir = tempfile::TempDir::with_prefix("gitsync-status-").unwrap();
        let path = dir.path().join("error.json");
        let status = Status::new(Some(path.clone()));

        let err = anyhow::anyhow!("boom");
        let mut args = HashMap::new();
        args.insert("hash".to_string(), "deadbeef".to_string());
        status.write_error_file("sync failed", &err, args);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"Msg\""));
        assert!(contents.contains("boom"));
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);

        status.clear_error_file();
        assert!(!path.exists());
    }

    #[test]
    fn prometheus_output_includes_all_outcomes() {
        let status = Status::new(None);
        status.record_sync(Outcome::Success, Duration::from_millis(250));
        status.record_sync(Outcome::Noop, Duration::from_millis(10));
        status.record_hook("deploy", Outcome::Success);
        let text = status.render_prometheus();
        assert!(text.contains("git_sync_count_total{status=\"success\"} 1"));
        assert!(text.contains("git_sync_count_total{status=\"noop\"} 1"));
        assert!(text.contains("git_sync_hook_run_count_total{name=\"deploy\",status=\"success\"} 1"));
    }
}
