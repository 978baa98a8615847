//! Bounded, deadline-aware subprocess execution (component B).
//!
//! Every external command gitsync runs - git itself, exec hooks, anything
//! else - goes through a [`CommandRunner`]. It caps the number of
//! concurrently live children (so a fast poll loop can't exhaust file
//! descriptors), enforces a deadline per call, and returns a structured
//! error that preserves the command's stdout/stderr instead of discarding
//! it the moment the exit code is non-zero.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, info};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Maximum number of subprocesses that may be alive at once. Chosen to match
/// the teacher's same constant for the same reason: avoid running into file
/// descriptor exhaustion without needing retry logic that could livelock.
const MAX_CONCURRENT_COMMANDS: usize = 64;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command {command:?} failed with exit code {status:?}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("command {command:?} was killed by signal {signal}")]
    Signaled { command: String, signal: i32 },
    #[error("command {command:?} did not complete within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
    #[error("command {command:?} cancelled")]
    Cancelled { command: String },
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error running {command:?}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs subprocesses with a deadline and a bound on concurrency.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    semaphore: Arc<Semaphore>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(MAX_CONCURRENT_COMMANDS)
    }
}

impl CommandRunner {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub async fn run<I, S>(
        &self,
        ct: &CancellationToken,
        cwd: Option<&Path>,
        env: Option<&HashMap<String, String>>,
        timeout: Duration,
        program: impl AsRef<OsStr>,
        args: I,
    ) -> Result<CommandOutput, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_with_stdin(ct, cwd, env, timeout, &[], program, args)
            .await
    }

    pub async fn run_with_stdin<I, S>(
        &self,
        ct: &CancellationToken,
        cwd: Option<&Path>,
        env: Option<&HashMap<String, String>>,
        timeout: Duration,
        stdin: &[u8],
        program: impl AsRef<OsStr>,
        args: I,
    ) -> Result<CommandOutput, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.as_ref().to_owned();
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let command_line = reconstruct_command_line(&program, &args);

        // Hold the permit for the lifetime of the child process, not just the
        // spawn call - we're trying to bound how many children exist at once,
        // not how many Command::spawn calls are in flight.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("command semaphore never closed");

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = env {
            cmd.env_clear();
            cmd.envs(env);
        }
        cmd.stdin(if stdin.is_empty() {
            Stdio::null()
        } else {
            Stdio::piped()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Separate process group so Ctrl-C on our terminal doesn't also land
        // on the child; we manage its lifetime explicitly via the deadline
        // and cancellation token instead.
        cmd.process_group(0);

        debug!("+ {command_line}");
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        if !stdin.is_empty() {
            let mut child_stdin = child.stdin.take().expect("piped stdin");
            let stdin = stdin.to_owned();
            // Write on a separate task so a child that doesn't read stdin
            // promptly can't deadlock us against its stdout/stderr pipes
            // filling up.
            tokio::spawn(async move {
                let _ = child_stdin.write_all(&stdin).await;
                drop(child_stdin);
            });
        }

        let wait = child.wait_with_output();
        tokio::select! {
            result = wait => {
                let output = result.map_err(|source| CommandError::Io {
                    command: command_line.clone(),
                    source,
                })?;
                let elapsed = start.elapsed();
                let stdout = trim_trailing_whitespace(output.stdout);
                let stderr = trim_trailing_whitespace(output.stderr);
                match output.status.code() {
                    Some(0) => {
                        info!("completed '{command_line}' in {elapsed:?}");
                        Ok(CommandOutput { stdout, stderr })
                    }
                    Some(code) => Err(CommandError::Failed {
                        command: command_line,
                        status: Some(code),
                        stdout: String::from_utf8_lossy(&stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    }),
                    None => {
                        #[cfg(unix)]
                        {
                            use std::os::unix::process::ExitStatusExt;
                            if let Some(signal) = output.status.signal() {
                                return Err(CommandError::Signaled { command: command_line, signal });
                            }
                        }
                        Err(CommandError::Failed {
                            command: command_line,
                            status: None,
                            stdout: String::from_utf8_lossy(&stdout).into_owned(),
                            stderr: String::from_utf8_lossy(&stderr).into_owned(),
                        })
                    }
                }
            }
            () = tokio::time::sleep(timeout) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(CommandError::TimedOut { command: command_line, timeout })
            }
            () = ct.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(CommandError::Cancelled { command: command_line })
            }
        }
    }
}

fn trim_trailing_whitespace(mut buf: Vec<u8>) -> Vec<u8> {
    while matches!(buf.last(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
        buf.pop();
    }
    buf
}

fn reconstruct_command_line(program: &OsStr, args: &[std::ffi::OsString]) -> String {
    let mut parts = vec![program.to_string_lossy().into_owned()];
    parts.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout_and_trims_trailing_newline() {
        let runner = CommandRunner::default();
        let ct = CancellationToken::new();
        let out = runner
            .run(&ct, None, None, Duration::from_secs(5), "echo", ["hello"])
            .await
            .unwrap();
        assert_eq!(out.stdout_string(), "hello");
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit_with_output() {
        let runner = CommandRunner::default();
        let ct = CancellationToken::new();
        let err = runner
            .run(
                &ct,
                None,
                None,
                Duration::from_secs(5),
                "sh",
                ["-c", "echo oops >&2; exit 3"],
            )
            .await
            .unwrap_err();
        match err {
            CommandError::Failed {
                status, stderr, ..
            } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_times_out() {
        let runner = CommandRunner::default();
        let ct = CancellationToken::new();
        let err = runner
            .run(
                &ct,
                None,
                None,
                Duration::from_millis(50),
                "sleep",
                ["5"],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn run_respects_cancellation() {
        let runner = CommandRunner::default();
        let ct = CancellationToken::new();
        let ct2 = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ct2.cancel();
        });
        let err = runner
            .run(&ct, None, None, Duration::from_secs(5), "sleep", ["5"])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn run_with_stdin_feeds_child() {
        let runner = CommandRunner::default();
        let ct = CancellationToken::new();
        let out = runner
            .run_with_stdin(
                &ct,
                None,
                None,
                Duration::from_secs(5),
                b"hello from stdin",
                "cat",
                Vec::<&str>::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout_string(), "hello from stdin");
    }

    #[tokio::test]
    async fn env_replaces_rather_than_augments() {
        let runner = CommandRunner::default();
        let ct = CancellationToken::new();
        let mut env = HashMap::new();
        env.insert("ONLY_VAR".to_string(), "set".to_string());
        let out = runner
            .run(
                &ct,
                None,
                Some(&env),
                Duration::from_secs(5),
                "sh",
                ["-c", "echo ${PATH:-unset}/${ONLY_VAR:-unset}"],
            )
            .await
            .unwrap();
        assert_eq!(out.stdout_string(), "unset/set");
    }
}
