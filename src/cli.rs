//! CLI/env config (component I): the flag surface of spec.md §6, each with
//! an environment fallback, parsed once at startup into a validated
//! [`RepoSpec`] plus the pieces that aren't part of the repository request
//! (hook config, HTTP server config, scheduler config).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::auth::AuthMethod;
use crate::git::{GcPolicy, SubmoduleMode};
use crate::http::HttpConfig;
use crate::scheduler::SchedulerConfig;
use crate::sync::{RepoSpec, HEAD_REVISION};

#[derive(Parser, Debug)]
#[command(name = "gitsync", version, about = "Keeps a local tree synced to a git branch/tag/commit via an atomic symlink swap.")]
pub struct Cli {
    #[arg(long, env = "GITSYNC_REPO")]
    pub repo: String,

    #[arg(long, env = "GITSYNC_BRANCH", default_value = "master")]
    pub branch: String,

    #[arg(long, env = "GITSYNC_REV", default_value = HEAD_REVISION)]
    pub rev: String,

    #[arg(long, env = "GITSYNC_DEPTH", default_value_t = 0)]
    pub depth: u32,

    #[arg(long, env = "GITSYNC_SUBMODULES", default_value = "off")]
    pub submodules: SubmoduleModeArg,

    #[arg(long, env = "GITSYNC_ROOT")]
    pub root: PathBuf,

    #[arg(long, env = "GITSYNC_DEST")]
    pub dest: Option<PathBuf>,

    #[arg(long, env = "GITSYNC_ERROR_FILE")]
    pub error_file: Option<PathBuf>,

    #[arg(long, env = "GITSYNC_WAIT", default_value = "1m", value_parser = parse_duration)]
    pub wait: Duration,

    #[arg(long, env = "GITSYNC_TIMEOUT", default_value = "2m", value_parser = parse_duration)]
    pub timeout: Duration,

    #[arg(long, env = "GITSYNC_ONE_TIME")]
    pub one_time: bool,

    #[arg(long, env = "GITSYNC_MAX_SYNC_FAILURES", default_value_t = -1)]
    pub max_sync_failures: i64,

    /// Octal permission bits, e.g. `0755`. `0` (the default) leaves
    /// permissions untouched - see SPEC_FULL.md §9 for the Open Question
    /// this resolves.
    #[arg(long, env = "GITSYNC_CHANGE_PERMISSIONS", default_value = "0", value_parser = parse_octal_permissions)]
    pub change_permissions: u32,

    #[arg(long, env = "GITSYNC_EXECHOOK_COMMAND")]
    pub exechook_command: Option<PathBuf>,

    #[arg(long, env = "GITSYNC_EXECHOOK_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub exechook_timeout: Duration,

    #[arg(long, env = "GITSYNC_EXECHOOK_BACKOFF", default_value = "3s", value_parser = parse_duration)]
    pub exechook_backoff: Duration,

    #[arg(long, env = "GITSYNC_SPARSE_CHECKOUT_FILE")]
    pub sparse_checkout_file: Option<PathBuf>,

    #[arg(long, env = "GITSYNC_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    #[arg(long, env = "GITSYNC_WEBHOOK_METHOD", default_value = "POST")]
    pub webhook_method: String,

    #[arg(long, env = "GITSYNC_WEBHOOK_SUCCESS_STATUS")]
    pub webhook_success_status: Option<u16>,

    #[arg(long, env = "GITSYNC_WEBHOOK_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub webhook_timeout: Duration,

    #[arg(long, env = "GITSYNC_WEBHOOK_BACKOFF", default_value = "3s", value_parser = parse_duration)]
    pub webhook_backoff: Duration,

    #[arg(long, env = "GITSYNC_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "GITSYNC_PASSWORD")]
    pub password: Option<String>,

    #[arg(long, env = "GITSYNC_PASSWORD_FILE")]
    pub password_file: Option<PathBuf>,

    #[arg(long, env = "GITSYNC_SSH")]
    pub ssh: bool,

    #[arg(long, env = "GITSYNC_SSH_KEY_FILE")]
    pub ssh_key_file: Option<PathBuf>,

    #[arg(long, env = "GITSYNC_SSH_KNOWN_HOSTS", default_value_t = true, action = clap::ArgAction::Set)]
    pub ssh_known_hosts: bool,

    #[arg(long, env = "GITSYNC_SSH_KNOWN_HOSTS_FILE")]
    pub ssh_known_hosts_file: Option<PathBuf>,

    #[arg(long, env = "GITSYNC_COOKIE_FILE")]
    pub cookie_file: Option<PathBuf>,

    #[arg(long, env = "GITSYNC_ASKPASS_URL")]
    pub askpass_url: Option<String>,

    #[arg(long, env = "GITSYNC_GITHUB_APP_ID")]
    pub github_app_id: Option<String>,

    #[arg(long, env = "GITSYNC_GITHUB_APP_INSTALLATION_ID")]
    pub github_app_installation_id: Option<String>,

    #[arg(long, env = "GITSYNC_GITHUB_APP_PRIVATE_KEY_FILE")]
    pub github_app_private_key_file: Option<PathBuf>,

    #[arg(long, env = "GITSYNC_GITHUB_APP_API_URL", default_value = "https://api.github.com")]
    pub github_app_api_url: String,

    #[arg(long, env = "GITSYNC_GIT", default_value = "git")]
    pub git: PathBuf,

    #[arg(long, env = "GITSYNC_GIT_CONFIG")]
    pub git_config: Option<String>,

    #[arg(long, env = "GITSYNC_GIT_GC", default_value = "auto")]
    pub git_gc: GcPolicyArg,

    #[arg(long, env = "GITSYNC_HTTP_BIND", default_value = ":8080")]
    pub http_bind: String,

    #[arg(long, env = "GITSYNC_HTTP_METRICS")]
    pub http_metrics: bool,

    #[arg(long, env = "GITSYNC_HTTP_PPROF")]
    pub http_pprof: bool,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum SubmoduleModeArg {
    Recursive,
    Shallow,
    Off,
}

impl From<SubmoduleModeArg> for SubmoduleMode {
    fn from(v: SubmoduleModeArg) -> Self {
        match v {
            SubmoduleModeArg::Recursive => SubmoduleMode::Recursive,
            SubmoduleModeArg::Shallow => SubmoduleMode::Shallow,
            SubmoduleModeArg::Off => SubmoduleMode::Off,
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum GcPolicyArg {
    Auto,
    Always,
    Aggressive,
    Off,
}

impl From<GcPolicyArg> for GcPolicy {
    fn from(v: GcPolicyArg) -> Self {
        match v {
            GcPolicyArg::Auto => GcPolicy::Auto,
            GcPolicyArg::Always => GcPolicy::Always,
            GcPolicyArg::Aggressive => GcPolicy::Aggressive,
            GcPolicyArg::Off => GcPolicy::Off,
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    // A bare integer means seconds, same as the "1m"/"30s" forms elsewhere
    // on this flag surface; humantime only accepts the latter.
    if let Ok(secs) = s.trim().parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Resolves the Open Question in SPEC_FULL.md §9: accepts a leading `0o` or
/// bare digits, always interpreted as octal.
fn parse_octal_permissions(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    u32::from_str_radix(digits, 8).map_err(|e| format!("invalid octal permission bits {s:?}: {e}"))
}

fn parse_http_bind(s: &str) -> Result<SocketAddr> {
    let s = if let Some(port) = s.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        s.to_owned()
    };
    s.parse::<SocketAddr>().with_context(|| format!("invalid --http-bind value {s:?}"))
}

/// The validated auth method plus the pieces of `Cli` the sync engine and
/// scheduler need, split out from the repository request itself.
pub struct ResolvedConfig {
    pub repo_spec: RepoSpec,
    pub scheduler: SchedulerConfig,
    pub http_bind: SocketAddr,
    pub http_config: HttpConfig,
    pub git_binary: PathBuf,
    pub git_config_extra: Option<String>,
    pub exechook: Option<ExecHookConfig>,
    pub webhook: Option<WebhookConfig>,
    pub error_file: Option<PathBuf>,
}

pub struct ExecHookConfig {
    pub command: PathBuf,
    pub timeout: Duration,
    pub backoff: Duration,
}

pub struct WebhookConfig {
    pub url: String,
    pub method: String,
    pub success_status: Option<u16>,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Cli {
    pub fn resolve(self) -> Result<ResolvedConfig> {
        let auth = self.resolve_auth()?;

        let dest = self.dest.clone().unwrap_or_else(|| default_dest(&self.repo));

        let repo_spec = RepoSpec {
            remote: self.repo.clone(),
            branch: self.branch.clone(),
            rev: self.rev.clone(),
            depth: self.depth,
            submodule_mode: self.submodules.into(),
            sparse_checkout_file: self.sparse_checkout_file.clone(),
            change_permissions: self.change_permissions,
            gc_policy: self.git_gc.into(),
            root: self.root.clone(),
            dest,
            askpass_url: self.askpass_url.clone(),
            auth,
        };

        let scheduler = SchedulerConfig {
            wait: self.wait,
            sync_timeout: self.timeout,
            one_shot: self.one_time,
            max_sync_failures: self.max_sync_failures,
        };

        let http_bind = parse_http_bind(&self.http_bind)?;
        let http_config = HttpConfig {
            metrics_enabled: self.http_metrics,
            pprof_enabled: self.http_pprof,
        };

        let exechook = self.exechook_command.clone().map(|command| ExecHookConfig {
            command,
            timeout: self.exechook_timeout,
            backoff: self.exechook_backoff,
        });
        let webhook = self.webhook_url.clone().map(|url| WebhookConfig {
            url,
            method: self.webhook_method.clone(),
            success_status: self.webhook_success_status,
            timeout: self.webhook_timeout,
            backoff: self.webhook_backoff,
        });

        Ok(ResolvedConfig {
            repo_spec,
            scheduler,
            http_bind,
            http_config,
            git_binary: self.git,
            git_config_extra: self.git_config,
            exechook,
            webhook,
            error_file: self.error_file,
        })
    }

    /// Enforces "at most one of {user+password, SSH, cookie file, HTTP
    /// ASKPASS, GitHub-App}" from spec.md §4.D; ASKPASS may combine with
    /// user+password since it's the mechanism that *produces* them.
    fn resolve_auth(&self) -> Result<AuthMethod> {
        let has_user_password = self.username.is_some() || self.password.is_some() || self.password_file.is_some();
        let has_ssh = self.ssh;
        let has_cookie = self.cookie_file.is_some();
        let has_github_app = self.github_app_id.is_some();

        let exclusive_count =
            [has_user_password, has_ssh, has_cookie, has_github_app].iter().filter(|b| **b).count();
        if exclusive_count > 1 {
            bail!("at most one of --username/--password, --ssh, --cookie-file, --github-app-id may be set");
        }

        if has_github_app {
            let installation_id = self
                .github_app_installation_id
                .clone()
                .context("--github-app-installation-id is required with --github-app-id")?;
            let key_file = self
                .github_app_private_key_file
                .clone()
                .context("--github-app-private-key-file is required with --github-app-id")?;
            let private_key_pem = std::fs::read_to_string(&key_file)
                .with_context(|| format!("reading github app private key {key_file:?}"))?;
            return Ok(AuthMethod::GitHubApp {
                app_id: self.github_app_id.clone().unwrap(),
                installation_id,
                private_key_pem,
                api_url: self.github_app_api_url.clone(),
            });
        }

        if has_ssh {
            let key_file = self.ssh_key_file.clone().context("--ssh-key-file is required with --ssh")?;
            let known_hosts = if self.ssh_known_hosts {
                let file = self
                    .ssh_known_hosts_file
                    .clone()
                    .context("--ssh-known-hosts-file is required unless --ssh-known-hosts=false")?;
                crate::auth::KnownHosts::Verify(file)
            } else {
                crate::auth::KnownHosts::Skip
            };
            return Ok(AuthMethod::Ssh { key_file, known_hosts });
        }

        if has_cookie {
            return Ok(AuthMethod::CookieFile { path: self.cookie_file.clone().unwrap() });
        }

        if has_user_password {
            let username = self.username.clone().unwrap_or_default();
            let password = match &self.password_file {
                Some(file) => std::fs::read_to_string(file)
                    .with_context(|| format!("reading password file {file:?}"))?
                    .trim_end()
                    .to_owned(),
                None => self.password.clone().unwrap_or_default(),
            };
            return Ok(AuthMethod::UserPassword { username, password });
        }

        if let Some(url) = &self.askpass_url {
            return Ok(AuthMethod::Askpass { url: url.clone() });
        }

        Ok(AuthMethod::None)
    }
}

fn default_dest(repo_url: &str) -> PathBuf {
    let leaf = repo_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(repo_url)
        .trim_end_matches(".git");
    PathBuf::from(if leaf.is_empty() { "repo" } else { leaf })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_args() {
        let cli = Cli::parse_from(["gitsync", "--repo", "https://example.com/foo.git", "--root", "/tmp/root"]);
        assert_eq!(cli.branch, "master");
        assert_eq!(cli.rev, "HEAD");
        assert_eq!(cli.max_sync_failures, -1);
    }

    #[test]
    fn octal_permissions_accepts_bare_digits_and_0o_prefix() {
        assert_eq!(parse_octal_permissions("755").unwrap(), 0o755);
        assert_eq!(parse_octal_permissions("0o755").unwrap(), 0o755);
        assert!(parse_octal_permissions("999").is_err());
    }

    #[test]
    fn duration_parses_suffixed_and_bare_forms() {
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn default_dest_strips_dotgit_suffix() {
        assert_eq!(default_dest("https://example.com/org/myrepo.git"), PathBuf::from("myrepo"));
    }

    #[test]
    fn rejects_conflicting_auth_mechanisms() {
        let cli = Cli::parse_from([
            "gitsync",
            "--repo",
            "https://example.com/foo.git",
            "--root",
            "/tmp/root",
            "--ssh",
            "--ssh-key-file",
            "/tmp/key",
            "--ssh-known-hosts",
            "false",
            "--cookie-file",
            "/tmp/cookie",
        ]);
        assert!(cli.resolve_auth().is_err());
    }

    #[test]
    fn http_bind_accepts_port_only_form() {
        let addr = parse_http_bind(":9090").unwrap();
        assert_eq!(addr.port(), 9090);
    }
}
