use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::Logger;
use gitsync::auth::{self, AuthMethod};
use gitsync::cli::Cli;
use gitsync::hook::{CommandHook, Hook, HookRunner, Webhook};
use gitsync::process::CommandRunner;
use gitsync::reaper;
use gitsync::scheduler::{self, NamedHookRunner, SchedulerConfig};
use gitsync::status::Status;
use gitsync::sync::SyncEngine;
use gitsync::util::ErrGroup;
use tokio_util::sync::CancellationToken;

fn main() {
    if reaper::is_pid1() {
        reaper::run_as_init();
    }

    let exit_code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("gitsync: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32> {
    Logger::try_with_env_or_str("info")
        .context("configuring logger")?
        .start()
        .context("starting logger")?;

    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<i32> {
    let runner = CommandRunner::default();
    let ct = CancellationToken::new();

    let git_config_extra = cli.git_config.clone();
    let mut resolved = cli.resolve().context("invalid configuration")?;

    let status = Arc::new(Status::new(resolved.error_file.clone()));

    // Bootstrap auth once before the loop starts; the ASKPASS path is
    // re-run every cycle from inside the sync engine instead. The template
    // is the remote as configured, before any GitHub-App rewrite - re-auth
    // needs it to rewrite the same URL again rather than a stale token.
    let remote_template = resolved.repo_spec.remote.clone();
    let mut auth_refresh = None;
    if !matches!(resolved.repo_spec.auth, AuthMethod::Askpass { .. }) {
        let token = auth::bootstrap(&ct, &runner, &resolved.repo_spec.auth, &remote_template)
            .await
            .context("auth bootstrap failed")?;
        if let Some(token) = token {
            resolved.repo_spec.remote = token.remote_url;
            auth_refresh = Some(scheduler::AuthRefresh {
                method: resolved.repo_spec.auth.clone(),
                runner: runner.clone(),
                remote_template,
                next_refresh: token.expires_at,
            });
        }
    }
    if let Some(raw) = &git_config_extra {
        auth::apply_extra_git_config(&ct, &runner, raw)
            .await
            .context("applying --git-config")?;
    }

    std::fs::create_dir_all(&resolved.repo_spec.root).context("creating root directory")?;

    let engine = SyncEngine::new(resolved.repo_spec.clone(), resolved.git_binary.clone(), runner.clone(), status.clone());

    let mut hook_runners = Vec::new();
    let mut hook_tasks: Vec<(String, _)> = Vec::new();

    if let Some(exechook) = &resolved.exechook {
        let hook: Arc<dyn Hook> = Arc::new(CommandHook::new(
            "exechook",
            exechook.command.clone(),
            resolved.repo_spec.root.clone(),
            exechook.timeout,
            runner.clone(),
        ));
        let (runner_handle, task) = HookRunner::spawn(hook, ct.clone(), status.clone(), exechook.backoff);
        hook_tasks.push(("exechook".to_owned(), task));
        hook_runners.push(NamedHookRunner { name: "exechook".to_owned(), runner: runner_handle });
    }

    if let Some(webhook_config) = &resolved.webhook {
        let method = webhook_config
            .method
            .parse::<reqwest::Method>()
            .with_context(|| format!("invalid --webhook-method {:?}", webhook_config.method))?;
        let webhook = Webhook::new(
            "webhook",
            webhook_config.url.clone(),
            method,
            webhook_config.success_status,
            webhook_config.timeout,
        );
        let hook: Arc<dyn Hook> = Arc::new(webhook);
        let (runner_handle, task) = HookRunner::spawn(hook, ct.clone(), status.clone(), webhook_config.backoff);
        hook_tasks.push(("webhook".to_owned(), task));
        hook_runners.push(NamedHookRunner { name: "webhook".to_owned(), runner: runner_handle });
    }

    let mut group = ErrGroup::new(ct.clone());
    for (name, task) in hook_tasks {
        group.spawn(async move { task.await.with_context(|| format!("hook task {name} failed")) });
    }

    group.spawn({
        let status = status.clone();
        let ct = ct.clone();
        async move { gitsync::http::serve(resolved.http_bind, status, resolved.http_config, ct).await }
    });

    let scheduler_config = SchedulerConfig {
        wait: resolved.scheduler.wait,
        sync_timeout: resolved.scheduler.sync_timeout,
        one_shot: resolved.scheduler.one_shot,
        max_sync_failures: resolved.scheduler.max_sync_failures,
    };

    let driver_ct = ct.clone();
    let exit_code = tokio::select! {
        result = scheduler::run(driver_ct, scheduler_config, engine, status, hook_runners, auth_refresh) => {
            ct.cancel();
            result?
        }
        _ = wait_for_termination_signal() => {
            ct.cancel();
            0
        }
    };

    let _ = group.wait().await;
    Ok(exit_code)
}

async fn wait_for_termination_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("registering SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
