mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tabfleet::cdp::{CdpConfig, CdpConnection};
use tabfleet::chrome;
use tabfleet::config::{self, ResolvedConfig};
use tabfleet::dispatch::ToolDispatch;
use tabfleet::error::ServerError;
use tabfleet::policy::DomainPolicy;
use tabfleet::pool::{PagePool, PoolConfig};
use tabfleet::rpc::{Framing, RpcServer};
use tabfleet::screenshot::ScreenshotScheduler;
use tabfleet::sessions::{SessionConfig, SessionManager};
use tabfleet::workflow::WorkflowEngine;

use cli::{Cli, Command, RestartArgs, ServeArgs};

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries JSON-RPC frames.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.global.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}", json!({ "error": format!("runtime init failed: {e}") }));
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&cli)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("{}", json!({ "error": e.to_string() }));
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let (config_path, file) = config::load_config(cli.global.config.as_deref())?;
    let resolved = config::resolve(config_path, &file);

    match &cli.command {
        Command::Serve(args) => serve(args, resolved).await,
        Command::Setup => setup(cli),
        Command::Doctor => doctor(&resolved).await,
        Command::Restart(args) => restart(args, resolved).await,
        Command::Stop => stop().await,
    }
}

async fn serve(
    args: &ServeArgs,
    mut resolved: ResolvedConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = args.port {
        resolved.chrome_port = port;
    }
    if args.auto_launch {
        resolved.auto_launch = true;
    }
    if args.headless {
        resolved.headless = true;
    }
    if let Some(min) = args.pool_min {
        resolved.pool_min_size = min;
    }
    if let Some(max) = args.pool_max {
        resolved.pool_max_size = max;
    }
    let framing = Framing::parse(&args.framing)
        .ok_or_else(|| ServerError::InvalidParams(format!("unknown framing '{}'", args.framing)))?;

    let launch = chrome::LaunchConfig {
        executable: resolved.chrome_executable.clone(),
        port: resolved.chrome_port,
        headless: resolved.headless,
        extra_args: resolved.chrome_extra_args.clone(),
        user_data_dir: resolved.user_data_dir.clone(),
        auto_launch: resolved.auto_launch,
        ..chrome::LaunchConfig::default()
    };
    let outcome = chrome::ensure(&launch).await?;
    info!(port = outcome.port, "browser endpoint ready");

    if let Some(process) = &outcome.process {
        let state = chrome::SpawnedChrome {
            port: outcome.port,
            pid: process.pid(),
            user_data_dir: resolved.user_data_dir.clone(),
        };
        if let Ok(path) = chrome::state_file_path() {
            let _ = chrome::write_state(&path, &state);
        }
    }

    let conn = CdpConnection::discover(
        "127.0.0.1",
        outcome.port,
        CdpConfig {
            command_timeout: resolved.command_timeout,
            ..CdpConfig::default()
        },
    );
    conn.connect().await.map_err(ServerError::Cdp)?;
    conn.start_heartbeat();

    let pool = PagePool::new(
        conn.clone(),
        PoolConfig {
            min_size: resolved.pool_min_size,
            max_size: resolved.pool_max_size,
            idle_timeout: resolved.pool_idle_timeout,
            pre_warm: resolved.pool_pre_warm,
            ..PoolConfig::default()
        },
    );
    pool.start();

    let sessions = SessionManager::new(
        conn.clone(),
        SessionConfig {
            max_sessions: resolved.max_sessions,
            session_ttl: resolved.session_ttl,
            cleanup_interval: resolved.cleanup_interval,
        },
    );
    sessions.start();

    let screenshots = ScreenshotScheduler::new(resolved.screenshot_concurrency);
    let policy = Arc::new(DomainPolicy::new(&resolved.blocked_domains));
    let dispatch = Arc::new(ToolDispatch::new(
        conn.clone(),
        sessions.clone(),
        pool.clone(),
        screenshots,
        policy,
    ));
    let engine = WorkflowEngine::new(pool.clone(), sessions.clone());

    let server = RpcServer::new(dispatch, engine, framing, outcome.process);

    info!("serving on stdio");
    tokio::select! {
        result = server.run(tokio::io::stdin(), tokio::io::stdout()) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            server.shutdown(false).await;
        }
    }
    Ok(())
}

fn setup(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let path = match &cli.global.config {
        Some(path) => path.clone(),
        None => config::default_config_path()
            .ok_or_else(|| ServerError::Internal("no user configuration directory".into()))?,
    };
    if path.exists() {
        println!("{}", json!({ "config": path, "created": false }));
        return Ok(());
    }
    config::write_template(&path)?;
    println!("{}", json!({ "config": path, "created": true }));
    Ok(())
}

async fn doctor(resolved: &ResolvedConfig) -> Result<(), Box<dyn std::error::Error>> {
    let executable = resolved
        .chrome_executable
        .clone()
        .map_or_else(|| chrome::find_chrome_executable().ok(), Some);

    let port_reachable = chrome::query_version("127.0.0.1", resolved.chrome_port)
        .await
        .is_ok();

    let profile = resolved
        .user_data_dir
        .clone()
        .or_else(chrome::default_user_data_dir);
    let lock = profile.as_deref().map(chrome::profile_lock_state);

    let spawned = chrome::state_file_path()
        .ok()
        .and_then(|path| chrome::read_state(&path).ok().flatten());

    let executable_found = executable.is_some();
    let report = json!({
        "config": resolved.config_path.clone(),
        "chrome_executable": executable,
        "debug_port": resolved.chrome_port,
        "debug_port_reachable": port_reachable,
        "profile_lock": lock.map(|l| format!("{l:?}")),
        "spawned_chrome": spawned.map(|s| json!({ "pid": s.pid, "port": s.port })),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !port_reachable && !executable_found {
        return Err(Box::new(ServerError::Chrome(
            chrome::ChromeError::NotFound(
                "no executable found and nothing listening on the debug port".into(),
            ),
        )));
    }
    Ok(())
}

async fn restart(
    args: &RestartArgs,
    mut resolved: ResolvedConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = args.port {
        resolved.chrome_port = port;
    }
    if args.headless {
        resolved.headless = true;
    }

    let launch = chrome::LaunchConfig {
        executable: resolved.chrome_executable.clone(),
        port: resolved.chrome_port,
        headless: resolved.headless,
        extra_args: resolved.chrome_extra_args.clone(),
        user_data_dir: resolved.user_data_dir.clone(),
        ..chrome::LaunchConfig::default()
    };

    let process = chrome::restart(&launch).await?;
    // The browser must outlive this invocation.
    let (pid, port) = process.detach();

    let state = chrome::SpawnedChrome {
        port,
        pid,
        user_data_dir: resolved.user_data_dir.clone(),
    };
    if let Ok(path) = chrome::state_file_path() {
        let _ = chrome::write_state(&path, &state);
    }

    println!("{}", json!({ "restarted": true, "pid": pid, "port": port }));
    Ok(())
}

async fn stop() -> Result<(), Box<dyn std::error::Error>> {
    let path = chrome::state_file_path()?;
    let Some(state) = chrome::read_state(&path)? else {
        println!("{}", json!({ "stopped": false, "reason": "no spawned Chrome recorded" }));
        return Ok(());
    };

    info!(pid = state.pid, "stopping spawned Chrome");
    chrome::terminate_pid(state.pid, Duration::from_secs(10)).await;
    chrome::delete_state(&path)?;

    if let Some(dir) = state.user_data_dir {
        if dir.starts_with(std::env::temp_dir()) {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    println!("{}", json!({ "stopped": true, "pid": state.pid }));
    Ok(())
}
