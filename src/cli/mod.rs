use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Parallel browser-automation server over the Chrome DevTools Protocol.
#[derive(Debug, Parser)]
#[command(name = "tabfleet", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Path to the config file (default: the user config directory).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter (tracing syntax), e.g. "info" or "tabfleet=debug".
    #[arg(long, global = true, default_value = "info")]
    pub log: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the stdio JSON-RPC server.
    Serve(ServeArgs),
    /// Write the default config file template.
    Setup,
    /// Probe Chrome discovery, the debug port, and the profile lock.
    Doctor,
    /// Gracefully quit the Chrome holding the configured profile and
    /// start a fresh one with remote debugging enabled.
    Restart(RestartArgs),
    /// Terminate a Chrome previously spawned by `serve`.
    Stop,
}

#[derive(Debug, Args)]
pub struct RestartArgs {
    /// Remote debugging port for the restarted Chrome.
    #[arg(long, env = "TABFLEET_CDP_PORT")]
    pub port: Option<u16>,

    /// Restart into headless mode.
    #[arg(long)]
    pub headless: bool,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Remote debugging port.
    #[arg(long, env = "TABFLEET_CDP_PORT")]
    pub port: Option<u16>,

    /// Launch Chrome if nothing is listening on the port.
    #[arg(long)]
    pub auto_launch: bool,

    /// Launch Chrome headless (only with --auto-launch).
    #[arg(long)]
    pub headless: bool,

    /// Wire framing: "newline" or "length-prefixed".
    #[arg(long, default_value = "newline")]
    pub framing: String,

    /// Override the pool's minimum pre-warmed size.
    #[arg(long)]
    pub pool_min: Option<usize>,

    /// Override the pool's maximum size (0 disables recycling).
    #[arg(long)]
    pub pool_max: Option<usize>,
}
