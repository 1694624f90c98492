// src/main.rs
//
// =============================================================================
// SANDCELL: ENTRY POINT (v 0.4)
// =============================================================================
//
// Two personalities in one binary:
// 1. DAEMON: `sandcell start` boots the engine and serves until interrupted.
//    (The RPC surface is a separate collaborator; `sandcell run` is a
//    one-shot stand-in that submits a single job and follows its logs.)
// 2. INIT:   the sandbox re-exec. Selected by environment, checked before
//    anything else starts so no runtime threads exist at fork time.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;

use sandcell::config::DaemonConfig;
use sandcell::core::{JobSpec, NetworkSelection, ResourceLimits};
use sandcell::daemon::Daemon;
use sandcell::init;
use sandcell::platform::HostPlatform;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "sandcell",
    version,
    about = "Single-node sandboxed job execution service"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the engine and serve until interrupted.
    Start {
        /// Config file (YAML). Missing file means defaults.
        #[arg(long, default_value = "/etc/sandcell/config.yaml")]
        config: String,
    },

    /// One-shot: submit a command, follow its logs, exit with its code.
    Run {
        /// Config file (YAML). Missing file means defaults.
        #[arg(long, default_value = "/etc/sandcell/config.yaml")]
        config: String,

        /// Memory ceiling, e.g. "256MB".
        #[arg(long)]
        memory: Option<String>,

        /// CPU percent of one core (100 = one full core).
        #[arg(long)]
        cpu: Option<u32>,

        /// Network: "none", "isolated", or a named network.
        #[arg(long, default_value = "none")]
        network: String,

        /// The command and its arguments.
        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

fn main() -> Result<()> {
    // The sandbox re-exec never reaches the CLI: it must fork, and forking
    // wants a single-threaded process, so this check precedes the runtime.
    if init::is_init_mode() {
        init::run();
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Start { config } => runtime.block_on(serve(config)),
        Commands::Run {
            config,
            memory,
            cpu,
            network,
            argv,
        } => runtime.block_on(run_once(config, memory, cpu, network, argv)),
    }
}

// ============================================================================
// 3. DAEMON SERVICE
// ============================================================================

async fn serve(config_path: String) -> Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    let daemon = Daemon::boot(config, Arc::new(HostPlatform)).await?;

    log::info!("engine serving; ctrl-c to stop");
    signal::ctrl_c().await?;
    log::warn!("interrupt received, stopping");

    daemon.shutdown().await;
    Ok(())
}

// ============================================================================
// 4. ONE-SHOT RUNNER
// ============================================================================

async fn run_once(
    config_path: String,
    memory: Option<String>,
    cpu: Option<u32>,
    network: String,
    argv: Vec<String>,
) -> Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    let daemon = Daemon::boot(config, Arc::new(HostPlatform)).await?;

    let memory_bytes = match memory {
        Some(spec) => sandcell::core::parse_size(&spec)?,
        None => 0,
    };

    let mut argv = argv.into_iter();
    let command = argv.next().expect("clap enforces at least one element");
    let spec = JobSpec {
        command,
        args: argv.collect(),
        limits: ResourceLimits {
            memory_bytes,
            cpu_percent: cpu.unwrap_or(0),
            ..Default::default()
        },
        network: NetworkSelection::parse(&network),
        ..Default::default()
    };

    let receipt = daemon.submit(spec)?;
    log::info!("submitted job {}", receipt.job_id);

    let mut logs = daemon.stream_logs(&receipt.job_id, true, true)?;
    while let Some(chunk) = logs.next().await {
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(&chunk.data);
        let _ = out.flush();
    }

    let view = daemon.get_status(&receipt.job_id).await?;
    log::info!("job finished: {:?} (exit {:?})", view.status, view.exit_code);
    daemon.shutdown().await;

    std::process::exit(view.exit_code.unwrap_or(1));
}
