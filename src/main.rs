use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pipesync::agent::ConfigSyncAgent;
use pipesync::settings::Settings;
use pipesync::validator::{EngineValidator, SignalProcessControl};

#[derive(Parser)]
#[command(name = "pipesync")]
#[command(
    about = "Fleet-side control-plane agent keeping a local telemetry pipeline configured, discovered, and certificate-gated"
)]
#[command(version)]
struct Cli {
    /// Working directory for agent state (default: $PIPESYNC_WORKING_DIR or /var/lib/pipesync)
    #[arg(short, long)]
    working_dir: Option<PathBuf>,
    /// Control-plane base URL (default: $PIPESYNC_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run continuously: reconciliation loop plus the local HTTP surface
    Run {
        /// Local HTTP surface port
        #[arg(short, long)]
        port: Option<u16>,
        /// Seconds between reconciliation cycles
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run a single reconciliation cycle and exit
    Cycle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env(cli.working_dir, cli.base_url)?;

    let validator = Arc::new(EngineValidator::new(settings.engine_binary.clone()));
    let control = Arc::new(SignalProcessControl::new(
        settings.engine_pid_file.clone(),
        settings.issuer_pid_file.clone(),
    ));

    match cli.command {
        Commands::Run { port, interval } => {
            if let Some(port) = port {
                settings.local_port = port;
            }
            if let Some(interval) = interval {
                settings.sync_interval = interval;
            }
            let mut agent = ConfigSyncAgent::new(settings.clone(), validator, control)?;

            let surface = tokio::spawn(pipesync::server::serve(settings));
            let result = agent.run_loop().await;
            surface.abort();

            if let Err(e) = result {
                // Authentication rejection: retrying cannot succeed.
                error!("terminating: {e:#}");
                std::process::exit(1);
            }
            info!("agent stopped");
            Ok(())
        }
        Commands::Cycle => {
            let mut agent = ConfigSyncAgent::new(settings, validator, control)?;
            if let Err(e) = agent.run_cycle().await {
                error!("terminating: {e:#}");
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
