mod jobs;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cronpilot", about = "Crontab manager with live job events")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List cron jobs
    List {
        /// Only this user's crontab (all known users when omitted)
        #[arg(short, long)]
        user: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run a job now
    Run {
        /// Job id (xxxx-xxxx)
        id: String,

        /// Return immediately and write output to the run log
        #[arg(short, long)]
        background: bool,
    },
    /// Check system health
    Health,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cronpilot_config::load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {e}");
            let mut config = cronpilot_config::CronPilotConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Serve { port } => rt.block_on(cronpilot_gateway::start_gateway(config, port))?,
        Commands::List { user, json } => rt.block_on(jobs::run_list(&config, user, json))?,
        Commands::Run { id, background } => rt.block_on(jobs::run_job(&config, &id, background))?,
        Commands::Health => rt.block_on(jobs::run_health(&config)),
    }

    Ok(())
}
