// ============================================================================
// FLOWWATCH CLI
// ============================================================================
// Composes the engine and serves the textual control surface on
// stdin/stdout. The collector transport is not wired here: outgoing
// collection requests are logged and agent replies arrive through
// `MonitoringEngine::reply_sender`.
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use prometheus::Registry;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use flowwatch_engine::config::EngineConfig;
use flowwatch_engine::logging::init_logging;
use flowwatch_engine::topology::TopologyFeed;
use flowwatch_engine::transport::ChannelDispatcher;
use flowwatch_engine::types::DatapathLink;
use flowwatch_engine::{MonitoringEngine, DISPATCH_QUEUE_CAPACITY, ENGINE_FULL_NAME, ENGINE_VERSION};

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

/// Flowwatch measurement engine
#[derive(Parser, Debug)]
#[command(
    name = "flowwatch",
    version,
    about = "Measurement-request correlation engine for SDN flow monitoring",
    long_about = "Flowwatch issues sampling and probing requests to per-node collector \
                  agents, correlates their replies and keeps track of which flows are \
                  being monitored."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "flowwatch.toml", env = "FLOWWATCH_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "FLOWWATCH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "FLOWWATCH_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine and read control commands from stdin
    Run {
        /// Seed the topology with a link, e.g. `1[1]>2[1]` (repeatable)
        #[arg(long = "link")]
        links: Vec<DatapathLink>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version
    Version,
}

// ----------------------------------------------------------------------------
// CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());
    let config = EngineConfig::load(config_path)
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!("{}", toml::to_string_pretty(&config).context("failed to render configuration")?);
    }
    println!("  instance:          {}", config.engine.instance_name);
    println!("  collector port:    {}", config.collector_handler.local_port);
    println!("  sampling port:     {}", config.collector_handler.sampling_port);
    println!(
        "  deadline margin:   {}",
        humantime::format_duration(config.collector_handler.deadline_margin)
    );
    println!("  probe base flow:   {}", config.probing.probe_base_flow());
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config = EngineConfig::generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, config).with_context(|| format!("failed to write {}", path.display()))?;
            println!("Default configuration written to {}", path.display());
        }
        None => print!("{}", config),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
}

async fn handle_run(config: EngineConfig, links: Vec<DatapathLink>) -> AnyhowResult<()> {
    let (dispatcher, mut requests) = ChannelDispatcher::new(DISPATCH_QUEUE_CAPACITY);
    let topology = Arc::new(TopologyFeed::new());
    for link in links {
        topology.add_link(link);
    }

    let engine = MonitoringEngine::compose(config, Arc::new(dispatcher), Arc::clone(&topology), Registry::new())
        .await
        .context("failed to compose the monitoring engine")?;

    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            debug!(
                target: "flowwatch::collectors",
                request_id = %request.request_id,
                key = %request.key,
                duration_ms = request.duration.as_millis() as u64,
                "Collection request ready for transport"
            );
        }
    });

    let control = engine.control_surface();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    info!(target: "flowwatch::control", "Reading control commands from stdin");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target: "flowwatch::init", "Interrupt received");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break };
                let reply = match line.trim() {
                    "metrics" => engine.metrics_text(),
                    "stats" => serde_json::to_string_pretty(&engine.stats()).context("failed to render stats")?,
                    _ => control.execute(&line),
                };
                stdout.write_all(reply.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that need no engine
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let config_missing = !cli.config.exists();
    let config = if config_missing {
        EngineConfig::default()
    } else {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if config_missing {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }
    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let links = match cli.command {
        Some(Commands::Run { links }) => links,
        _ => Vec::new(),
    };
    handle_run(config, links).await
}
