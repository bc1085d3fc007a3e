mod channel_commands;
mod run_commands;

use std::{path::Path, sync::Arc};

use {
    anyhow::Context as _,
    clap::{Parser, Subcommand},
    switchboard_channels::{ChannelPlugin, ChannelRegistry},
    switchboard_config::{ConfigSource, FileConfig, MemoryConfig, SwitchboardConfig, find_config_file},
    switchboard_loopback::{LoopbackHub, LoopbackOptions, LoopbackPlugin},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard, a host for chat channel plugins")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./switchboard.toml and
    /// ~/.config/switchboard/).
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled account and serve messages until Ctrl-C (default).
    Run {
        /// Only start accounts of this channel.
        #[arg(long)]
        channel: Option<String>,
        /// Reply to admitted messages with their own text.
        #[arg(long, default_value_t = false)]
        echo: bool,
    },
    /// Channel account management.
    Channels {
        #[command(subcommand)]
        action: channel_commands::ChannelAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Explicit path, then discovery, then an empty in-memory config.
fn open_config(path: Option<&Path>) -> anyhow::Result<Arc<dyn ConfigSource>> {
    let path = path.map(Path::to_path_buf).or_else(find_config_file);
    match path {
        Some(path) => {
            let source = FileConfig::open(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            info!(path = %path.display(), "loaded config");
            Ok(Arc::new(source))
        },
        None => {
            warn!("no config file found, running with an empty in-memory config");
            Ok(Arc::new(MemoryConfig::default()))
        },
    }
}

fn build_registry(hub: &LoopbackHub, config: &SwitchboardConfig) -> ChannelRegistry {
    let mut registry = ChannelRegistry::new();
    let loopback: Arc<dyn ChannelPlugin> = Arc::new(LoopbackPlugin::with_options(
        hub.clone(),
        LoopbackOptions::from_config(config),
    ));
    registry.register(loopback);
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    let source = open_config(cli.config.as_deref())?;
    let hub = LoopbackHub::new();
    let registry = Arc::new(build_registry(&hub, &source.snapshot()));

    match cli.command {
        None => run_commands::run(registry, source, hub, None, false).await,
        Some(Commands::Run { channel, echo }) => {
            run_commands::run(registry, source, hub, channel.as_deref(), echo).await
        },
        Some(Commands::Channels { action }) => {
            channel_commands::handle_channels(action, &registry, source).await
        },
    }
}
