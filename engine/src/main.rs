use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use autopilot_observability::{default_logs_dir, init_logging};
use autopilot_server::{run, AppState};
use autopilot_types::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "autopilot-engine")]
#[command(about = "Autonomous-agent control plane for service businesses")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP control plane.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// JSON config file; missing fields fall back to defaults.
        #[arg(long, env = "AUTOPILOT_CONFIG")]
        config: Option<PathBuf>,
        /// Root for logs and local state.
        #[arg(long, env = "AUTOPILOT_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },
    /// Print the effective configuration (secrets masked) and exit.
    Config {
        #[arg(long, env = "AUTOPILOT_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            config,
            state_dir,
        } => {
            let state_dir = state_dir.unwrap_or_else(|| PathBuf::from("./autopilot-state"));
            let logs_dir = default_logs_dir(&state_dir);
            let _guard = init_logging(&logs_dir, 14)?;
            info!(logs_dir = %logs_dir.display(), "logging_initialized");

            let config = load_config(config.as_deref())?;
            report_features(&config);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let state = AppState::from_config(config);
            info!(%addr, "starting autopilot engine");
            run(addr, state).await?;
        }
        Command::Config { config } => {
            let mut config = load_config(config.as_deref())?;
            config.provider_api_key = config.provider_api_key.map(|_| "***".to_string());
            config.messaging_auth_token = config.messaging_auth_token.map(|_| "***".to_string());
            config.queue_auth_token = config.queue_auth_token.map(|_| "***".to_string());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Config file (when given) plus environment overrides for secrets. The
/// secret manager materializes secrets as environment variables on container
/// start; a missing secret degrades the feature, it never aborts startup.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => EngineConfig::default(),
    };

    if let Some(key) = env_secret("AUTOPILOT_PROVIDER_API_KEY") {
        config.provider_api_key = Some(key);
    }
    if let Some(token) = env_secret("AUTOPILOT_MESSAGING_AUTH_TOKEN") {
        config.messaging_auth_token = Some(token);
    }
    if let Some(token) = env_secret("AUTOPILOT_QUEUE_AUTH_TOKEN") {
        config.queue_auth_token = Some(token);
    }
    Ok(config)
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn report_features(config: &EngineConfig) {
    if !config.llm_available() {
        warn!("provider API key not configured; LLM-backed agents are unavailable");
    }
    if !config.messaging_available() {
        warn!("messaging auth token not configured; outreach sends are unavailable");
    }
    if config.queue_auth_token.is_none() {
        warn!("queue auth token not configured; internal task endpoints are unauthenticated");
    }
}
