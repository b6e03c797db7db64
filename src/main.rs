use std::sync::Arc;

use busrelay::config::{ConfigError, RelayConfig};
use busrelay::net::api::{ApiError, HttpApi, RosterSource};
use busrelay::net::transport::WsConnector;
use busrelay::net::types::{Role, now_ms};
use busrelay::services::session::DashboardSession;
use busrelay::state::liveness::{LivenessPolicy, live_ids};
use clap::{Parser, Subcommand};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("backend request failed: {0}")]
    Api(#[from] ApiError),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "busrelay", about = "Live bus relay connection manager")]
struct Cli {
    /// Backend origin. Falls back to `BUSRELAY_API_BASE_URL`.
    #[arg(long)]
    base_url: Option<String>,

    #[arg(long, env = "BUSRELAY_API_TOKEN")]
    api_token: Option<String>,

    /// `admin` or `student`.
    #[arg(long, env = "BUSRELAY_ROLE", default_value = "admin")]
    role: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a dashboard session until Ctrl-C.
    Watch {
        /// Bus id to keep the camera on.
        #[arg(long)]
        follow: Option<String>,
    },
    /// Poll the roster once and print the live bus ids.
    Live,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let role: Role = cli.role.parse()?;
    let mut config = match cli.base_url.as_deref() {
        Some(base_url) => RelayConfig::new(base_url, role)?.with_env_overrides(),
        None => RelayConfig { role, ..RelayConfig::from_env()? },
    };
    if let Some(token) = cli.api_token.filter(|t| !t.trim().is_empty()) {
        config.api_token = Some(token);
    }

    match cli.command {
        Command::Watch { follow } => run_watch(&config, follow.as_deref()).await,
        Command::Live => run_live(&config).await,
    }
}

async fn run_watch(config: &RelayConfig, follow: Option<&str>) -> Result<(), CliError> {
    let api = Arc::new(HttpApi::new(config)?);
    let mut session = DashboardSession::new(config, api.clone(), api, Arc::new(WsConnector));
    if let Some(bus_id) = follow {
        session.follow(bus_id);
    }

    tracing::info!(base_url = %config.api_base_url, role = %config.role, "busrelay watching");
    session
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}

async fn run_live(config: &RelayConfig) -> Result<(), CliError> {
    let api = HttpApi::new(config)?;
    let buses = api.fetch_roster().await?;
    let live = live_ids(&LivenessPolicy::for_role(config.role), &buses, now_ms());
    let rendered = serde_json::to_string_pretty(&live)?;
    println!("{rendered}");
    Ok(())
}
