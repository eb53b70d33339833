//! rotorctl - CLI client for the rotor daemon
//!
//! Talks to rotord's control API. The URL and token come from the same
//! config file the daemon reads unless overridden on the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rotor_common::{RotateStatus, RotorConfig};
use rotorctl::client::{self, ApiClient};
use rotorctl::{doctor, output};
use serde::Serialize;
use std::path::{Path, PathBuf};

const EXIT_FAILED: i32 = 1;
const EXIT_BUSY: i32 = 2;

#[derive(Parser)]
#[command(name = "rotorctl")]
#[command(about = "Control the rotor cellular IP rotation daemon", long_about = None)]
#[command(version = rotor_common::VERSION)]
struct Cli {
    /// Path to config.yaml
    #[arg(short, long, global = true, env = "ROTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Control API base URL (default: derived from the config)
    #[arg(long, global = true, env = "ROTOR_URL")]
    url: Option<String>,

    /// API token (default: api.token from the config)
    #[arg(long, global = true, env = "ROTOR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Print raw JSON instead of formatted output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current public IP and transport
    Status,

    /// Rotate the public IP now
    Rotate,

    /// Show recorded IP history
    History {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Push a status notification with the current IP
    Notify,

    /// Auto-rotation timer control
    Auto {
        #[command(subcommand)]
        action: AutoAction,
    },

    /// Show the daemon's effective config (secrets redacted)
    Config,

    /// Read the modem IMEI and compare it with the original
    Imei,

    /// Run local diagnostics
    Doctor,
}

#[derive(Subcommand, Clone, Copy)]
enum AutoAction {
    Status,
    Enable,
    Disable,
    Restart,
}

impl AutoAction {
    fn as_str(&self) -> &'static str {
        match self {
            AutoAction::Status => "status",
            AutoAction::Enable => "enable",
            AutoAction::Disable => "disable",
            AutoAction::Restart => "restart",
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            output::display_error(&format!("{:#}", e));
            std::process::exit(EXIT_FAILED);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = cli.config.clone().unwrap_or_else(RotorConfig::default_path);

    if let Commands::Doctor = cli.command {
        return Ok(doctor::run(&config_path, cli.url.as_deref(), cli.token.clone()).await);
    }

    let api = connect(&cli, &config_path)?;
    match cli.command {
        Commands::Status => {
            let status = api.status().await?;
            show(cli.json, &status, output::format_status)
        }
        Commands::Rotate => {
            if !cli.json {
                println!("Rotating via {} (this can take a few minutes)...", api.base_url());
            }
            let (_, result) = api.rotate().await?;
            show(cli.json, &result, output::format_rotate)?;
            Ok(match result.status {
                RotateStatus::Success => 0,
                RotateStatus::Busy => EXIT_BUSY,
                RotateStatus::Failed => EXIT_FAILED,
            })
        }
        Commands::History { limit } => {
            let history = api.history().await?;
            show(cli.json, &history, |h| output::format_history(h, limit))
        }
        Commands::Notify => {
            let reply = api.notify().await?;
            show(cli.json, &reply, |r| {
                format!("Notification sent (ip {})", r.ip.as_deref().unwrap_or("unknown"))
            })
        }
        Commands::Auto { action } => {
            let status = match action {
                AutoAction::Status => api.auto_status().await?,
                other => api.auto_action(other.as_str()).await?,
            };
            show(cli.json, &status, output::format_auto)
        }
        Commands::Config => {
            let config = api.config().await?;
            show(cli.json, &config, output::format_config)
        }
        Commands::Imei => {
            let status = api.imei().await?;
            show(cli.json, &status, output::format_imei)
        }
        Commands::Doctor => Ok(doctor::EXIT_OK),
    }
}

/// Client from flags, falling back to the config file
fn connect(cli: &Cli, config_path: &Path) -> Result<ApiClient> {
    let config = load_config(config_path)?;

    let url = match (&cli.url, &config) {
        (Some(url), _) => url.clone(),
        (None, Some(config)) => client::base_url(config),
        (None, None) => client::base_url(&RotorConfig::default()),
    };
    let token = cli
        .token
        .clone()
        .or_else(|| config.as_ref().map(|c| c.api.token.clone()));

    ApiClient::new(&url, token)
}

/// The config is optional here; a missing file just means defaults
fn load_config(path: &Path) -> Result<Option<RotorConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = RotorConfig::from_yaml_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(config))
}

fn show<T: Serialize>(json: bool, value: &T, format: impl Fn(&T) -> String) -> Result<i32> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", format(value));
    }
    Ok(0)
}
