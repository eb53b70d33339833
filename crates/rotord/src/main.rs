//! rotord - cellular modem IP rotation daemon

use anyhow::{Context, Result};
use clap::Parser;
use rotor_common::RotorConfig;
use rotord::config::{ConfigSource, FileConfigSource};
use rotord::drivers::ppp::PppSettings;
use rotord::drivers::qmi::QmiSettings;
use rotord::drivers::{DriverContext, DriverSet};
use rotord::history::HistoryStore;
use rotord::modem::{AtPort, ImeiVault, SerialAtPort};
use rotord::notifier::DiscordNotifier;
use rotord::probe::{InterfaceProbe, IpProbe};
use rotord::reset::ModemReset;
use rotord::routing::IpRouteGuard;
use rotord::scheduler::AutoRotation;
use rotord::shell::{CommandRunner, RealRunner};
use rotord::verify::ProxyIpSource;
use rotord::{server, AppState, Collaborators, Orchestrator, OrchestratorState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rotord", version, about = "Cellular modem IP rotation daemon")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long, env = "ROTOR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("[BOOT] rotord v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.unwrap_or_else(RotorConfig::default_path);
    let source = Arc::new(
        FileConfigSource::open(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?,
    );
    let config = source.current();
    info!("[BOOT] Config loaded from {}", config_path.display());

    if let Err(e) = std::fs::create_dir_all(&config.state_dir) {
        warn!("[BOOT] Could not create state dir {}: {}", config.state_dir.display(), e);
    }
    let paths = config.state_paths();

    let cancel = CancellationToken::new();
    let command_timeout = Duration::from_secs(config.system.command_timeout);
    let at_timeout = Duration::from_secs(config.modem.timeout);

    let runner: Arc<dyn CommandRunner> = Arc::new(RealRunner::new(config.system.sudo));
    let probe: Arc<dyn InterfaceProbe> = Arc::new(IpProbe::new(runner.clone()));
    let at: Arc<dyn AtPort> = Arc::new(SerialAtPort::new(config.modem.port.clone()));
    let vault = ImeiVault::new(&paths.original_imei);

    let ctx = DriverContext {
        runner: runner.clone(),
        probe: probe.clone(),
        at: at.clone(),
        command_timeout,
        at_timeout,
        dhcp_client: config.modem.dhcp_client.clone(),
        cancel: cancel.clone(),
    };
    let drivers = DriverSet::standard(
        ctx,
        QmiSettings::new(&config.modem.qmi_device),
        PppSettings {
            peer: config.modem.ppp_peer.clone(),
            peers_dir: config.modem.peers_dir.clone(),
            chat_dir: config.modem.chat_dir.clone(),
            tty: config.modem.port.clone(),
        },
    );
    info!("[BOOT] Transport drivers ready (mode preference: {:?})", config.modem.mode);

    let reset = Arc::new(ModemReset::new(
        at.clone(),
        runner.clone(),
        vault.clone(),
        at_timeout,
        command_timeout,
        cancel.clone(),
    ));
    let routes = Arc::new(IpRouteGuard::new(
        runner.clone(),
        config.routing.clone(),
        command_timeout,
    ));
    let ip_source = Arc::new(
        ProxyIpSource::from_config(&config).context("Failed to build proxy HTTP client")?,
    );
    let history = Arc::new(HistoryStore::new(&paths.history));
    let notifier = DiscordNotifier::from_config(&config.discord, paths.notification_message_id.clone());
    info!("[BOOT] History at {}", paths.history.display());

    let orchestrator = Arc::new(Orchestrator::new(
        Collaborators {
            config: source,
            probe,
            drivers,
            reset,
            routes,
            ip_source,
            history,
            notifier,
        },
        OrchestratorState::new(),
        cancel.clone(),
    ));

    let auto = AutoRotation::new(orchestrator.clone(), cancel.clone());
    auto.start_from_config();

    let addr: SocketAddr = format!("{}:{}", config.api.bind, config.api.port)
        .parse()
        .with_context(|| format!("Invalid API bind address {}:{}", config.api.bind, config.api.port))?;

    spawn_signal_handler(cancel.clone());

    let state = AppState {
        orchestrator,
        auto,
        at,
        imei: vault,
        at_timeout,
    };

    info!("[READY] rotord operational");
    server::run(state, addr, cancel).await.context("Control API error")?;

    info!("Shutting down gracefully");
    Ok(())
}

/// Cancel everything on SIGINT or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Could not install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = terminate => info!("SIGTERM received"),
        }
        cancel.cancel();
    });
}
