//! Shared fixture: an orchestrator wired entirely to fakes.

#![allow(dead_code)]

use axum::Router;
use rotor_common::{ConnectivityMode, ModePreference, RotorConfig};
use rotord::config::StaticConfigSource;
use rotord::drivers::{DriverSet, FakeDriver};
use rotord::history::HistoryStore;
use rotord::modem::{FakeAtPort, ImeiVault};
use rotord::notifier::RecordingNotifier;
use rotord::probe::{Detection, FakeProbe};
use rotord::reset::FakeDeepReset;
use rotord::routing::{DefaultRoute, FakeRouteGuard};
use rotord::scheduler::AutoRotation;
use rotord::verify::FakeIpSource;
use rotord::{server, AppState, Collaborators, Orchestrator, OrchestratorState};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const TOKEN: &str = "test-token-0123456789";

pub fn lan() -> DefaultRoute {
    DefaultRoute {
        via: Some(Ipv4Addr::new(192, 168, 1, 1)),
        dev: "wlan0".to_string(),
        metric: 600,
    }
}

/// Forced RNDIS, one attempt, no waits, no deep reset
pub fn test_config(state_dir: &Path) -> RotorConfig {
    let mut config = RotorConfig::default();
    config.api.token = TOKEN.to_string();
    config.state_dir = state_dir.to_path_buf();
    config.modem.mode = ModePreference::Rndis;
    config.modem.apn = "everywhere".to_string();
    config.rotation.teardown_wait = 0;
    config.rotation.restart_wait = 0;
    config.rotation.settle_wait = 0;
    config.rotation.deep_reset_wait = 0;
    config.rotation.max_attempts = 1;
    config.rotation.deep_reset_enabled = false;
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<StaticConfigSource>,
    pub probe: FakeProbe,
    pub rndis: FakeDriver,
    pub ppp: FakeDriver,
    pub reset: FakeDeepReset,
    pub routes: FakeRouteGuard,
    pub ip: FakeIpSource,
    pub notifier: RecordingNotifier,
    pub history: Arc<HistoryStore>,
    pub at: FakeAtPort,
    pub cancel: CancellationToken,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(configure: impl FnOnce(&mut RotorConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        configure(&mut config);
        let paths = config.state_paths();

        let config = Arc::new(StaticConfigSource::new(config));
        let probe = FakeProbe::new();
        probe.set(
            ConnectivityMode::Rndis,
            Detection::present("usb0", Some(Ipv4Addr::new(192, 168, 225, 33))),
        );
        let rndis = FakeDriver::new(ConnectivityMode::Rndis);
        let ppp = FakeDriver::new(ConnectivityMode::Ppp);
        let reset = FakeDeepReset::new();
        let routes = FakeRouteGuard::new(vec![lan()]);
        let ip = FakeIpSource::public("1.2.3.4");
        let notifier = RecordingNotifier::new();
        let history = Arc::new(HistoryStore::new(&paths.history));
        let cancel = CancellationToken::new();

        let orchestrator = Arc::new(Orchestrator::new(
            Collaborators {
                config: config.clone(),
                probe: Arc::new(probe.clone()),
                drivers: DriverSet::new()
                    .with(Arc::new(rndis.clone()))
                    .with(Arc::new(ppp.clone())),
                reset: Arc::new(reset.clone()),
                routes: Arc::new(routes.clone()),
                ip_source: Arc::new(ip.clone()),
                history: history.clone(),
                notifier: Arc::new(notifier.clone()),
            },
            OrchestratorState::new(),
            cancel.clone(),
        ));

        Self {
            dir,
            config,
            probe,
            rndis,
            ppp,
            reset,
            routes,
            ip,
            notifier,
            history,
            at: FakeAtPort::new(),
            cancel,
            orchestrator,
        }
    }

    /// Observations in order: the starting IP, then one per verification
    pub fn ips(&self, sequence: &[&str]) {
        let (first, rest) = sequence.split_first().unwrap();
        self.ip.set(first);
        for ip in rest {
            self.ip.then(ip);
        }
    }

    /// Bring-ups hijack the default route the way a DHCP client does
    pub fn hijack_on_bring_up(&self) {
        let routes = self.routes.clone();
        self.rndis.on_bring_up(move |_| routes.hijack("usb0"));
    }

    pub fn auto_rotation(&self) -> Arc<AutoRotation> {
        AutoRotation::new(self.orchestrator.clone(), self.cancel.clone())
    }

    pub fn router(&self) -> (Router, Arc<AutoRotation>) {
        let auto = self.auto_rotation();
        let state = AppState {
            orchestrator: self.orchestrator.clone(),
            auto: auto.clone(),
            at: Arc::new(self.at.clone()),
            imei: ImeiVault::new(self.dir.path().join("original_imei.txt")),
            at_timeout: Duration::from_secs(1),
        };
        (server::router(Arc::new(state)), auto)
    }
}

/// Yield until `check` holds; panics after a bounded number of rounds
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}
