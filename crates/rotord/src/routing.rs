//! Routing guard - keep the LAN default route primary across rotations.
//!
//! The cellular interface only ever gets a second default route with a
//! strictly higher metric. Proxy traffic reaches it through a packet mark
//! (iptables owner match) and a policy table. Order matters: the primary
//! route is re-asserted before any cellular route is touched, so there is
//! no moment where cellular is the only default.

use crate::error::RouteError;
use crate::probe::is_cellular_interface;
use crate::shell::CommandRunner;
use async_trait::async_trait;
use rotor_common::RoutingConfig;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Metric gap between the primary route and the cellular route
const METRIC_GAP: u32 = 100;
const RULE_PRIORITY: &str = "1001";

/// One `default` route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub via: Option<Ipv4Addr>,
    pub dev: String,
    pub metric: u32,
}

impl DefaultRoute {
    /// `ip route` arguments after `default`
    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(via) = self.via {
            args.push("via".to_string());
            args.push(via.to_string());
        }
        args.push("dev".to_string());
        args.push(self.dev.clone());
        args.push("metric".to_string());
        args.push(self.metric.to_string());
        args
    }
}

/// Parse `ip -4 route show default`
pub fn parse_default_routes(output: &str) -> Result<Vec<DefaultRoute>, RouteError> {
    let mut routes = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            continue;
        }

        let value = |key: &str| {
            tokens
                .iter()
                .position(|t| *t == key)
                .and_then(|i| tokens.get(i + 1))
                .copied()
        };

        let dev = value("dev").ok_or_else(|| RouteError::Parse(line.to_string()))?;
        let via = match value("via") {
            Some(gw) => Some(
                gw.parse()
                    .map_err(|_| RouteError::Parse(line.to_string()))?,
            ),
            None => None,
        };
        let metric = match value("metric") {
            Some(m) => m.parse().map_err(|_| RouteError::Parse(line.to_string()))?,
            None => 0,
        };

        routes.push(DefaultRoute {
            via,
            dev: dev.to_string(),
            metric,
        });
    }
    Ok(routes)
}

/// Lowest-metric non-cellular default route (restricted to `lan` when set)
pub fn pick_primary(routes: &[DefaultRoute], lan: Option<&str>) -> Option<DefaultRoute> {
    routes
        .iter()
        .filter(|r| !is_cellular_interface(&r.dev))
        .filter(|r| lan.map_or(true, |lan| r.dev == lan))
        .min_by_key(|r| r.metric)
        .cloned()
}

/// Metric for the cellular default route
pub fn cellular_metric(configured: u32, primary: Option<&DefaultRoute>) -> u32 {
    match primary {
        Some(p) => configured.max(p.metric.saturating_add(METRIC_GAP)),
        None => configured,
    }
}

/// Cellular default that would win over `primary`
fn outranks(route: &DefaultRoute, primary: &DefaultRoute) -> bool {
    route.dev != primary.dev && is_cellular_interface(&route.dev) && route.metric <= primary.metric
}

#[async_trait]
pub trait RouteGuard: Send + Sync {
    /// Snapshot the primary LAN route before a rotation
    async fn capture_primary(&self) -> Option<DefaultRoute>;

    /// After bring-up: re-assert `primary`, then add `cellular` as the
    /// secondary default and maintain the policy routing for proxy traffic
    async fn secure(
        &self,
        cellular: &str,
        primary: Option<&DefaultRoute>,
    ) -> Result<(), RouteError>;

    /// Rotation ended without a usable cellular link: re-assert `primary`
    /// and drop any cellular default that would outrank it
    async fn preserve_primary(&self, primary: &DefaultRoute) -> Result<(), RouteError>;
}

/// Guard backed by `ip` and `iptables`
pub struct IpRouteGuard {
    runner: Arc<dyn CommandRunner>,
    config: RoutingConfig,
    timeout: Duration,
}

impl IpRouteGuard {
    pub fn new(runner: Arc<dyn CommandRunner>, config: RoutingConfig, timeout: Duration) -> Self {
        Self {
            runner,
            config,
            timeout,
        }
    }

    async fn ip(&self, args: &[&str]) -> Result<String, RouteError> {
        Ok(self.runner.run_checked("ip", args, self.timeout).await?.stdout)
    }

    async fn default_routes(&self) -> Result<Vec<DefaultRoute>, RouteError> {
        let output = self.ip(&["-4", "route", "show", "default"]).await?;
        parse_default_routes(&output)
    }

    async fn route_cmd(&self, verb: &str, route: &DefaultRoute, table: Option<&str>) -> Result<(), RouteError> {
        let tail = route.args();
        let mut args: Vec<&str> = vec!["route", verb, "default"];
        args.extend(tail.iter().map(String::as_str));
        if let Some(table) = table {
            args.push("table");
            args.push(table);
        }
        self.ip(&args).await?;
        Ok(())
    }

    /// Table default, fwmark rule and mangle mark, each only if missing
    async fn ensure_policy(&self, cellular: &DefaultRoute) -> Result<(), RouteError> {
        let table = self.config.table_id.to_string();
        let mut table_route = cellular.clone();
        table_route.metric = 0;
        self.route_cmd("replace", &table_route, Some(&table)).await?;

        let mark = format!("0x{:x}", self.config.fwmark);
        let rules = self.ip(&["rule", "show"]).await?;
        let has_rule = rules.lines().any(|line| {
            line.contains(&format!("fwmark {}", mark))
                && (line.contains(&format!("lookup {}", table))
                    || line.contains(&format!("lookup {}", self.config.table_name)))
        });
        if !has_rule {
            info!("  Adding ip rule fwmark {} -> table {}", mark, table);
            self.ip(&["rule", "add", "fwmark", &mark, "lookup", &table, "priority", RULE_PRIORITY])
                .await?;
        }

        let set_mark = self.config.fwmark.to_string();
        let rule_spec = [
            "-t",
            "mangle",
            "OUTPUT",
            "-m",
            "owner",
            "--uid-owner",
            self.config.proxy_user.as_str(),
            "-j",
            "MARK",
            "--set-mark",
            set_mark.as_str(),
        ];
        let with_verb = |verb: &'static str| {
            let mut args: Vec<&str> = vec![rule_spec[0], rule_spec[1], verb];
            args.extend_from_slice(&rule_spec[2..]);
            args
        };

        let check = self.runner.run("iptables", &with_verb("-C"), self.timeout).await?;
        if !check.success() {
            info!("  Adding mangle mark for user {}", self.config.proxy_user);
            self.runner
                .run_checked("iptables", &with_verb("-A"), self.timeout)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RouteGuard for IpRouteGuard {
    async fn capture_primary(&self) -> Option<DefaultRoute> {
        match self.default_routes().await {
            Ok(routes) => pick_primary(&routes, self.config.lan_interface.as_deref()),
            Err(e) => {
                warn!("  Could not read default routes: {}", e);
                None
            }
        }
    }

    async fn secure(
        &self,
        cellular: &str,
        primary: Option<&DefaultRoute>,
    ) -> Result<(), RouteError> {
        if let Some(primary) = primary {
            self.route_cmd("replace", primary, None).await?;
        } else {
            warn!("  No LAN default route captured; cellular route is the only default");
        }

        let existing: Vec<DefaultRoute> = self
            .default_routes()
            .await?
            .into_iter()
            .filter(|r| r.dev == cellular)
            .collect();
        let metric = cellular_metric(self.config.cellular_metric, primary);
        let wanted = DefaultRoute {
            via: existing.iter().find_map(|r| r.via),
            dev: cellular.to_string(),
            metric,
        };

        debug!("  Cellular default via {} metric {}", cellular, metric);
        self.route_cmd("replace", &wanted, None).await?;

        for stale in existing.iter().filter(|r| r.metric != metric) {
            debug!("  Removing cellular default metric {}", stale.metric);
            self.route_cmd("del", stale, None).await?;
        }

        if let Some(primary) = primary {
            let routes = self.default_routes().await?;
            let lowest = routes.iter().min_by_key(|r| r.metric);
            if lowest.map(|r| r.dev.as_str()) != Some(primary.dev.as_str()) {
                error!("  Primary route on {} is no longer lowest metric", primary.dev);
            }
        }

        if self.config.manage_policy {
            self.ensure_policy(&wanted).await?;
        }
        Ok(())
    }

    async fn preserve_primary(&self, primary: &DefaultRoute) -> Result<(), RouteError> {
        self.route_cmd("replace", primary, None).await?;

        let outranking: Vec<DefaultRoute> = self
            .default_routes()
            .await?
            .into_iter()
            .filter(|r| outranks(r, primary))
            .collect();
        for route in &outranking {
            warn!(
                "  Removing cellular default on {} (metric {}) above {}",
                route.dev, route.metric, primary.dev
            );
            self.route_cmd("del", route, None).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Fake route guard (testing)
// ============================================================================

/// In-memory route table that applies the same ordering rules
#[derive(Clone)]
pub struct FakeRouteGuard {
    routes: Arc<Mutex<Vec<DefaultRoute>>>,
    cellular_metric: u32,
    secured: Arc<Mutex<Vec<String>>>,
}

impl FakeRouteGuard {
    pub fn new(routes: Vec<DefaultRoute>) -> Self {
        Self {
            routes: Arc::new(Mutex::new(routes)),
            cellular_metric: 700,
            secured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn routes(&self) -> Vec<DefaultRoute> {
        self.routes.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// What a DHCP client does on bring-up: a cellular default at metric 0
    pub fn hijack(&self, dev: &str) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(DefaultRoute {
                via: None,
                dev: dev.to_string(),
                metric: 0,
            });
        }
    }

    pub fn secured(&self) -> Vec<String> {
        self.secured.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn replace(routes: &mut Vec<DefaultRoute>, route: &DefaultRoute) {
        routes.retain(|r| !(r.dev == route.dev && r.metric == route.metric));
        routes.push(route.clone());
    }
}

#[async_trait]
impl RouteGuard for FakeRouteGuard {
    async fn capture_primary(&self) -> Option<DefaultRoute> {
        pick_primary(&self.routes(), None)
    }

    async fn secure(
        &self,
        cellular: &str,
        primary: Option<&DefaultRoute>,
    ) -> Result<(), RouteError> {
        if let Ok(mut secured) = self.secured.lock() {
            secured.push(cellular.to_string());
        }
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| RouteError::Parse("poisoned".to_string()))?;
        if let Some(primary) = primary {
            Self::replace(&mut routes, primary);
        }
        let metric = cellular_metric(self.cellular_metric, primary);
        Self::replace(
            &mut routes,
            &DefaultRoute {
                via: None,
                dev: cellular.to_string(),
                metric,
            },
        );
        routes.retain(|r| r.dev != cellular || r.metric == metric);
        Ok(())
    }

    async fn preserve_primary(&self, primary: &DefaultRoute) -> Result<(), RouteError> {
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| RouteError::Parse("poisoned".to_string()))?;
        Self::replace(&mut routes, primary);
        routes.retain(|r| !outranks(r, primary));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::FakeRunner;

    const ROUTES: &str = "\
default via 192.168.1.1 dev wlan0 proto dhcp src 192.168.1.37 metric 600
default via 192.168.225.1 dev usb0 proto dhcp src 192.168.225.33 metric 0
default dev ppp0 scope link
";

    fn lan() -> DefaultRoute {
        DefaultRoute {
            via: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dev: "wlan0".to_string(),
            metric: 600,
        }
    }

    #[test]
    fn test_parse_default_routes() {
        let routes = parse_default_routes(ROUTES).unwrap();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0], lan());
        assert_eq!(routes[2].via, None);
        assert_eq!(routes[2].metric, 0);
        assert!(parse_default_routes("default via nonsense dev x").is_err());
    }

    #[test]
    fn test_pick_primary_skips_cellular() {
        let routes = parse_default_routes(ROUTES).unwrap();
        assert_eq!(pick_primary(&routes, None), Some(lan()));
        assert_eq!(pick_primary(&routes, Some("eth0")), None);
    }

    #[test]
    fn test_cellular_metric_stays_above_primary() {
        assert_eq!(cellular_metric(700, Some(&lan())), 700);
        let high = DefaultRoute {
            metric: 650,
            ..lan()
        };
        assert_eq!(cellular_metric(700, Some(&high)), 750);
        assert_eq!(cellular_metric(700, None), 700);
    }

    #[tokio::test]
    async fn test_secure_orders_primary_first() {
        let runner = FakeRunner::new();
        runner.respond("ip -4 route show default", ROUTES);
        runner.respond("ip rule show", "0:\tfrom all lookup local\n32766:\tfrom all lookup main\n");
        runner.fail("iptables -t mangle -C", 1, "iptables: Bad rule");
        let guard = IpRouteGuard::new(
            Arc::new(runner.clone()),
            RoutingConfig::default(),
            Duration::from_secs(5),
        );

        guard.secure("usb0", Some(&lan())).await.unwrap();
        let calls = runner.calls();

        let primary = runner
            .position("ip route replace default via 192.168.1.1 dev wlan0 metric 600")
            .unwrap();
        let cell = runner
            .position("ip route replace default via 192.168.225.1 dev usb0 metric 700")
            .unwrap();
        let del = runner
            .position("ip route del default via 192.168.225.1 dev usb0 metric 0")
            .unwrap();
        assert!(primary < cell && cell < del);
        assert!(calls.iter().any(|c| c == "ip route replace default via 192.168.225.1 dev usb0 metric 0 table 101"));
        assert!(calls.iter().any(|c| c == "ip rule add fwmark 0x1 lookup 101 priority 1001"));
        assert!(calls.iter().any(|c| c.starts_with("iptables -t mangle -A OUTPUT -m owner --uid-owner proxy")));
    }

    #[tokio::test]
    async fn test_policy_not_duplicated() {
        let runner = FakeRunner::new();
        runner.respond("ip -4 route show default", ROUTES);
        runner.respond("ip rule show", "1001:\tfrom all fwmark 0x1 lookup rndis\n");
        let guard = IpRouteGuard::new(
            Arc::new(runner.clone()),
            RoutingConfig::default(),
            Duration::from_secs(5),
        );

        guard.secure("ppp0", Some(&lan())).await.unwrap();
        assert!(runner.position("ip rule add").is_none());
        assert!(runner.position("iptables -t mangle -A").is_none());
    }

    #[tokio::test]
    async fn test_fake_guard_keeps_primary_lowest() {
        let guard = FakeRouteGuard::new(vec![lan()]);
        let primary = guard.capture_primary().await;
        guard.hijack("usb0");
        guard.secure("usb0", primary.as_ref()).await.unwrap();

        let routes = guard.routes();
        let lowest = routes.iter().min_by_key(|r| r.metric).unwrap();
        assert_eq!(lowest.dev, "wlan0");
        assert_eq!(routes.len(), 2);
    }

    #[tokio::test]
    async fn test_preserve_primary_drops_outranking_cellular() {
        let runner = FakeRunner::new();
        runner.respond("ip -4 route show default", ROUTES);
        let guard = IpRouteGuard::new(
            Arc::new(runner.clone()),
            RoutingConfig::default(),
            Duration::from_secs(5),
        );

        guard.preserve_primary(&lan()).await.unwrap();
        let calls = runner.calls();
        assert!(calls.iter().any(|c| c == "ip route del default via 192.168.225.1 dev usb0 metric 0"));
        assert!(calls.iter().any(|c| c == "ip route del default dev ppp0 metric 0"));
        assert!(!calls.iter().any(|c| c.starts_with("ip route del default via 192.168.1.1")));
    }

    #[tokio::test]
    async fn test_fake_preserve_after_failed_bring_up() {
        let guard = FakeRouteGuard::new(vec![lan()]);
        let primary = guard.capture_primary().await.unwrap();
        guard.hijack("usb0");
        guard.preserve_primary(&primary).await.unwrap();
        assert_eq!(guard.routes(), vec![lan()]);
    }
}
