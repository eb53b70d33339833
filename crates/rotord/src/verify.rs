//! Public IP verification through the proxy's own listener.
//!
//! Asking an echo service directly from the host would report the LAN
//! egress. Going through the local proxy measures the cellular egress
//! that proxy clients actually see.

use async_trait::async_trait;
use rotor_common::RotorConfig;
use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// What a verification produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedIp {
    Public(Ipv4Addr),
    /// RFC1918, CGNAT, loopback or link-local: cellular routing is broken
    Private(Ipv4Addr),
    Unknown,
}

impl ObservedIp {
    pub fn classify(ip: Ipv4Addr) -> Self {
        if is_private(ip) {
            ObservedIp::Private(ip)
        } else {
            ObservedIp::Public(ip)
        }
    }

    pub fn public(&self) -> Option<Ipv4Addr> {
        match self {
            ObservedIp::Public(ip) => Some(*ip),
            _ => None,
        }
    }

    /// Address as reported, if any
    pub fn address(&self) -> Option<String> {
        match self {
            ObservedIp::Public(ip) | ObservedIp::Private(ip) => Some(ip.to_string()),
            ObservedIp::Unknown => None,
        }
    }
}

impl fmt::Display for ObservedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservedIp::Public(ip) => write!(f, "{}", ip),
            ObservedIp::Private(ip) => write!(f, "{} (private)", ip),
            ObservedIp::Unknown => f.write_str("unknown"),
        }
    }
}

/// Addresses that can never be a carrier-assigned public IP
pub fn is_private(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 shared address space (CGNAT)
        || (a == 100 && (64..=127).contains(&b))
}

#[async_trait]
pub trait PublicIpSource: Send + Sync {
    async fn observe(&self) -> ObservedIp;
}

/// Queries plain-text echo endpoints through the local HTTP proxy
pub struct ProxyIpSource {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl ProxyIpSource {
    pub fn from_config(config: &RotorConfig) -> Result<Self, reqwest::Error> {
        let proxy_url = format!("http://{}:{}", config.proxy_host(), config.proxy.http_port);
        let mut proxy = reqwest::Proxy::all(&proxy_url)?;
        if config.proxy.auth_enabled && !config.proxy.user.is_empty() {
            proxy = proxy.basic_auth(&config.proxy.user, &config.proxy.password);
        }

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(Duration::from_secs(config.verify.timeout))
            .user_agent(concat!("rotord/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            urls: config.verify.urls.clone(),
        })
    }

    async fn fetch(&self, url: &str) -> Option<Ipv4Addr> {
        let response = match self.client.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("  {} answered {}", url, r.status());
                return None;
            }
            Err(e) => {
                debug!("  {} failed: {}", url, e);
                return None;
            }
        };
        let body = response.text().await.ok()?;
        body.trim().parse().ok()
    }
}

#[async_trait]
impl PublicIpSource for ProxyIpSource {
    async fn observe(&self) -> ObservedIp {
        for url in &self.urls {
            if let Some(ip) = self.fetch(url).await {
                let observed = ObservedIp::classify(ip);
                if let ObservedIp::Private(ip) = observed {
                    warn!("  Proxy egress is {} - cellular routing broken, falling back to LAN", ip);
                }
                return observed;
            }
        }
        warn!("  Public IP unknown: no echo endpoint answered through the proxy");
        ObservedIp::Unknown
    }
}

// ============================================================================
// Fake IP source (testing)
// ============================================================================

/// Observations are consumed in order; the last one repeats
#[derive(Clone)]
pub struct FakeIpSource {
    queue: Arc<Mutex<VecDeque<ObservedIp>>>,
    calls: Arc<Mutex<u32>>,
}

impl FakeIpSource {
    pub fn new(initial: ObservedIp) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::from([initial]))),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn public(ip: &str) -> Self {
        Self::new(parse_observed(ip))
    }

    /// Queue the next observation
    pub fn then(&self, ip: &str) -> &Self {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(parse_observed(ip));
        }
        self
    }

    /// Replace everything with a single sticky observation
    pub fn set(&self, ip: &str) {
        if let Ok(mut q) = self.queue.lock() {
            q.clear();
            q.push_back(parse_observed(ip));
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

/// `"unknown"` or an IPv4 literal
fn parse_observed(ip: &str) -> ObservedIp {
    ip.parse().map(ObservedIp::classify).unwrap_or(ObservedIp::Unknown)
}

#[async_trait]
impl PublicIpSource for FakeIpSource {
    async fn observe(&self) -> ObservedIp {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        let mut queue = match self.queue.lock() {
            Ok(q) => q,
            Err(_) => return ObservedIp::Unknown,
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(ObservedIp::Unknown)
        } else {
            queue.front().copied().unwrap_or(ObservedIp::Unknown)
        }
    }
}
