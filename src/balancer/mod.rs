//! Least-connections HTTP load balancer.
//!
//! Every request is dispatched to the healthy upstream with the fewest
//! in-flight connections, ties broken by configuration order. A background
//! prober flips each upstream's health flag based on its `/health`
//! endpoint.

pub mod health;
pub mod proxy;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use url::Url;

/// Balancer configuration.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Upstream `host:port` addresses, in dispatch-preference order.
    pub upstreams: Vec<String>,
    /// Per-request timeout for forwarded requests.
    pub timeout: Duration,
    /// Interval between health probe rounds.
    pub health_interval: Duration,
    /// Attach an `lb-from` header naming the chosen upstream.
    pub trace: bool,
    /// Talk to upstreams over https instead of http.
    pub https: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(10),
            trace: false,
            https: false,
        }
    }
}

/// One backend server.
pub struct Upstream {
    /// `host:port` as configured; also the `lb-from` header value.
    pub addr: String,
    /// Base URL requests are rewritten onto.
    pub base: Url,
    /// Flipped by the health prober; guarded by the server-list lock.
    pub healthy: bool,
    /// In-flight request count.
    pub active_conns: Arc<AtomicI64>,
}

impl Upstream {
    pub fn new(addr: &str, https: bool) -> anyhow::Result<Upstream> {
        let scheme = if https { "https" } else { "http" };
        let base = Url::parse(&format!("{scheme}://{addr}/"))?;
        Ok(Upstream {
            addr: addr.to_string(),
            base,
            healthy: true,
            active_conns: Arc::new(AtomicI64::new(0)),
        })
    }
}

/// Pick the healthy upstream with the fewest active connections.
///
/// Ties go to the first upstream in list order. Returns `None` when no
/// healthy upstream exists.
pub fn select(upstreams: &[Upstream]) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (index, upstream) in upstreams.iter().enumerate() {
        if !upstream.healthy {
            continue;
        }
        let conns = upstream.active_conns.load(Ordering::Relaxed);
        match best {
            None => best = Some((index, conns)),
            Some((_, best_conns)) if conns < best_conns => best = Some((index, conns)),
            _ => {}
        }
    }
    best.map(|(index, _)| index)
}

/// The chosen target of one dispatch.
pub(crate) struct Picked {
    pub addr: String,
    pub base: Url,
    pub active_conns: Arc<AtomicI64>,
}

pub struct Balancer {
    upstreams: RwLock<Vec<Upstream>>,
    client: reqwest::Client,
    trace: bool,
}

impl Balancer {
    pub fn new(config: &BalancerConfig) -> anyhow::Result<Arc<Balancer>> {
        let mut upstreams = Vec::with_capacity(config.upstreams.len());
        for addr in &config.upstreams {
            upstreams.push(Upstream::new(addr, config.https)?);
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Arc::new(Balancer {
            upstreams: RwLock::new(upstreams),
            client,
            trace: config.trace,
        }))
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn trace(&self) -> bool {
        self.trace
    }

    /// Select an upstream for dispatch under the read lock.
    pub(crate) fn pick(&self) -> Option<Picked> {
        let upstreams = self.upstreams.read().unwrap_or_else(|e| e.into_inner());
        let index = select(&upstreams)?;
        let upstream = &upstreams[index];
        Some(Picked {
            addr: upstream.addr.clone(),
            base: upstream.base.clone(),
            active_conns: Arc::clone(&upstream.active_conns),
        })
    }

    /// Probe targets: index, address, and health URL of every upstream.
    pub(crate) fn probe_targets(&self) -> Vec<(usize, String, Url)> {
        let upstreams = self.upstreams.read().unwrap_or_else(|e| e.into_inner());
        upstreams
            .iter()
            .enumerate()
            .map(|(index, upstream)| {
                let health = upstream.base.join("health").expect("valid base url");
                (index, upstream.addr.clone(), health)
            })
            .collect()
    }

    pub(crate) fn set_health(&self, index: usize, healthy: bool) {
        let mut upstreams = self.upstreams.write().unwrap_or_else(|e| e.into_inner());
        if let Some(upstream) = upstreams.get_mut(index) {
            upstream.healthy = healthy;
        }
    }
}
