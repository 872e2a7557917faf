//! Background health probing.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use log::{info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::balancer::Balancer;

/// Timeout for a single probe request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Periodically probes every upstream's `/health` endpoint and updates
/// its health flag. A 200 marks the upstream healthy; anything else,
/// including a transport error, marks it unhealthy.
pub struct HealthProber {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HealthProber {
    pub fn spawn(balancer: Arc<Balancer>, interval: Duration) -> HealthProber {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(balancer, interval, shutdown_rx));
        HealthProber { shutdown, task }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

async fn run(balancer: Arc<Balancer>, interval: Duration, mut shutdown: oneshot::Receiver<()>) {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            warn!("health prober failed to build client: {err}");
            return;
        }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => probe_all(&balancer, &client).await,
            _ = &mut shutdown => break,
        }
    }
}

async fn probe_all(balancer: &Balancer, client: &reqwest::Client) {
    for (index, addr, url) in balancer.probe_targets() {
        let healthy = match client.get(url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(err) => {
                info!("health probe of {addr} failed: {err}");
                false
            }
        };
        balancer.set_health(index, healthy);
    }
}
