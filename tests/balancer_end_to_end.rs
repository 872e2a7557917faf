use std::collections::HashMap;
use std::time::Duration;

use axum::routing::get;
use axum::Router;

use lodekv::balancer::health::HealthProber;
use lodekv::balancer::{proxy, Balancer, BalancerConfig};

/// Serve a stub upstream on an ephemeral port: `/health` answers 200 and
/// every other request returns the upstream's name after a short delay,
/// keeping connections in flight long enough for counts to matter.
async fn spawn_upstream(name: &'static str) -> String {
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .fallback(move || async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            name
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    format!("127.0.0.1:{}", addr.port())
}

async fn spawn_balancer(config: &BalancerConfig) -> (String, HealthProber) {
    let balancer = Balancer::new(config).expect("balancer");
    let prober = HealthProber::spawn(balancer.clone(), config.health_interval);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind balancer");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, proxy::router(balancer))
            .await
            .expect("serve balancer");
    });
    (format!("127.0.0.1:{}", addr.port()), prober)
}

#[tokio::test]
async fn spreads_load_across_healthy_upstreams() {
    let upstreams = vec![
        spawn_upstream("alpha").await,
        spawn_upstream("bravo").await,
        spawn_upstream("charlie").await,
    ];
    let config = BalancerConfig {
        upstreams: upstreams.clone(),
        timeout: Duration::from_secs(5),
        health_interval: Duration::from_secs(1),
        trace: true,
        https: false,
    };
    let (addr, prober) = spawn_balancer(&config).await;

    let mut clients = Vec::new();
    for client_id in 0..6 {
        let addr = addr.clone();
        clients.push(tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut results = Vec::new();
            for n in 0..5 {
                let response = client
                    .get(format!("http://{addr}/work/{client_id}/{n}"))
                    .send()
                    .await;
                match response {
                    Ok(response) => {
                        let status = response.status();
                        let from = response
                            .headers()
                            .get("lb-from")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        results.push((status, from));
                    }
                    Err(_) => results.push((reqwest::StatusCode::BAD_GATEWAY, None)),
                }
            }
            results
        }));
    }

    let mut successes = 0;
    let mut per_upstream: HashMap<String, u64> = HashMap::new();
    for client in clients {
        for (status, from) in client.await.expect("client task") {
            if status == reqwest::StatusCode::OK {
                successes += 1;
            }
            if let Some(from) = from {
                assert!(
                    upstreams.contains(&from),
                    "lb-from header {from} is not a configured upstream"
                );
                *per_upstream.entry(from).or_default() += 1;
            }
        }
    }

    assert!(successes >= 23, "only {successes}/30 requests succeeded");

    if per_upstream.len() == upstreams.len() {
        let max = per_upstream.values().max().copied().unwrap_or(0);
        let min = per_upstream.values().min().copied().unwrap_or(0);
        assert!(
            max <= 3 * min,
            "unbalanced dispatch: max {max} vs min {min} ({per_upstream:?})"
        );
    }

    prober.stop().await;
}

#[tokio::test]
async fn no_upstreams_means_service_unavailable() {
    let config = BalancerConfig {
        upstreams: Vec::new(),
        timeout: Duration::from_secs(1),
        health_interval: Duration::from_secs(1),
        trace: false,
        https: false,
    };
    let (addr, prober) = spawn_balancer(&config).await;

    let response = reqwest::get(format!("http://{addr}/anything"))
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    prober.stop().await;
}

#[tokio::test]
async fn dead_upstream_is_probed_out() {
    // Reserve a port and release it so the address refuses connections.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        format!("127.0.0.1:{}", listener.local_addr().expect("addr").port())
    };
    let config = BalancerConfig {
        upstreams: vec![dead],
        timeout: Duration::from_secs(1),
        health_interval: Duration::from_millis(50),
        trace: false,
        https: false,
    };
    let (addr, prober) = spawn_balancer(&config).await;

    // Give the prober a few rounds to notice.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let response = reqwest::get(format!("http://{addr}/anything"))
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    prober.stop().await;
}
