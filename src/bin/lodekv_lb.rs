use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use lodekv::balancer::health::HealthProber;
use lodekv::balancer::{proxy, Balancer, BalancerConfig};

#[derive(Parser, Debug)]
#[command(name = "lodekv-lb")]
#[command(about = "Least-connections HTTP load balancer")]
struct Args {
    /// Upstream host:port addresses, in dispatch-preference order
    #[arg(required = true)]
    upstreams: Vec<String>,

    /// Attach an lb-from header naming the chosen upstream
    #[arg(long)]
    trace: bool,

    /// Listen port (BALANCER_ADDR overrides the full bind address)
    #[arg(long, default_value_t = 8090)]
    port: u16,

    /// Per-request upstream timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout_sec: u64,

    /// Interval between health probe rounds, in seconds
    #[arg(long, default_value_t = 10)]
    health_interval_sec: u64,

    /// Talk to upstreams over https
    #[arg(long)]
    https: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = BalancerConfig {
        upstreams: args.upstreams,
        timeout: Duration::from_secs(args.timeout_sec),
        health_interval: Duration::from_secs(args.health_interval_sec),
        trace: args.trace,
        https: args.https,
    };
    let balancer = Balancer::new(&config).context("invalid upstream address")?;
    let prober = HealthProber::spawn(balancer.clone(), config.health_interval);

    let addr = std::env::var("BALANCER_ADDR").unwrap_or_else(|_| format!("0.0.0.0:{}", args.port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        "balancing {} upstreams on {}",
        config.upstreams.len(),
        listener.local_addr()?
    );

    axum::serve(listener, proxy::router(balancer))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")?;

    prober.stop().await;
    Ok(())
}
