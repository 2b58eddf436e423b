//! DDoS-mitigating load balancer
//!
//! This is the main entry point for the load balancer.
//! It loads the configuration, assembles the engine and starts the web server.

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::info;

use ddos_load_balancer::api::{self, AppState};
use ddos_load_balancer::config;
use ddos_load_balancer::core::Engine;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting DDoS load balancer...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    if let Some(listen) = &config.metrics.prometheus_listen {
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("Invalid Prometheus listen address {}", listen))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus exporter listening on {}", addr);
    }

    let engine = Arc::new(
        Engine::build(config.clone())
            .await
            .context("Failed to initialize the load balancer")?,
    );

    info!(
        "Balancing across {} backends ({} routing), rate limit {} requests per {}ms with a {}ms cooldown",
        config.backends.len(),
        config.routing.policy,
        config.rate_limit.points,
        config.rate_limit.duration_ms,
        config.rate_limit.block_duration_ms
    );
    for server in engine.pool().servers() {
        info!("  backend {} (weight {})", server.address(), server.weight());
    }

    let background = engine.spawn_background();

    let state = web::Data::new(AppState {
        engine: engine.clone(),
    });
    let bind = (config.server.host.clone(), config.server.port);
    info!("Listening on {}:{}", bind.0, bind.1);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::configure)
    })
    .bind(bind)?
    .run()
    .await?;

    info!("Shutting down");
    for handle in background {
        handle.abort();
    }
    engine.flush_metrics().await;

    Ok(())
}
