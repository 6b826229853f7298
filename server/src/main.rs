use async_trait::async_trait;
use clap::Parser;
use log::{error, info};
use server::balancer::BalancerHandle;
use server::config::Config;
use server::coordination::Hub;
use server::coordinator::{serve_routes, spawn_refresh, Coordinator};
use server::dispatch::DropServer;
use server::drops::{DropEngine, ReportSink};
use server::store::{MemberStore, MemoryStore};
use server::worker::Worker;
use shared::{timestamp_ms, DropId};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Delay between scheduling a demo drop and the drop going live.
const DEMO_DROP_LEAD_MS: u64 = 2000;

/// Publishes drop reports to the log.
struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn publish(&self, drop_id: DropId, ranks: &[String]) {
        info!("Published report for drop {} ({} ranked claims)", drop_id, ranks.len());
    }
}

/// Starts the coordinator, drop engine, drop server and workers in one process.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let config = Config::parse();
    info!("Starting drop race server with {:?}", config);

    let (hub, hub_events) = Hub::new();
    let (engine_tx, engine_rx) = mpsc::unbounded_channel();
    let store = Arc::new(MemoryStore::new());
    let balancer = BalancerHandle::new(config.min_available_workers);

    let coordinator_handle = tokio::spawn(
        Coordinator::new(hub.clone(), hub_events, balancer.clone(), engine_tx).run(),
    );
    let refresh_handle = spawn_refresh(
        balancer.clone(),
        config.host.clone(),
        Duration::from_secs(config.refresh_interval_secs),
    );

    let engine = DropEngine::new(
        Arc::clone(&store),
        hub.clone(),
        engine_rx,
        config.engine_config(),
    )
    .with_report_sink(Arc::new(LogReportSink));
    let engine_handle = tokio::spawn(engine.run());

    let drop_server = DropServer::bind(&format!("{}:{}", config.host, config.dispatch_port)).await?;
    let drop_server_handle = tokio::spawn(drop_server.run(hub.connect().await));

    let members: Arc<dyn MemberStore> = store.clone();
    for port in config.worker_ports() {
        let worker = Worker::bind(&format!("{}:{}", config.host, port), Arc::clone(&members)).await?;
        tokio::spawn(worker.run(hub.connect().await));
    }

    let routes = TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    info!("Route endpoint listening on {}", routes.local_addr()?);
    let routes_handle = tokio::spawn(serve_routes(routes, balancer));

    if config.demo_drop_interval_secs > 0 {
        let store = Arc::clone(&store);
        let period = Duration::from_secs(config.demo_drop_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                store.schedule_drop(timestamp_ms() + DEMO_DROP_LEAD_MS, 0).await;
            }
        });
    }

    tokio::select! {
        result = coordinator_handle => {
            if let Err(e) = result {
                error!("Coordinator task panicked: {}", e);
            }
        }
        result = engine_handle => {
            if let Err(e) = result {
                error!("Drop engine task panicked: {}", e);
            }
        }
        result = drop_server_handle => {
            if let Err(e) = result {
                error!("Drop server task panicked: {}", e);
            }
        }
        result = routes_handle => {
            if let Err(e) = result {
                error!("Route endpoint task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    refresh_handle.abort();
    Ok(())
}
