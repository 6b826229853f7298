//! Command-line configuration for the server binary.

use clap::Parser;
use shared::{
    ARBITRATION_WINDOW_MS, DISCOVERY_POLL_INTERVAL_MS, LEAGUE_JITTER_MS, LEAGUE_THRESHOLD_BASE_MS,
    SETTLE_PERIOD_MS,
};
use std::ops::Range;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address to bind all listeners to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port of the route endpoint that hands out worker ports
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// First port of the worker port range
    #[arg(long, default_value = "8100")]
    pub worker_port: u16,

    /// Number of workers to start
    #[arg(short, long, default_value = "4")]
    pub workers: u16,

    /// Workers that must be registered before any client is routed
    #[arg(short, long, default_value = "4")]
    pub min_available_workers: usize,

    /// Port the drop server accepts dispatch sockets on
    #[arg(short, long, default_value = "8090")]
    pub dispatch_port: u16,

    #[arg(long, default_value_t = ARBITRATION_WINDOW_MS)]
    pub arbitration_window_ms: u64,

    #[arg(long, default_value_t = SETTLE_PERIOD_MS)]
    pub settle_period_ms: u64,

    /// Base league threshold; claims faster than this plus jitter are league claims
    #[arg(long, default_value_t = LEAGUE_THRESHOLD_BASE_MS)]
    pub league_threshold_ms: u64,

    #[arg(long, default_value_t = LEAGUE_JITTER_MS)]
    pub league_jitter_ms: u64,

    #[arg(long, default_value_t = DISCOVERY_POLL_INTERVAL_MS)]
    pub discovery_interval_ms: u64,

    /// Seconds between worker liveness checks
    #[arg(long, default_value = "5")]
    pub refresh_interval_secs: u64,

    /// Schedule a demo drop every N seconds (0 disables)
    #[arg(long, default_value = "0")]
    pub demo_drop_interval_secs: u64,
}

impl Config {
    pub fn worker_ports(&self) -> Range<u16> {
        self.worker_port..self.worker_port.saturating_add(self.workers)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            discovery_interval: Duration::from_millis(self.discovery_interval_ms),
            arbitration_window: Duration::from_millis(self.arbitration_window_ms),
            settle_period: Duration::from_millis(self.settle_period_ms),
            league_threshold_ms: self.league_threshold_ms,
            league_jitter_ms: self.league_jitter_ms,
        }
    }
}

/// Timing and policy knobs of the drop engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub discovery_interval: Duration,
    pub arbitration_window: Duration,
    pub settle_period: Duration,
    pub league_threshold_ms: u64,
    pub league_jitter_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_millis(DISCOVERY_POLL_INTERVAL_MS),
            arbitration_window: Duration::from_millis(ARBITRATION_WINDOW_MS),
            settle_period: Duration::from_millis(SETTLE_PERIOD_MS),
            league_threshold_ms: LEAGUE_THRESHOLD_BASE_MS,
            league_jitter_ms: LEAGUE_JITTER_MS,
        }
    }
}
