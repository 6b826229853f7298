//! # Drop Race Client Library
//!
//! Headless client for the drop race. It asks the route endpoint for a
//! worker, logs in, joins a lobby and keeps a raw socket open to the drop
//! server. Every dispatch notice is answered with a claim through the worker,
//! and the worker's drop results are collected per drop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Claimer, ClaimerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut claimer = Claimer::new(ClaimerConfig {
//!         route_addr: "127.0.0.1:8080".to_string(),
//!         dispatch_addr: "127.0.0.1:8090".to_string(),
//!         user_id: "u1".to_string(),
//!         name: "Alice".to_string(),
//!         lobby_key: "lobby".to_string(),
//!         fake_ping_ms: 0,
//!         max_drops: Some(1),
//!     });
//!     if let Err(e) = claimer.run().await {
//!         eprintln!("claimer failed: {}", e);
//!     }
//! }
//! ```

pub mod network;
