//! # Drop Race Server Library
//!
//! Server side of a timed "drop" race: a scheduled collectible goes live at a
//! fixed instant, every connected client is told at once, and the first valid
//! claim wins it. Claims fast enough to look automated land in a separate,
//! weighted "league" tier instead of winning outright.
//!
//! ## Processes
//!
//! ### Coordinator (`coordinator`, `balancer`)
//! Owns the coordination hub. Tracks which workers are online and how loaded
//! they are, and hands end users the least-loaded worker once a minimum
//! number of workers has registered.
//!
//! ### Workers (`worker`, `ingress`)
//! Terminate end-user connections. Each worker keeps per-connection session
//! state, validates claims and forwards them to the hub.
//!
//! ### Drop Server (`dispatch`)
//! Keeps raw sockets to every client and pushes the "drop is live" notice to
//! all of them with as little delay as possible, recording per-socket timing.
//!
//! ### Drop Engine (`drops`)
//! Runs the drop lifecycle: discovery, maturing, dispatching, arbitration and
//! reporting. Arbitration is single-threaded; claims are processed strictly in
//! arrival order.
//!
//! ## Supporting Modules
//!
//! - `coordination`: in-process hub connecting all of the above
//! - `store`: drop and member persistence behind async traits
//! - `config`: command-line configuration
//! - `error`: error types shared across modules
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::balancer::BalancerHandle;
//! use server::coordination::Hub;
//! use server::coordinator::Coordinator;
//! use server::drops::DropEngine;
//! use server::config::EngineConfig;
//! use server::store::MemoryStore;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (hub, events) = Hub::new();
//!     let (engine_tx, engine_rx) = mpsc::unbounded_channel();
//!     let balancer = BalancerHandle::new(1);
//!
//!     tokio::spawn(Coordinator::new(hub.clone(), events, balancer, engine_tx).run());
//!
//!     let store = Arc::new(MemoryStore::new());
//!     DropEngine::new(store, hub, engine_rx, EngineConfig::default())
//!         .run()
//!         .await;
//! }
//! ```

pub mod balancer;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod dispatch;
pub mod drops;
pub mod error;
pub mod ingress;
pub mod store;
pub mod worker;
