//! Dispatchertron: a publish/subscribe event bus spanning several processes.
//!
//! Listeners registered in any process receive every payload dispatched from
//! any other process. A dispatch completes once every reachable process has
//! run its listeners and acknowledged.
//!
//! # Architecture
//!
//! - `bus`: the per-process [`Dispatcher`] and its registries
//! - `ipc`: wire protocol, peer links and the stdio transport for workers
//! - `config`: id prefixes, read from the environment or a dotenv file
//!
//! Processes form a star: a coordinator spawns workers and holds one link per
//! worker, while each worker holds a single link back to the coordinator.
//! Events raised by a worker reach the coordinator but are not relayed to the
//! other workers.

pub mod bus;
pub mod config;
pub mod ipc;

#[cfg(test)]
mod testing;

pub use bus::{
    DeliveryReport, DispatchError, DispatchOutcome, Dispatcher, FaultReport, PeerId,
    SubscriptionId,
};
pub use config::{ConfigError, DispatcherConfig};
pub use ipc::{PeerLink, TransportError, WireMessage};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "dispatchertron=debug,info";

/// Install the global `tracing` subscriber.
///
/// Logs go to stderr because a worker's stdout carries the wire protocol.
/// Calling this more than once is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
