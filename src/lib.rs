//! Max patch bridge
//!
//! Drives a running Max instance over a WebSocket bridge: request/response
//! correlation, mutation admission, capability gating, a checkpointed patch twin,
//! transactional multi-step edits, and hygiene for stale Max processes and
//! session directories.

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod hygiene;
pub mod runtime;

mod error;
mod state;
mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::BridgeConfig;
pub use error::{render, BridgeError, Error, ErrorCode, Result};
pub use state::BridgeState;

/// Install the global tracing subscriber. `RUST_LOG` directives extend the crate default.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "maxpatch_bridge=debug".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
