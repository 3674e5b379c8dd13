//! Connection and protocol layer
//!
//! Everything between a caller and the peer's socket: envelopes, correlation,
//! admission, capabilities, auth and metrics.

pub mod actions;
pub mod admission;
pub mod auth;
pub mod capabilities;
pub mod connection;
pub mod envelope;
pub mod idempotency;
pub mod metrics;
pub mod pending;
pub mod transport;

pub use admission::{GateSnapshot, MutationGate, MutationPermit};
pub use auth::{resolve_auth_token, ResolvedAuth, TokenSource};
pub use capabilities::Capabilities;
pub use connection::{ActionObserver, BridgeConnection};
pub use transport::{Transport, WebSocketTransport};
