//! Core WebSocket infrastructure.
//!
//! Connection-level building blocks shared by the realtime client:
//!
//! - [`config::Config`]: heartbeat, connect timeout and reconnect policy
//! - [`transport::Transport`]: opens text-frame connections; [`transport::WebSocketTransport`]
//!   is the default implementation
//! - [`WsError`]: connection-level failures
//! - [`ListenerHandle`]: returned when observing connection status

pub mod config;
pub mod error;
pub(crate) mod listeners;
pub mod transport;

#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use listeners::ListenerHandle;
pub use transport::{Transport, TransportEvent, TransportHandle, TransportPeer};
