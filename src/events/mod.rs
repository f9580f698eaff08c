//! Event-hub stream modules.
//!
//! - `client`: lifecycle manager (start, connect, stop, register).
//! - `transport`: dial, TLS and WebSocket stream plumbing.
//! - `handshake`: register/unregister acknowledgement exchanges.
//! - `dispatch`: background loop that feeds the adapter.
//! - `sender`: signed, serialized outbound path.
//! - `proto`: control messages and envelopes on the wire.

/// Consumer-side adapter trait and channel adapter.
pub mod adapter;
/// Events client and lifecycle states.
pub mod client;
/// Settings, configuration provider and timeout defaults.
pub mod config;
mod dispatch;
/// Error taxonomy for the events client.
pub mod error;
mod handshake;
/// Wire protocol messages.
pub mod proto;
/// Signed outbound sender handle.
pub mod sender;
#[cfg(test)]
mod testing;
/// Transport traits and the WebSocket implementation.
pub mod transport;

pub use adapter::{ChannelAdapter, EventAdapter, EventReceiver, Flow};
pub use client::{ClientProviders, ClientState, EventsClient};
pub use config::{ClientSettings, EventsConfig, KeepaliveParams, StaticEventsConfig};
pub use error::{EventsClientError, TimeoutClamped};
pub use proto::{ControlMessage, EventBody, EventType, Interest};
pub use sender::EventSender;
