//! Error taxonomy for the events client and the clamped-timeout advisory.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::events::proto::AckKind;
use crate::signing::SignError;

/// Error returned by an [`EventAdapter`](crate::events::adapter::EventAdapter).
pub type AdapterError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Step of connection establishment that failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectStage {
    /// Transport dial (TCP connect, timeout).
    Dial,
    /// Stream open on an established transport (TLS and upgrade handshakes).
    OpenStream,
}

impl std::fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dial => f.write_str("dial"),
            Self::OpenStream => f.write_str("stream open"),
        }
    }
}

/// Errors produced by the events client.
#[derive(Debug, Error)]
pub enum EventsClientError {
    /// Dialing or opening the event stream failed.
    #[error("events connection failed ({stage}) for {address}: {reason}")]
    Connection {
        stage: ConnectStage,
        address: String,
        reason: String,
    },

    /// No acknowledgement arrived within the registration timeout.
    #[error("{kind} timeout after {timeout:?}")]
    HandshakeTimeout { kind: AckKind, timeout: Duration },

    /// Malformed or unexpected message on the control path.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Signing capability missing or signing failed.
    #[error("sign failed: {0}")]
    Signature(#[from] SignError),

    /// Control message could not be serialized.
    #[error("marshal event failed: {0}")]
    Marshal(#[from] serde_json::Error),

    /// Identity context missing or unusable.
    #[error("identity error: {0}")]
    Identity(String),

    /// Interest retrieval failed or produced nothing to register.
    #[error("config error: {0}")]
    Config(String),

    /// Read or write failure on an established stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// Dispatch loop did not drain before the shutdown timeout.
    #[error("close event stream timeout after {0:?}")]
    ShutdownTimeout(Duration),

    /// Adapter asked the dispatch loop to stop with an error.
    #[error("adapter error: {0}")]
    Adapter(AdapterError),

    /// Operation not valid in the client's current state.
    #[error("invalid client state: {0}")]
    Lifecycle(String),
}

impl EventsClientError {
    pub(crate) fn connection(
        stage: ConnectStage,
        address: &str,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Connection {
            stage,
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns true for a failure at the stream-open step, which is the step
    /// that may fall back to an insecure transport.
    pub fn is_stream_open_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                stage: ConnectStage::OpenStream,
                ..
            }
        )
    }
}

impl From<WsError> for EventsClientError {
    fn from(err: WsError) -> Self {
        Self::Stream(err.to_string())
    }
}

/// Advisory returned next to a usable client when the registration timeout
/// was clamped into range.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("registration timeout {requested:?} out of range, using {effective:?}")]
pub struct TimeoutClamped {
    pub requested: Duration,
    pub effective: Duration,
}
