//! Consumer-side capability driven by the events client.
//!
//! - [`EventAdapter`]: interests, event delivery and disconnect callbacks.
//! - [`ChannelAdapter`]: adapter that forwards into tokio channels, for
//!   callers that prefer to pull events from a receiver.

use tokio::sync::mpsc;

use crate::events::error::{AdapterError, EventsClientError};
use crate::events::proto::{ControlMessage, Interest};

/// Dispatch decision returned by [`EventAdapter::recv`].
#[derive(Debug)]
pub enum Flow {
    /// Keep receiving.
    Continue,
    /// Stop the dispatch loop now, returning the error if one is given.
    Stop(Option<AdapterError>),
}

/// Receives the event stream on behalf of the caller.
///
/// Methods are called from the dispatch task and must not block for long.
pub trait EventAdapter: Send + Sync {
    /// Interests registered during `start`. An empty list fails the start.
    fn interested_events(&self) -> Result<Vec<Interest>, AdapterError>;

    /// Delivers one inbound event.
    fn recv(&self, message: ControlMessage) -> Flow;

    /// Called once when the stream ends: `None` on a clean close, otherwise
    /// the receive error.
    fn disconnected(&self, error: Option<&EventsClientError>);
}

/// Connection lifecycle updates produced by a [`ChannelAdapter`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    /// Stream ended; `error` is the rendered receive error, if any.
    Disconnected { error: Option<String> },
}

/// Adapter that forwards events and status changes into unbounded channels.
///
/// Dropping the [`EventReceiver`] stops the dispatch loop at the next event.
#[derive(Debug)]
pub struct ChannelAdapter {
    interests: Vec<Interest>,
    events: mpsc::UnboundedSender<ControlMessage>,
    status: mpsc::UnboundedSender<ConnectionStatus>,
}

impl ChannelAdapter {
    pub fn new(interests: Vec<Interest>) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        (
            Self {
                interests,
                events: events_tx,
                status: status_tx,
            },
            EventReceiver {
                events: events_rx,
                status: status_rx,
            },
        )
    }
}

impl EventAdapter for ChannelAdapter {
    fn interested_events(&self) -> Result<Vec<Interest>, AdapterError> {
        Ok(self.interests.clone())
    }

    fn recv(&self, message: ControlMessage) -> Flow {
        match self.events.send(message) {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop(None),
        }
    }

    fn disconnected(&self, error: Option<&EventsClientError>) {
        let _ = self.status.send(ConnectionStatus::Disconnected {
            error: error.map(ToString::to_string),
        });
    }
}

/// Receiving side of a [`ChannelAdapter`].
#[derive(Debug)]
pub struct EventReceiver {
    events: mpsc::UnboundedReceiver<ControlMessage>,
    status: mpsc::UnboundedReceiver<ConnectionStatus>,
}

impl EventReceiver {
    /// Receives the next event; `None` once the adapter is gone.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.events.recv().await
    }

    /// Receives the next status update.
    pub async fn status(&mut self) -> Option<ConnectionStatus> {
        self.status.recv().await
    }

    /// Splits into event and status receivers.
    pub fn split(
        self,
    ) -> (
        mpsc::UnboundedReceiver<ControlMessage>,
        mpsc::UnboundedReceiver<ConnectionStatus>,
    ) {
        (self.events, self.status)
    }
}
