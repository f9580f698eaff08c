//! Background receive-and-forward loop.

use std::sync::Arc;

use tracing::debug;

use crate::events::adapter::{EventAdapter, Flow};
use crate::events::error::EventsClientError;
use crate::events::handshake::AckSlot;
use crate::events::proto::ControlMessage;
use crate::events::sender::SignedSender;
use crate::events::transport::FrameSource;

/// Receives one frame and applies disconnect classification: a clean end
/// reports `disconnected(None)` and yields `Ok(None)`, a receive error
/// reports `disconnected(Some(err))` and is returned.
pub(crate) async fn next_message(
    source: &mut dyn FrameSource,
    adapter: &dyn EventAdapter,
) -> Result<Option<ControlMessage>, EventsClientError> {
    match source.recv().await {
        Some(Ok(message)) => Ok(Some(message)),
        Some(Err(err)) => {
            adapter.disconnected(Some(&err));
            Err(err)
        }
        None => {
            adapter.disconnected(None);
            Ok(None)
        }
    }
}

pub(crate) struct DispatchLoop {
    source: Box<dyn FrameSource>,
    adapter: Arc<dyn EventAdapter>,
    sender: Arc<SignedSender>,
    acks: Arc<AckSlot>,
}

impl DispatchLoop {
    pub(crate) fn new(
        source: Box<dyn FrameSource>,
        adapter: Arc<dyn EventAdapter>,
        sender: Arc<SignedSender>,
        acks: Arc<AckSlot>,
    ) -> Self {
        acks.open();
        Self {
            source,
            adapter,
            sender,
            acks,
        }
    }

    /// Runs until the stream ends, fails, or the adapter stops it; then
    /// closes the send half.
    pub(crate) async fn run(mut self) -> Result<(), EventsClientError> {
        let result = self.process().await;
        self.acks.close();

        if let Err(err) = self.sender.close_send().await {
            debug!(event = "dispatch_close_send_failed", error = %err);
        }
        match &result {
            Ok(()) => debug!(event = "dispatch_loop_finished"),
            Err(err) => debug!(event = "dispatch_loop_failed", error = %err),
        }
        result
    }

    async fn process(&mut self) -> Result<(), EventsClientError> {
        loop {
            let Some(message) = next_message(self.source.as_mut(), self.adapter.as_ref()).await?
            else {
                return Ok(());
            };

            let Some(message) = self.acks.offer(message) else {
                continue;
            };

            match self.adapter.recv(message) {
                Flow::Continue => {}
                Flow::Stop(None) => return Ok(()),
                Flow::Stop(Some(err)) => return Err(EventsClientError::Adapter(err)),
            }
        }
    }
}
