//! Register/unregister request and acknowledgement exchanges.
//!
//! Before the dispatch loop runs, the handshake reads the acknowledgement
//! straight off the stream and races it against the registration timeout.
//! The losing receive is dropped, which cancels it; frame sources are
//! cancel-safe so no frame is lost and no late result is observed.
//!
//! Once the dispatch loop owns the read half, waiters park on an
//! [`AckSlot`] instead and the loop hands over the next control-path frame.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::events::error::EventsClientError;
use crate::events::proto::{AckKind, ControlMessage, EventBody, Interest};
use crate::events::sender::SignedSender;
use crate::events::transport::FrameSource;

/// Sends a register request and waits for its acknowledgement on `source`.
pub(crate) async fn register(
    sender: &SignedSender,
    source: &mut dyn FrameSource,
    interests: Vec<Interest>,
    timeout: Duration,
) -> Result<(), EventsClientError> {
    sender
        .send_control(EventBody::Register { events: interests })
        .await?;
    await_ack(source, AckKind::Register, timeout).await
}

/// Sends an unregister request and waits for its acknowledgement on `source`.
pub(crate) async fn unregister(
    sender: &SignedSender,
    source: &mut dyn FrameSource,
    interests: Vec<Interest>,
    timeout: Duration,
) -> Result<(), EventsClientError> {
    sender
        .send_control(EventBody::Unregister { events: interests })
        .await?;
    await_ack(source, AckKind::Unregister, timeout).await
}

/// Reads the next frame from `source`, bounded by `timeout`.
pub(crate) async fn await_ack(
    source: &mut dyn FrameSource,
    kind: AckKind,
    timeout: Duration,
) -> Result<(), EventsClientError> {
    match tokio::time::timeout(timeout, source.recv()).await {
        Ok(next) => classify_ack(kind, next),
        Err(_) => Err(EventsClientError::HandshakeTimeout { kind, timeout }),
    }
}

pub(crate) fn classify_ack(
    kind: AckKind,
    next: Option<Result<ControlMessage, EventsClientError>>,
) -> Result<(), EventsClientError> {
    let message = match next {
        Some(Ok(message)) => message,
        Some(Err(err)) => return Err(err),
        None => {
            return Err(EventsClientError::Stream(format!(
                "stream ended before {kind} acknowledgement"
            )))
        }
    };

    match (kind, message.event) {
        (AckKind::Register, Some(EventBody::Register { .. }))
        | (AckKind::Unregister, Some(EventBody::Unregister { .. })) => Ok(()),
        (_, None) => Err(EventsClientError::Protocol(format!("nil object for {kind}"))),
        (_, Some(_)) => Err(EventsClientError::Protocol(format!(
            "invalid object for {kind}"
        ))),
    }
}

struct Waiter {
    generation: u64,
    kind: AckKind,
    tx: oneshot::Sender<ControlMessage>,
}

#[derive(Default)]
struct SlotState {
    open: bool,
    next_generation: u64,
    waiter: Option<Waiter>,
}

/// Single-waiter hand-off point between the dispatch loop and a pending
/// register/unregister exchange.
///
/// Each armed waiter gets a fresh generation. Disarming only clears the slot
/// when the generation still matches, so a timed-out waiter can never remove
/// its successor.
#[derive(Default)]
pub(crate) struct AckSlot {
    state: Mutex<SlotState>,
}

impl AckSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts accepting waiters; called when a dispatch loop takes the stream.
    pub(crate) fn open(&self) {
        self.lock().open = true;
    }

    /// Stops accepting waiters and wakes any pending one with a closed channel.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.open = false;
        state.waiter = None;
    }

    fn arm(
        &self,
        kind: AckKind,
    ) -> Result<(u64, oneshot::Receiver<ControlMessage>), EventsClientError> {
        let mut state = self.lock();
        if !state.open {
            return Err(EventsClientError::Lifecycle(format!(
                "no dispatch loop to deliver {kind} acknowledgement"
            )));
        }
        if state.waiter.is_some() {
            return Err(EventsClientError::Lifecycle(format!(
                "another acknowledgement is pending, cannot start {kind}"
            )));
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        let (tx, rx) = oneshot::channel();
        state.waiter = Some(Waiter {
            generation,
            kind,
            tx,
        });
        Ok((generation, rx))
    }

    fn disarm(&self, generation: u64) {
        let mut state = self.lock();
        if state
            .waiter
            .as_ref()
            .is_some_and(|waiter| waiter.generation == generation)
        {
            state.waiter = None;
        }
    }

    /// Routes an inbound message.
    ///
    /// Application events are returned for delivery to the adapter. Any other
    /// frame is handed to the armed waiter; with nobody waiting it is
    /// returned as well, so the adapter sees every unclaimed frame.
    pub(crate) fn offer(&self, message: ControlMessage) -> Option<ControlMessage> {
        if matches!(message.event, Some(EventBody::Event { .. })) {
            return Some(message);
        }

        let Some(waiter) = self.lock().waiter.take() else {
            debug!(event = "unsolicited_control_frame", kind = ?message.ack_kind());
            return Some(message);
        };
        if waiter.tx.send(message).is_err() {
            debug!(
                event = "ack_waiter_gone",
                kind = %waiter.kind,
                generation = waiter.generation
            );
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Arms `slot`, runs `send`, then waits for the dispatch loop to deliver the
/// acknowledgement.
pub(crate) async fn exchange_via_dispatch<F>(
    slot: &AckSlot,
    kind: AckKind,
    timeout: Duration,
    send: F,
) -> Result<(), EventsClientError>
where
    F: Future<Output = Result<(), EventsClientError>>,
{
    let (generation, rx) = slot.arm(kind)?;
    if let Err(err) = send.await {
        slot.disarm(generation);
        return Err(err);
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(message)) => classify_ack(kind, Some(Ok(message))),
        Ok(Err(_)) => Err(EventsClientError::Stream(format!(
            "dispatch loop stopped before {kind} acknowledgement"
        ))),
        Err(_) => {
            slot.disarm(generation);
            Err(EventsClientError::HandshakeTimeout { kind, timeout })
        }
    }
}
