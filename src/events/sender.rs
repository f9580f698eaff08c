//! Signed outbound path.
//!
//! Every write goes through [`SignedSender::send`], which holds the sink lock
//! for marshal, sign and write together. Concurrent callers are therefore
//! totally ordered and envelopes never interleave on the wire.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::warn;

use crate::events::error::EventsClientError;
use crate::events::handshake::{self, AckSlot};
use crate::events::proto::{AckKind, ControlMessage, EventBody, Interest, SignedEnvelope};
use crate::events::transport::FrameSink;
use crate::signing::{Identity, SignError, SigningManager};

pub(crate) struct SignedSender {
    sink: Mutex<Box<dyn FrameSink>>,
    identity: Option<Arc<dyn Identity>>,
    signer: Option<Arc<dyn SigningManager>>,
    tls_cert_hash: Vec<u8>,
}

impl SignedSender {
    pub(crate) fn new(
        sink: Box<dyn FrameSink>,
        identity: Option<Arc<dyn Identity>>,
        signer: Option<Arc<dyn SigningManager>>,
        tls_cert_hash: Vec<u8>,
    ) -> Self {
        Self {
            sink: Mutex::new(sink),
            identity,
            signer,
            tls_cert_hash,
        }
    }

    /// Marshals, signs and writes `message` under the send lock.
    pub(crate) async fn send(&self, message: &ControlMessage) -> Result<(), EventsClientError> {
        let mut sink = self.sink.lock().await;

        let event_bytes = message.to_bytes()?;
        let signer = self.signer.as_ref().ok_or(SignError::MissingSigner)?;
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| EventsClientError::Identity("identity context is nil".to_string()))?;
        let signature = signer.sign(&event_bytes, identity.private_key())?;

        sink.send(&SignedEnvelope {
            event_bytes,
            signature,
        })
        .await
    }

    /// Builds and sends a control message for `body` stamped with the
    /// caller's identity, the channel binding and the current time.
    pub(crate) async fn send_control(&self, body: EventBody) -> Result<(), EventsClientError> {
        let message = self.control_message(body)?;
        self.send(&message).await
    }

    pub(crate) async fn close_send(&self) -> Result<(), EventsClientError> {
        self.sink.lock().await.close_send().await
    }

    fn control_message(&self, body: EventBody) -> Result<ControlMessage, EventsClientError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| EventsClientError::Identity("identity context is nil".to_string()))?;
        let creator = identity.serialized_identity().map_err(|err| {
            EventsClientError::Identity(format!(
                "identity context identity retrieval failed: {err}"
            ))
        })?;
        Ok(ControlMessage::new(
            body,
            creator,
            self.tls_cert_hash.clone(),
            now_ms(),
        ))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Cloneable handle for sending on a connected client.
///
/// The synchronous [`register`](Self::register) and
/// [`unregister`](Self::unregister) wait for their acknowledgement through
/// the dispatch loop, so they need a started client.
#[derive(Clone)]
pub struct EventSender {
    inner: Arc<SignedSender>,
    acks: Arc<AckSlot>,
    registration_timeout: Duration,
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender")
            .field("registration_timeout", &self.registration_timeout)
            .finish_non_exhaustive()
    }
}

impl EventSender {
    pub(crate) fn new(
        inner: Arc<SignedSender>,
        acks: Arc<AckSlot>,
        registration_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            acks,
            registration_timeout,
        }
    }

    /// Registers interest in events without waiting for a response.
    pub async fn register_async(&self, interests: Vec<Interest>) -> Result<(), EventsClientError> {
        let result = self
            .inner
            .send_control(EventBody::Register { events: interests })
            .await;
        if let Err(err) = &result {
            warn!(event = "register_send_failed", error = %err);
        }
        result
    }

    /// Unregisters interest in events without waiting for a response.
    pub async fn unregister_async(
        &self,
        interests: Vec<Interest>,
    ) -> Result<(), EventsClientError> {
        self.inner
            .send_control(EventBody::Unregister { events: interests })
            .await
            .map_err(|err| match err {
                EventsClientError::Stream(reason) => {
                    EventsClientError::Stream(format!("unregister send failed: {reason}"))
                }
                other => other,
            })
    }

    /// Registers interest and waits for the register acknowledgement.
    pub async fn register(&self, interests: Vec<Interest>) -> Result<(), EventsClientError> {
        handshake::exchange_via_dispatch(
            &self.acks,
            AckKind::Register,
            self.registration_timeout,
            self.register_async(interests),
        )
        .await
    }

    /// Unregisters interest and waits for the unregister acknowledgement.
    pub async fn unregister(&self, interests: Vec<Interest>) -> Result<(), EventsClientError> {
        handshake::exchange_via_dispatch(
            &self.acks,
            AckKind::Unregister,
            self.registration_timeout,
            self.unregister_async(interests),
        )
        .await
    }

    /// Sends an application event.
    pub async fn send_event(&self, payload: serde_json::Value) -> Result<(), EventsClientError> {
        self.inner.send_control(EventBody::Event { payload }).await
    }

    /// Signs and sends a prebuilt control message.
    pub async fn send(&self, message: &ControlMessage) -> Result<(), EventsClientError> {
        self.inner.send(message).await
    }
}
