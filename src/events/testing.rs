//! In-memory transport, stream and adapter doubles for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::Secret;
use tokio::sync::mpsc;

use crate::events::adapter::{EventAdapter, Flow};
use crate::events::config::SecurityMode;
use crate::events::error::{AdapterError, ConnectStage, EventsClientError};
use crate::events::proto::{AckKind, ControlMessage, EventBody, Interest, SignedEnvelope};
use crate::events::sender::SignedSender;
use crate::events::transport::{Connection, EventStream, FrameSink, FrameSource, Transport};
use crate::signing::{Ed25519SigningManager, Identity, SigningIdentity};

pub(crate) fn test_identity() -> Arc<dyn Identity> {
    Arc::new(SigningIdentity::new(
        "Org1MSP",
        "-----BEGIN CERTIFICATE-----test",
        Secret::new(vec![7u8; 32]),
    ))
}

pub(crate) fn test_sender(stream: &MockStream) -> SignedSender {
    SignedSender::new(
        stream.sink(),
        Some(test_identity()),
        Some(Arc::new(Ed25519SigningManager)),
        Vec::new(),
    )
}

pub(crate) fn ack(kind: AckKind) -> ControlMessage {
    let body = match kind {
        AckKind::Register => EventBody::Register { events: Vec::new() },
        AckKind::Unregister => EventBody::Unregister { events: Vec::new() },
    };
    ControlMessage::new(body, Vec::new(), Vec::new(), 0)
}

pub(crate) fn nil_ack() -> ControlMessage {
    ControlMessage {
        event: None,
        creator: Vec::new(),
        tls_cert_hash: Vec::new(),
        timestamp_ms: 0,
    }
}

pub(crate) fn event(payload: serde_json::Value) -> ControlMessage {
    ControlMessage::new(EventBody::Event { payload }, Vec::new(), Vec::new(), 0)
}

#[derive(Debug)]
enum Inbound {
    Message(ControlMessage),
    Error(String),
    End,
}

/// Write boundaries recorded by [`MockStream`], keyed by write id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum WireEvent {
    Begin(u64),
    End(u64),
}

struct StreamShared {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    sent: Mutex<Vec<SignedEnvelope>>,
    wire_log: Mutex<Vec<WireEvent>>,
    write_failure: Mutex<Option<String>>,
    write_delay: Mutex<Duration>,
    write_ids: AtomicU64,
    close_sends: AtomicUsize,
    end_on_close_send: AtomicBool,
    stall_close_send: AtomicBool,
}

/// Scripted bidirectional stream: tests push inbound frames and inspect
/// what the client wrote.
#[derive(Clone)]
pub(crate) struct MockStream {
    shared: Arc<StreamShared>,
}

impl MockStream {
    pub(crate) fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(StreamShared {
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                sent: Mutex::new(Vec::new()),
                wire_log: Mutex::new(Vec::new()),
                write_failure: Mutex::new(None),
                write_delay: Mutex::new(Duration::ZERO),
                write_ids: AtomicU64::new(0),
                close_sends: AtomicUsize::new(0),
                end_on_close_send: AtomicBool::new(false),
                stall_close_send: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn sink(&self) -> Box<dyn FrameSink> {
        Box::new(MockSink {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Takes the read half; a stream has exactly one reader.
    pub(crate) fn source(&self) -> Box<dyn FrameSource> {
        let rx = self
            .shared
            .inbound_rx
            .lock()
            .expect("inbound lock")
            .take()
            .expect("mock stream source already taken");
        Box::new(MockSource { rx })
    }

    pub(crate) fn push(&self, message: ControlMessage) {
        let _ = self.shared.inbound_tx.send(Inbound::Message(message));
    }

    pub(crate) fn push_error(&self, reason: &str) {
        let _ = self.shared.inbound_tx.send(Inbound::Error(reason.to_string()));
    }

    pub(crate) fn end(&self) {
        let _ = self.shared.inbound_tx.send(Inbound::End);
    }

    /// Ends the inbound side when the client closes its send half, like a
    /// server that finishes its stream in response.
    pub(crate) fn end_on_close_send(&self) {
        self.shared.end_on_close_send.store(true, Ordering::SeqCst);
    }

    /// Makes close-send block forever, like a write stuck on a full socket.
    pub(crate) fn stall_close_send(&self) {
        self.shared.stall_close_send.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, reason: &str) {
        *self.shared.write_failure.lock().expect("failure lock") = Some(reason.to_string());
    }

    pub(crate) fn set_write_delay(&self, delay: Duration) {
        *self.shared.write_delay.lock().expect("delay lock") = delay;
    }

    pub(crate) fn sent(&self) -> Vec<SignedEnvelope> {
        self.shared.sent.lock().expect("sent lock").clone()
    }

    pub(crate) fn sent_messages(&self) -> Vec<ControlMessage> {
        self.sent()
            .iter()
            .map(|envelope| envelope.message().expect("decode sent envelope"))
            .collect()
    }

    pub(crate) fn wire_log(&self) -> Vec<WireEvent> {
        self.shared.wire_log.lock().expect("wire lock").clone()
    }

    pub(crate) fn close_sends(&self) -> usize {
        self.shared.close_sends.load(Ordering::SeqCst)
    }
}

struct MockSink {
    shared: Arc<StreamShared>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, envelope: &SignedEnvelope) -> Result<(), EventsClientError> {
        if let Some(reason) = self.shared.write_failure.lock().expect("failure lock").clone() {
            return Err(EventsClientError::Stream(reason));
        }

        let id = self.shared.write_ids.fetch_add(1, Ordering::SeqCst);
        self.shared
            .wire_log
            .lock()
            .expect("wire lock")
            .push(WireEvent::Begin(id));

        let delay = *self.shared.write_delay.lock().expect("delay lock");
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        self.shared
            .sent
            .lock()
            .expect("sent lock")
            .push(envelope.clone());
        self.shared
            .wire_log
            .lock()
            .expect("wire lock")
            .push(WireEvent::End(id));
        Ok(())
    }

    async fn close_send(&mut self) -> Result<(), EventsClientError> {
        self.shared.close_sends.fetch_add(1, Ordering::SeqCst);
        if self.shared.stall_close_send.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.shared.end_on_close_send.load(Ordering::SeqCst) {
            let _ = self.shared.inbound_tx.send(Inbound::End);
        }
        Ok(())
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn recv(&mut self) -> Option<Result<ControlMessage, EventsClientError>> {
        match self.rx.recv().await {
            Some(Inbound::Message(message)) => Some(Ok(message)),
            Some(Inbound::Error(reason)) => Some(Err(EventsClientError::Stream(reason))),
            Some(Inbound::End) | None => None,
        }
    }
}

#[derive(Default)]
struct TransportShared {
    prepared: Mutex<VecDeque<MockStream>>,
    opened: Mutex<Vec<MockStream>>,
    dial_failures: Mutex<Vec<SecurityMode>>,
    open_failures: Mutex<Vec<SecurityMode>>,
    dials: Mutex<Vec<SecurityMode>>,
    opens: Mutex<Vec<SecurityMode>>,
    closes: AtomicUsize,
    close_failure: Mutex<Option<String>>,
}

/// Transport whose connections hand out prepared [`MockStream`]s in order.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    shared: Arc<TransportShared>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues the stream handed to the next successful stream open.
    pub(crate) fn prepare_stream(&self) -> MockStream {
        let stream = MockStream::new();
        self.shared
            .prepared
            .lock()
            .expect("prepared lock")
            .push_back(stream.clone());
        stream
    }

    pub(crate) fn fail_dial(&self, mode: SecurityMode) {
        self.shared.dial_failures.lock().expect("lock").push(mode);
    }

    pub(crate) fn fail_open(&self, mode: SecurityMode) {
        self.shared.open_failures.lock().expect("lock").push(mode);
    }

    pub(crate) fn fail_close(&self, reason: &str) {
        *self.shared.close_failure.lock().expect("lock") = Some(reason.to_string());
    }

    pub(crate) fn dials(&self) -> Vec<SecurityMode> {
        self.shared.dials.lock().expect("lock").clone()
    }

    pub(crate) fn opens(&self) -> Vec<SecurityMode> {
        self.shared.opens.lock().expect("lock").clone()
    }

    pub(crate) fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn opened_streams(&self) -> Vec<MockStream> {
        self.shared.opened.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        mode: SecurityMode,
        _dial_timeout: Duration,
    ) -> Result<Box<dyn Connection>, EventsClientError> {
        self.shared.dials.lock().expect("lock").push(mode);
        if self.shared.dial_failures.lock().expect("lock").contains(&mode) {
            return Err(EventsClientError::connection(
                ConnectStage::Dial,
                "mock",
                "connection refused",
            ));
        }
        Ok(Box::new(MockConnection {
            mode,
            shared: Arc::clone(&self.shared),
            stream: None,
        }))
    }
}

struct MockConnection {
    mode: SecurityMode,
    shared: Arc<TransportShared>,
    stream: Option<MockStream>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_stream(&mut self) -> Result<EventStream, EventsClientError> {
        self.shared.opens.lock().expect("lock").push(self.mode);
        if self.shared.open_failures.lock().expect("lock").contains(&self.mode) {
            return Err(EventsClientError::connection(
                ConnectStage::OpenStream,
                "mock",
                "handshake failed",
            ));
        }

        let stream = self
            .shared
            .prepared
            .lock()
            .expect("prepared lock")
            .pop_front()
            .unwrap_or_else(MockStream::new);
        self.shared
            .opened
            .lock()
            .expect("lock")
            .push(stream.clone());
        let event_stream = EventStream {
            sink: stream.sink(),
            source: stream.source(),
        };
        self.stream = Some(stream);
        Ok(event_stream)
    }

    async fn close(&mut self) -> Result<(), EventsClientError> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(stream) = self.stream.take() {
            stream.push_error("connection closed");
        }
        match self.shared.close_failure.lock().expect("lock").clone() {
            Some(reason) => Err(EventsClientError::Stream(reason)),
            None => Ok(()),
        }
    }
}

/// Adapter that records deliveries and can stop after a number of events.
pub(crate) struct RecordingAdapter {
    interests: Result<Vec<Interest>, String>,
    stop_after: Option<(usize, Option<String>)>,
    received: Mutex<Vec<ControlMessage>>,
    disconnects: Mutex<Vec<Option<String>>>,
}

impl RecordingAdapter {
    pub(crate) fn new(interests: Vec<Interest>) -> Self {
        Self {
            interests: Ok(interests),
            stop_after: None,
            received: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(reason: &str) -> Self {
        Self {
            interests: Err(reason.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Returns `Flow::Stop` on the `count`-th delivered event.
    pub(crate) fn stop_after(mut self, count: usize, error: Option<&str>) -> Self {
        self.stop_after = Some((count, error.map(str::to_string)));
        self
    }

    pub(crate) fn received(&self) -> Vec<ControlMessage> {
        self.received.lock().expect("received lock").clone()
    }

    pub(crate) fn disconnects(&self) -> Vec<Option<String>> {
        self.disconnects.lock().expect("disconnects lock").clone()
    }
}

impl EventAdapter for RecordingAdapter {
    fn interested_events(&self) -> Result<Vec<Interest>, AdapterError> {
        self.interests.clone().map_err(AdapterError::from)
    }

    fn recv(&self, message: ControlMessage) -> Flow {
        let mut received = self.received.lock().expect("received lock");
        received.push(message);
        match &self.stop_after {
            Some((count, error)) if received.len() >= *count => {
                Flow::Stop(error.clone().map(AdapterError::from))
            }
            _ => Flow::Continue,
        }
    }

    fn disconnected(&self, error: Option<&EventsClientError>) {
        self.disconnects
            .lock()
            .expect("disconnects lock")
            .push(error.map(ToString::to_string));
    }
}
