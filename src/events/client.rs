//! Events client lifecycle.
//!
//! `start` dials, registers the adapter's interests and spawns the dispatch
//! loop; `stop` closes the send half, waits (bounded) for the loop to drain
//! and always closes the connection. `connect` runs the same handshake but
//! leaves the stream to the caller for pull-mode `recv`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::adapter::EventAdapter;
use crate::events::config::{
    clamp_registration_timeout, ClientSettings, EventsConfig, SecurityMode, TimeoutPurpose,
};
use crate::events::dispatch::{next_message, DispatchLoop};
use crate::events::error::{EventsClientError, TimeoutClamped};
use crate::events::handshake::{self, AckSlot};
use crate::events::proto::{ControlMessage, Interest};
use crate::events::sender::{EventSender, SignedSender};
use crate::events::transport::{Connection, FrameSource, Transport, WebSocketTransport};
use crate::retry::{with_fallback, with_timeout, AttemptPlan};
use crate::signing::{Identity, SigningManager};

/// Collaborators consulted while connecting and signing.
#[derive(Clone)]
pub struct ClientProviders {
    pub config: Arc<dyn EventsConfig>,
    /// Signing capability; sends fail with a signature error when absent.
    pub signing: Option<Arc<dyn SigningManager>>,
}

/// Lifecycle state of an [`EventsClient`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    Idle,
    Connecting,
    Registering,
    /// Registered, with the stream left to the caller (`connect`).
    Connected,
    /// Registered, with the dispatch loop running (`start`).
    Dispatching,
    Draining,
    Closed,
    Failed,
}

type Completion = oneshot::Receiver<Result<(), EventsClientError>>;

struct Session {
    connection: Box<dyn Connection>,
    sender: Arc<SignedSender>,
    acks: Arc<AckSlot>,
    /// Read half, present until a dispatch loop takes it.
    source: Option<Box<dyn FrameSource>>,
    completion: Option<Completion>,
    dispatch: Option<JoinHandle<()>>,
}

struct Established {
    connection: Box<dyn Connection>,
    sender: Arc<SignedSender>,
    source: Box<dyn FrameSource>,
}

/// Client for one event-hub stream.
pub struct EventsClient {
    settings: ClientSettings,
    registration_timeout: Duration,
    providers: ClientProviders,
    identity: Option<Arc<dyn Identity>>,
    adapter: Arc<dyn EventAdapter>,
    transport: Arc<dyn Transport>,
    state: Mutex<ClientState>,
    session: Option<Session>,
}

impl std::fmt::Debug for EventsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsClient")
            .field("address", &self.settings.address())
            .field("registration_timeout", &self.registration_timeout)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EventsClient {
    /// Creates a client using the WebSocket transport.
    ///
    /// A registration timeout outside [100ms, 60s] is clamped and the
    /// returned advisory describes the adjustment.
    pub fn new(
        settings: ClientSettings,
        providers: ClientProviders,
        identity: Option<Arc<dyn Identity>>,
        adapter: Arc<dyn EventAdapter>,
    ) -> (Self, Option<TimeoutClamped>) {
        let (registration_timeout, advisory) =
            clamp_registration_timeout(settings.registration_timeout());
        let transport = Arc::new(WebSocketTransport::new(settings.clone()));
        (
            Self {
                settings,
                registration_timeout,
                providers,
                identity,
                adapter,
                transport,
                state: Mutex::new(ClientState::Idle),
                session: None,
            },
            advisory,
        )
    }

    /// Replaces the transport used to reach the event source.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Effective (clamped) registration timeout.
    pub fn registration_timeout(&self) -> Duration {
        self.registration_timeout
    }

    /// Connects, registers and spawns the dispatch loop.
    pub async fn start(&mut self) -> Result<(), EventsClientError> {
        let established = self.establish().await?;
        let session = self.spawn_dispatch(established);
        self.session = Some(session);
        self.set_state(ClientState::Dispatching);
        info!(event = "events_client_started", address = self.settings.address());
        Ok(())
    }

    /// Connects and registers without a dispatch loop; events are then
    /// pulled with [`recv`](Self::recv).
    pub async fn connect(&mut self) -> Result<(), EventsClientError> {
        let established = self.establish().await?;
        self.session = Some(Session {
            connection: established.connection,
            sender: established.sender,
            acks: Arc::new(AckSlot::new()),
            source: Some(established.source),
            completion: None,
            dispatch: None,
        });
        self.set_state(ClientState::Connected);
        info!(event = "events_client_connected", address = self.settings.address());
        Ok(())
    }

    /// Closes the send half, waits for the dispatch loop to drain and closes
    /// the connection.
    ///
    /// A connection-close error is returned ahead of a drain timeout. A
    /// client that never connected returns `Ok` without side effects.
    pub async fn stop(&mut self) -> Result<(), EventsClientError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        self.set_state(ClientState::Draining);

        let shutdown_timeout = self
            .providers
            .config
            .timeout_or_default(TimeoutPurpose::EventHubShutdown);
        let deadline = Instant::now() + shutdown_timeout;

        // Close-send and the drain share one deadline; a blocked write must
        // not keep the connection open.
        let close_send = with_timeout(shutdown_timeout, session.sender.close_send()).await;
        let mut timed_out = match close_send {
            Ok(Ok(())) => false,
            Ok(Err(err)) => {
                warn!(event = "close_send_failed", error = %err);
                false
            }
            Err(_) => true,
        };

        if let Some(completion) = session.completion.take().filter(|_| !timed_out) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match with_timeout(remaining, completion).await {
                Ok(Ok(Ok(()))) => debug!(event = "dispatch_drained"),
                Ok(Ok(Err(err))) => debug!(event = "dispatch_drained", error = %err),
                Ok(Err(_)) => debug!(event = "dispatch_task_dropped"),
                Err(_) => timed_out = true,
            }
        }

        let mut drain_error = None;
        if timed_out {
            warn!(
                event = "shutdown_timeout",
                timeout_ms = shutdown_timeout.as_millis() as u64
            );
            drain_error = Some(EventsClientError::ShutdownTimeout(shutdown_timeout));
        }

        let closed = session.connection.close().await;
        session.acks.close();
        if let Some(task) = session.dispatch.take() {
            task.abort();
        }
        self.set_state(ClientState::Closed);
        info!(event = "events_client_stopped", address = self.settings.address());

        match (closed, drain_error) {
            (Err(err), _) => Err(err),
            (Ok(()), Some(err)) => Err(err),
            (Ok(()), None) => Ok(()),
        }
    }

    /// Receives the next event from a client connected with
    /// [`connect`](Self::connect).
    ///
    /// `Ok(None)` means the stream ended cleanly; the adapter's
    /// `disconnected` callback is invoked either way.
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>, EventsClientError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| EventsClientError::Lifecycle("client is not connected".to_string()))?;
        let source = session.source.as_mut().ok_or_else(|| {
            EventsClientError::Lifecycle("recv is unavailable while dispatching".to_string())
        })?;
        next_message(source.as_mut(), self.adapter.as_ref()).await
    }

    /// Registers interests and waits for the acknowledgement.
    pub async fn register(&mut self, interests: Vec<Interest>) -> Result<(), EventsClientError> {
        let timeout = self.registration_timeout;
        let session = self.session_mut()?;
        match session.source.as_mut() {
            Some(source) => {
                handshake::register(&session.sender, source.as_mut(), interests, timeout).await
            }
            None => {
                EventSender::new(Arc::clone(&session.sender), Arc::clone(&session.acks), timeout)
                    .register(interests)
                    .await
            }
        }
    }

    /// Unregisters interests and waits for the acknowledgement.
    pub async fn unregister(&mut self, interests: Vec<Interest>) -> Result<(), EventsClientError> {
        let timeout = self.registration_timeout;
        let session = self.session_mut()?;
        match session.source.as_mut() {
            Some(source) => {
                handshake::unregister(&session.sender, source.as_mut(), interests, timeout).await
            }
            None => {
                EventSender::new(Arc::clone(&session.sender), Arc::clone(&session.acks), timeout)
                    .unregister(interests)
                    .await
            }
        }
    }

    /// Sends a register request without waiting for a response.
    pub async fn register_async(&self, interests: Vec<Interest>) -> Result<(), EventsClientError> {
        self.sender()?.register_async(interests).await
    }

    /// Sends an unregister request without waiting for a response.
    pub async fn unregister_async(
        &self,
        interests: Vec<Interest>,
    ) -> Result<(), EventsClientError> {
        self.sender()?.unregister_async(interests).await
    }

    /// Returns a cloneable sender for the live stream.
    pub fn sender(&self) -> Result<EventSender, EventsClientError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| EventsClientError::Lifecycle("client is not connected".to_string()))?;
        Ok(EventSender::new(
            Arc::clone(&session.sender),
            Arc::clone(&session.acks),
            self.registration_timeout,
        ))
    }

    fn session_mut(&mut self) -> Result<&mut Session, EventsClientError> {
        self.session
            .as_mut()
            .ok_or_else(|| EventsClientError::Lifecycle("client is not connected".to_string()))
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn establish(&mut self) -> Result<Established, EventsClientError> {
        match self.state() {
            ClientState::Idle | ClientState::Failed => {}
            ClientState::Closed => {
                return Err(EventsClientError::Lifecycle("client is closed".to_string()))
            }
            state => {
                return Err(EventsClientError::Lifecycle(format!(
                    "cannot start while {state:?}"
                )))
            }
        }
        self.set_state(ClientState::Connecting);

        let plan = AttemptPlan::new(self.settings.security_mode(), self.settings.allow_insecure());
        let dial_timeout = self
            .providers
            .config
            .timeout_or_default(TimeoutPurpose::EventHubConnection);

        let this = &*self;
        let result = with_fallback(
            &plan,
            move |attempt, mode| this.attempt(attempt, mode, dial_timeout),
            EventsClientError::is_stream_open_failure,
        )
        .await;

        if let Err(err) = &result {
            self.set_state(ClientState::Failed);
            warn!(
                event = "events_client_start_failed",
                address = self.settings.address(),
                error = %err
            );
        }
        result
    }

    async fn attempt(
        &self,
        attempt: usize,
        mode: SecurityMode,
        dial_timeout: Duration,
    ) -> Result<Established, EventsClientError> {
        debug!(
            event = "connect_attempt",
            attempt,
            address = self.settings.address(),
            secured = mode.is_secured()
        );
        self.set_state(ClientState::Connecting);
        let mut connection = self.transport.connect(mode, dial_timeout).await?;

        match self.open_and_register(connection.as_mut()).await {
            Ok((sender, source)) => Ok(Established {
                connection,
                sender,
                source,
            }),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(event = "attempt_close_failed", error = %close_err);
                }
                Err(err)
            }
        }
    }

    async fn open_and_register(
        &self,
        connection: &mut dyn Connection,
    ) -> Result<(Arc<SignedSender>, Box<dyn FrameSource>), EventsClientError> {
        let interests = self.adapter.interested_events().map_err(|err| {
            EventsClientError::Config(format!("interested events retrieval failed: {err}"))
        })?;
        if interests.is_empty() {
            return Err(EventsClientError::Config(
                "interested events is required".to_string(),
            ));
        }

        let stream = connection.open_stream().await?;
        self.set_state(ClientState::Registering);

        let sender = Arc::new(SignedSender::new(
            stream.sink,
            self.identity.clone(),
            self.providers.signing.clone(),
            self.providers.config.tls_cert_hash(),
        ));
        let mut source = stream.source;
        handshake::register(
            &sender,
            source.as_mut(),
            interests,
            self.registration_timeout,
        )
        .await?;
        Ok((sender, source))
    }

    fn spawn_dispatch(&self, established: Established) -> Session {
        let acks = Arc::new(AckSlot::new());
        let dispatch = DispatchLoop::new(
            established.source,
            Arc::clone(&self.adapter),
            Arc::clone(&established.sender),
            Arc::clone(&acks),
        );

        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = done_tx.send(dispatch.run().await);
        });

        Session {
            connection: established.connection,
            sender: established.sender,
            acks,
            source: None,
            completion: Some(done_rx),
            dispatch: Some(task),
        }
    }
}

impl Drop for EventsClient {
    fn drop(&mut self) {
        if let Some(task) = self.session.as_mut().and_then(|session| session.dispatch.take()) {
            task.abort();
        }
    }
}
