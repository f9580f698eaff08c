//! Transport seams and the WebSocket implementation.
//!
//! A [`Transport`] dials a [`Connection`], a connection opens one
//! [`EventStream`], and the stream splits into a [`FrameSink`] for signed
//! envelopes and a [`FrameSource`] for inbound control messages.
//!
//! The WebSocket stream runs one writer task that owns the socket's write
//! half. Outbound frames, the send-half close and keepalive pings are all
//! funneled through it, so the sink never contends with the pinger.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::events::config::{ClientSettings, KeepaliveParams, SecurityMode};
use crate::events::error::{ConnectStage, EventsClientError};
use crate::events::proto::{ControlMessage, SignedEnvelope};
use crate::retry::{next_backoff, with_timeout};

const MIN_DIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_DIAL_BACKOFF: Duration = Duration::from_secs(2);
const WRITER_QUEUE: usize = 64;

/// Dials connections to the event source.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        mode: SecurityMode,
        dial_timeout: Duration,
    ) -> Result<Box<dyn Connection>, EventsClientError>;
}

/// An established connection that carries at most one event stream.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_stream(&mut self) -> Result<EventStream, EventsClientError>;

    /// Tears the connection down; an open stream's source then yields an
    /// error.
    async fn close(&mut self) -> Result<(), EventsClientError>;
}

/// Both halves of an open event stream.
pub struct EventStream {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&mut self, envelope: &SignedEnvelope) -> Result<(), EventsClientError>;

    /// Closes the send half. The peer is expected to finish its side in
    /// response.
    async fn close_send(&mut self) -> Result<(), EventsClientError>;
}

/// Read half of an event stream.
///
/// `recv` must be cancel-safe: dropping the future before it completes
/// must not lose a frame.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Next inbound message, `Some(Err)` on a receive failure, `None` once the
    /// peer has ended the stream.
    async fn recv(&mut self) -> Option<Result<ControlMessage, EventsClientError>>;
}

trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type Socket = WebSocketStream<Box<dyn StreamIo>>;

/// TCP + optional TLS + WebSocket transport.
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    settings: Arc<ClientSettings>,
}

impl WebSocketTransport {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    async fn dial(&self, dial_timeout: Duration) -> Result<TcpStream, EventsClientError> {
        let address = self.settings.host_port();
        let fail_fast = self.settings.fail_fast();

        let dial = async {
            let mut backoff = MIN_DIAL_BACKOFF;
            loop {
                match TcpStream::connect(address).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) if fail_fast => return Err(err),
                    Err(err) => {
                        debug!(
                            event = "dial_retry",
                            address,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff, MAX_DIAL_BACKOFF);
                    }
                }
            }
        };

        match with_timeout(dial_timeout, dial).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(EventsClientError::connection(
                ConnectStage::Dial,
                self.settings.address(),
                err,
            )),
            Err(_) => Err(EventsClientError::connection(
                ConnectStage::Dial,
                self.settings.address(),
                format!("dial timeout after {dial_timeout:?}"),
            )),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        mode: SecurityMode,
        dial_timeout: Duration,
    ) -> Result<Box<dyn Connection>, EventsClientError> {
        let tcp = self.dial(dial_timeout).await?;
        if let Err(err) = tcp.set_nodelay(true) {
            debug!(event = "set_nodelay_failed", error = %err);
        }
        debug!(
            event = "transport_dialed",
            address = self.settings.address(),
            secured = mode.is_secured()
        );
        Ok(Box::new(WebSocketConnection {
            settings: Arc::clone(&self.settings),
            mode,
            open_timeout: dial_timeout,
            tcp: Some(tcp),
            writer: None,
        }))
    }
}

struct WriterHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct WebSocketConnection {
    settings: Arc<ClientSettings>,
    mode: SecurityMode,
    open_timeout: Duration,
    tcp: Option<TcpStream>,
    writer: Option<WriterHandle>,
}

impl WebSocketConnection {
    async fn handshake(&self, tcp: TcpStream) -> Result<Socket, String> {
        let io: Box<dyn StreamIo> = if self.mode.is_secured() {
            Box::new(self.tls_handshake(tcp).await?)
        } else {
            Box::new(tcp)
        };

        let scheme = if self.mode.is_secured() { "wss" } else { "ws" };
        let url = format!(
            "{scheme}://{}{}",
            self.settings.host_port(),
            self.settings.stream_path()
        );
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|err| format!("invalid stream url {url}: {err}"))?;
        let (socket, _) = tokio_tungstenite::client_async(request, io)
            .await
            .map_err(|err| format!("websocket upgrade failed: {err}"))?;
        Ok(socket)
    }

    async fn tls_handshake(
        &self,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, String> {
        let config = tls_client_config(self.settings.tls_certificate())?;
        let name = self
            .settings
            .server_host_override()
            .unwrap_or_else(|| host_of(self.settings.host_port()))
            .to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|err| format!("invalid server name {name}: {err}"))?;

        TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .map_err(|err| format!("tls handshake failed: {err}"))
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn open_stream(&mut self) -> Result<EventStream, EventsClientError> {
        let tcp = self.tcp.take().ok_or_else(|| {
            EventsClientError::connection(
                ConnectStage::OpenStream,
                self.settings.address(),
                "connection already carries a stream",
            )
        })?;

        let socket = match with_timeout(self.open_timeout, self.handshake(tcp)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(reason)) => {
                return Err(EventsClientError::connection(
                    ConnectStage::OpenStream,
                    self.settings.address(),
                    reason,
                ))
            }
            Err(_) => {
                return Err(EventsClientError::connection(
                    ConnectStage::OpenStream,
                    self.settings.address(),
                    format!("stream open timeout after {:?}", self.open_timeout),
                ))
            }
        };

        let keepalive = self.settings.keepalive();
        let (write, read) = socket.split();
        let (commands_tx, commands_rx) = mpsc::channel(WRITER_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_writer(
            write,
            commands_rx,
            shutdown_rx.clone(),
            keepalive,
        ));
        self.writer = Some(WriterHandle {
            shutdown: shutdown_tx,
            task,
        });

        info!(
            event = "event_stream_opened",
            address = self.settings.address(),
            secured = self.mode.is_secured()
        );
        Ok(EventStream {
            sink: Box::new(WsFrameSink {
                commands: commands_tx,
            }),
            source: Box::new(WsFrameSource {
                read,
                shutdown: shutdown_rx,
                idle_timeout: keepalive
                    .is_enabled()
                    .then(|| keepalive.time.saturating_add(keepalive.timeout)),
            }),
        })
    }

    async fn close(&mut self) -> Result<(), EventsClientError> {
        self.tcp = None;
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let _ = writer.shutdown.send(true);

        let mut task = writer.task;
        match with_timeout(self.open_timeout, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(EventsClientError::Stream(format!(
                "connection writer failed: {err}"
            ))),
            Err(_) => {
                task.abort();
                Err(EventsClientError::Stream(format!(
                    "connection close timeout after {:?}",
                    self.open_timeout
                )))
            }
        }
    }
}

fn tls_client_config(trusted: Option<&[u8]>) -> Result<ClientConfig, String> {
    let mut roots = RootCertStore::empty();
    match trusted {
        Some(der) => roots
            .add(CertificateDer::from(der.to_vec()))
            .map_err(|err| format!("invalid trusted certificate: {err}"))?,
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|err| format!("tls config failed: {err}"))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(config)
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(host_port: &str) -> &str {
    let host = match host_port.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => host_port,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

enum WriterCommand {
    Frame {
        text: String,
        ack: oneshot::Sender<Result<(), EventsClientError>>,
    },
    CloseSend {
        ack: oneshot::Sender<Result<(), EventsClientError>>,
    },
}

async fn run_writer(
    mut write: SplitSink<Socket, Message>,
    mut commands: mpsc::Receiver<WriterCommand>,
    mut shutdown: watch::Receiver<bool>,
    keepalive: KeepaliveParams,
) {
    let mut pings = keepalive.is_enabled().then(|| {
        let start = tokio::time::Instant::now() + keepalive.time;
        tokio::time::interval_at(start, keepalive.time)
    });
    let mut send_closed = false;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    WriterCommand::Frame { text, ack } => {
                        let result = if send_closed {
                            Err(EventsClientError::Stream("send half closed".to_string()))
                        } else {
                            write.send(Message::Text(text)).await.map_err(EventsClientError::from)
                        };
                        let _ = ack.send(result);
                    }
                    WriterCommand::CloseSend { ack } => {
                        let result = if send_closed {
                            Ok(())
                        } else {
                            send_closed = true;
                            write.send(Message::Close(None)).await.map_err(EventsClientError::from)
                        };
                        let _ = ack.send(result);
                    }
                }
            }
            _ = tick(&mut pings), if !send_closed => {
                if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                    debug!(event = "keepalive_ping_failed", error = %err);
                }
            }
        }
    }

    if !send_closed {
        let _ = write.send(Message::Close(None)).await;
    }
    let _ = write.close().await;
    debug!(event = "stream_writer_stopped");
}

async fn tick(pings: &mut Option<tokio::time::Interval>) {
    match pings {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct WsFrameSink {
    commands: mpsc::Sender<WriterCommand>,
}

impl WsFrameSink {
    async fn submit(
        &self,
        command: WriterCommand,
        ack: oneshot::Receiver<Result<(), EventsClientError>>,
    ) -> Result<(), EventsClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EventsClientError::Stream("connection closed".to_string()))?;
        ack.await
            .map_err(|_| EventsClientError::Stream("connection closed".to_string()))?
    }
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, envelope: &SignedEnvelope) -> Result<(), EventsClientError> {
        let text = envelope.to_text()?;
        let (ack, done) = oneshot::channel();
        self.submit(WriterCommand::Frame { text, ack }, done).await
    }

    async fn close_send(&mut self) -> Result<(), EventsClientError> {
        let (ack, done) = oneshot::channel();
        self.submit(WriterCommand::CloseSend { ack }, done).await
    }
}

struct WsFrameSource {
    read: SplitStream<Socket>,
    shutdown: watch::Receiver<bool>,
    idle_timeout: Option<Duration>,
}

async fn next_frame(
    read: &mut SplitStream<Socket>,
    idle_timeout: Option<Duration>,
) -> Option<Result<Message, WsError>> {
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, read.next()).await {
            Ok(next) => next,
            Err(_) => Some(Err(WsError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("keepalive timeout after {limit:?}"),
            )))),
        },
        None => read.next().await,
    }
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn recv(&mut self) -> Option<Result<ControlMessage, EventsClientError>> {
        loop {
            if *self.shutdown.borrow() {
                return Some(Err(EventsClientError::Stream(
                    "connection closed".to_string(),
                )));
            }

            let frame = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Some(Err(EventsClientError::Stream(
                            "connection closed".to_string(),
                        )));
                    }
                    continue;
                }
                frame = next_frame(&mut self.read, self.idle_timeout) => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Some(ControlMessage::from_text(&text).map_err(|err| {
                        EventsClientError::Protocol(format!("invalid inbound frame: {err}"))
                    }));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(ControlMessage::from_slice(&bytes).map_err(|err| {
                        EventsClientError::Protocol(format!("invalid inbound frame: {err}"))
                    }));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => return None,
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return None
                }
                Some(Err(err)) => return Some(Err(err.into())),
                None => return None,
            }
        }
    }
}
