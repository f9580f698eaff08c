//! Client settings and the configuration provider consumed by the client.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::events::error::{EventsClientError, TimeoutClamped};

/// Lower bound applied to the registration timeout.
pub const MIN_REGISTRATION_TIMEOUT: Duration = Duration::from_millis(100);
/// Upper bound applied to the registration timeout.
pub const MAX_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Registration timeout used when none is configured.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(3);
/// Fallback for any timeout purpose the provider leaves unset.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Websocket path of the event stream.
pub const DEFAULT_STREAM_PATH: &str = "/events";

/// Timeouts looked up from the [`EventsConfig`] provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TimeoutPurpose {
    /// Bound on dialing the event hub.
    EventHubConnection,
    /// Bound on waiting for the dispatch loop to drain in `stop`.
    EventHubShutdown,
}

/// Configuration provider consulted by the client.
pub trait EventsConfig: Send + Sync {
    fn timeout_or_default(&self, purpose: TimeoutPurpose) -> Duration;

    /// Hash binding control messages to the client's TLS credential.
    fn tls_cert_hash(&self) -> Vec<u8>;
}

/// In-memory [`EventsConfig`].
#[derive(Clone, Debug, Default)]
pub struct StaticEventsConfig {
    pub connection_timeout: Option<Duration>,
    pub shutdown_timeout: Option<Duration>,
    /// DER-encoded client TLS certificate, hashed into the channel binding.
    pub client_certificate: Option<Vec<u8>>,
}

impl StaticEventsConfig {
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn with_client_certificate(mut self, der: Vec<u8>) -> Self {
        self.client_certificate = Some(der);
        self
    }
}

impl EventsConfig for StaticEventsConfig {
    fn timeout_or_default(&self, purpose: TimeoutPurpose) -> Duration {
        let configured = match purpose {
            TimeoutPurpose::EventHubConnection => self.connection_timeout,
            TimeoutPurpose::EventHubShutdown => self.shutdown_timeout,
        };
        configured
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    fn tls_cert_hash(&self) -> Vec<u8> {
        self.client_certificate
            .as_deref()
            .map(|der| Sha256::digest(der).to_vec())
            .unwrap_or_default()
    }
}

/// Transport security requested for a connection attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecurityMode {
    Secured,
    Insecure,
}

impl SecurityMode {
    pub fn is_secured(self) -> bool {
        matches!(self, Self::Secured)
    }
}

/// Keepalive probing for the event stream.
///
/// Probing is enabled only when `time` is non-zero.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KeepaliveParams {
    /// Interval between pings.
    pub time: Duration,
    /// Extra silence tolerated after a ping before the stream is declared dead.
    pub timeout: Duration,
    /// Keep probing while no stream is active.
    pub permit_without_stream: bool,
}

impl KeepaliveParams {
    pub fn is_enabled(&self) -> bool {
        !self.time.is_zero()
    }
}

/// Connection surface of an events client.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    address: String,
    stream_path: String,
    tls_certificate: Option<Vec<u8>>,
    server_host_override: Option<String>,
    allow_insecure: bool,
    keepalive: KeepaliveParams,
    fail_fast: bool,
    registration_timeout: Duration,
}

impl ClientSettings {
    /// Settings for `address`, e.g. `grpcs://peer0.org1.example.com:7053`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into().trim().to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            tls_certificate: None,
            server_host_override: None,
            allow_insecure: false,
            keepalive: KeepaliveParams::default(),
            fail_fast: true,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }

    pub fn with_stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    /// Trusted peer certificate in DER form.
    pub fn with_tls_certificate(mut self, der: Vec<u8>) -> Self {
        self.tls_certificate = Some(der);
        self
    }

    /// Trusted peer certificate in PEM form; the first certificate is used.
    pub fn with_tls_certificate_pem(mut self, pem: &[u8]) -> Result<Self, EventsClientError> {
        let mut reader = pem;
        let cert = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| EventsClientError::Config("no certificate found in PEM".to_string()))?
            .map_err(|err| EventsClientError::Config(format!("invalid certificate PEM: {err}")))?;
        self.tls_certificate = Some(cert.as_ref().to_vec());
        Ok(self)
    }

    /// Name verified against the peer certificate instead of the address host.
    pub fn with_server_host_override(mut self, host: impl Into<String>) -> Self {
        self.server_host_override = Some(host.into());
        self
    }

    pub fn with_allow_insecure(mut self, allow_insecure: bool) -> Self {
        self.allow_insecure = allow_insecure;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveParams) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stream_path(&self) -> &str {
        &self.stream_path
    }

    pub fn tls_certificate(&self) -> Option<&[u8]> {
        self.tls_certificate.as_deref()
    }

    pub fn server_host_override(&self) -> Option<&str> {
        self.server_host_override.as_deref()
    }

    pub fn allow_insecure(&self) -> bool {
        self.allow_insecure
    }

    pub fn keepalive(&self) -> KeepaliveParams {
        self.keepalive
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn registration_timeout(&self) -> Duration {
        self.registration_timeout
    }

    /// Security mode implied by the address scheme.
    pub fn security_mode(&self) -> SecurityMode {
        attempt_secured(&self.address)
    }

    /// Address with any scheme prefix removed (`host:port`).
    pub fn host_port(&self) -> &str {
        to_address(&self.address)
    }
}

const INSECURE_SCHEMES: [&str; 3] = ["grpc://", "ws://", "http://"];
const SECURE_SCHEMES: [&str; 3] = ["grpcs://", "wss://", "https://"];

/// Plain schemes select an insecure transport; anything else attempts TLS.
pub fn attempt_secured(address: &str) -> SecurityMode {
    let lowered = address.to_ascii_lowercase();
    if INSECURE_SCHEMES
        .iter()
        .any(|scheme| lowered.starts_with(scheme))
    {
        SecurityMode::Insecure
    } else {
        SecurityMode::Secured
    }
}

/// Strips a known scheme prefix and trailing slashes.
pub fn to_address(address: &str) -> &str {
    let lowered = address.to_ascii_lowercase();
    let stripped = INSECURE_SCHEMES
        .iter()
        .chain(SECURE_SCHEMES.iter())
        .find(|scheme| lowered.starts_with(*scheme))
        .map_or(address, |scheme| &address[scheme.len()..]);
    stripped.trim_end_matches('/')
}

/// Clamps a registration timeout into
/// [`MIN_REGISTRATION_TIMEOUT`, `MAX_REGISTRATION_TIMEOUT`].
pub fn clamp_registration_timeout(requested: Duration) -> (Duration, Option<TimeoutClamped>) {
    let effective = requested.clamp(MIN_REGISTRATION_TIMEOUT, MAX_REGISTRATION_TIMEOUT);
    if effective == requested {
        return (requested, None);
    }
    let advisory = TimeoutClamped {
        requested,
        effective,
    };
    warn!(
        event = "registration_timeout_clamped",
        requested_ms = requested.as_millis() as u64,
        effective_ms = effective.as_millis() as u64
    );
    (effective, Some(advisory))
}
