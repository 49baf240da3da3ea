//! A single HTTP/1.1 connection and its lifecycle.
//!
//! A [`Connection`] owns at most one transport handle. It is created unconnected,
//! acquires a handle on [`Connection::connect`], and drives exchanges over it with
//! [`Connection::request`]. Every transport operation moves the handle into the
//! adapter and stores whatever comes back, so the connection always reflects the
//! adapter's latest state, including after failures.
//!
//! Pool policy lives elsewhere: after each call the owner inspects the connection
//! ([`Connection::is_open`], [`Connection::idle_time`], [`Connection::is_reusable`])
//! to decide whether to reuse, discard or close it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tracing::{debug, error, trace, warn, Instrument as _};

use crate::error::Error;
use crate::keylog::KeyLogFile;
use crate::telemetry::{Event, Measurements, Metadata, Telemetry};
use crate::transport::{
    ConnectRequest, Failed, HttpProtocol, Mode, Origin, Streamed, Transport, TransportError,
};

mod driver;
mod idle;

pub use self::idle::{reusable, MaxIdle, TimeUnit};

/// Connections only ever negotiate HTTP/1.1, even over adapters which could offer more.
const PROTOCOLS: [HttpProtocol; 1] = [HttpProtocol::Http1];

static OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the execution context which controls a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// A new, unique owner.
    pub fn new() -> Self {
        Self(OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// The transport handle held by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handle<H> {
    /// The connection has never been established.
    Disconnected,

    /// The adapter's latest handle. It may since have been closed.
    Connected(H),

    /// The handle was consumed by an operation which never returned it, either
    /// because the adapter panicked or because the operation was dropped.
    ///
    /// A lost connection is closed for good and will not reconnect.
    Lost,
}

impl<H> Default for Handle<H> {
    fn default() -> Self {
        Handle::Disconnected
    }
}

impl<H> Handle<H> {
    /// The handle, if connected.
    pub fn as_connected(&self) -> Option<&H> {
        match self {
            Handle::Connected(handle) => Some(handle),
            Handle::Disconnected | Handle::Lost => None,
        }
    }

    /// Is an adapter handle held?
    pub fn is_connected(&self) -> bool {
        matches!(self, Handle::Connected(_))
    }

    /// Was the handle lost to a fault?
    pub fn is_lost(&self) -> bool {
        matches!(self, Handle::Lost)
    }

    /// Take the handle for an adapter call, leaving [`Handle::Lost`] until it is put back.
    fn checkout(&mut self) -> Option<H> {
        match std::mem::replace(self, Handle::Lost) {
            Handle::Connected(handle) => Some(handle),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// How long the connection may sit idle and still be reused.
    pub max_idle_time: MaxIdle,

    /// Where to log TLS secrets for `https` connections.
    ///
    /// When unset, the `SSLKEYLOGFILE` environment variable is consulted.
    pub ssl_key_log_file: Option<Utf8PathBuf>,
}

impl Config {
    /// Set the maximum idle time.
    pub fn with_max_idle_time(mut self, max_idle_time: impl Into<MaxIdle>) -> Self {
        self.max_idle_time = max_idle_time.into();
        self
    }

    /// Log TLS secrets to `path`.
    pub fn with_ssl_key_log_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.ssl_key_log_file = Some(path.into());
        self
    }

    fn key_log(&self, origin: &Origin) -> Option<KeyLogFile> {
        if !origin.is_https() {
            return None;
        }

        match &self.ssl_key_log_file {
            Some(path) => Some(KeyLogFile::new(path.clone())),
            None => KeyLogFile::from_env(),
        }
    }
}

/// Result of [`Connection::discard`].
#[derive(Debug)]
pub enum Discard {
    /// The connection has no handle, or the message belongs to another handle.
    Unknown,

    /// The message was consumed by the connection's handle.
    Drained,

    /// The message reported a protocol error.
    Error(TransportError),
}

/// A single HTTP/1.1 connection to an origin.
pub struct Connection<T: Transport> {
    transport: T,
    origin: Origin,
    options: T::Options,
    owner: OwnerId,
    last_checkin: Instant,
    max_idle_time: MaxIdle,
    key_log: Option<KeyLogFile>,
    telemetry: Telemetry,
    handle: Handle<T::Handle>,
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("origin", &self.origin)
            .field("owner", &self.owner)
            .field("connected", &self.handle.is_connected())
            .field("max_idle_time", &self.max_idle_time)
            .field("idle_time", &self.idle_time())
            .finish()
    }
}

impl<T: Transport> Connection<T> {
    /// Create an unconnected connection to `origin`, owned by `owner`.
    pub fn new(transport: T, origin: Origin, options: T::Options, owner: OwnerId) -> Self {
        let config = Config::default();
        let key_log = config.key_log(&origin);
        Self {
            transport,
            origin,
            options,
            owner,
            last_checkin: Instant::now(),
            max_idle_time: config.max_idle_time,
            key_log,
            telemetry: Telemetry::default(),
            handle: Handle::Disconnected,
        }
    }

    /// Apply `config`.
    pub fn with_config(mut self, config: Config) -> Self {
        self.max_idle_time = config.max_idle_time;
        self.key_log = config.key_log(&self.origin);
        self
    }

    /// Report telemetry to `telemetry` instead of `tracing`.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// The origin this connection talks to.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// The execution context which controls this connection.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Transport options passed through to the adapter.
    pub fn options(&self) -> &T::Options {
        &self.options
    }

    /// The transport handle.
    pub fn handle(&self) -> &Handle<T::Handle> {
        &self.handle
    }

    /// The transport adapter.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The maximum idle time for reuse.
    pub fn max_idle_time(&self) -> MaxIdle {
        self.max_idle_time
    }

    pub(crate) fn metadata(&self) -> Metadata {
        Metadata::new(&self.origin)
    }

    /// Establish the connection, or report reuse if it is already established.
    ///
    /// A connection with a handle makes no adapter call and emits a
    /// `reused_connection` event. Otherwise the adapter is asked for an HTTP/1.1
    /// handle; on failure the connection stays disconnected. A connection whose
    /// handle was lost fails with [`Error::Closed`].
    pub async fn connect(&mut self) -> Result<(), Error> {
        let metadata = self.metadata();

        if self.handle.is_lost() {
            debug!(origin = %self.origin, "refusing to reconnect a lost connection");
            return Err(Error::Closed);
        }

        if self.handle.is_connected() {
            trace!(origin = %self.origin, "reusing connection");
            self.telemetry
                .event(Event::ReusedConnection, Measurements::default(), &metadata);
            return Ok(());
        }

        let token = self
            .telemetry
            .start(Event::Connect, &metadata, Measurements::default());

        let span = tracing::debug_span!("connect", origin = %self.origin);
        let request = ConnectRequest::new(&self.origin, &self.options, &PROTOCOLS)
            .with_secrets(self.key_log.is_some());

        match self.transport.connect(request).instrument(span).await {
            Ok(handle) => {
                self.telemetry
                    .stop(Event::Connect, token, &metadata, Measurements::default());

                if let Some(key_log) = &self.key_log {
                    let secrets = self.transport.tls_secrets(&handle);
                    if let Err(error) = key_log.write(&secrets) {
                        warn!(path = %key_log.path(), "unable to log TLS secrets: {error}");
                    }
                }

                debug!(origin = %self.origin, "connected");
                self.handle = Handle::Connected(handle);
                self.checkin();
                Ok(())
            }
            Err(error) => {
                debug!(origin = %self.origin, "connect failed: {error}");
                self.telemetry.stop(
                    Event::Connect,
                    token,
                    &metadata.with_error(&error),
                    Measurements::default(),
                );
                Err(Error::Connect(error))
            }
        }
    }

    /// Hand control of the connection to `owner`.
    ///
    /// If the adapter rejects the handoff, the owner is unchanged.
    pub fn transfer(&mut self, owner: OwnerId) -> Result<(), Error> {
        if let Handle::Connected(handle) = &self.handle {
            self.transport
                .transfer_ownership(handle, owner)
                .map_err(Error::Transfer)?;
        }

        trace!(from = %self.owner, to = %owner, "transferred connection");
        self.owner = owner;
        Ok(())
    }

    /// Is the connection established and alive?
    pub fn is_open(&self) -> bool {
        match &self.handle {
            Handle::Connected(handle) => self.transport.is_open(handle),
            Handle::Disconnected | Handle::Lost => false,
        }
    }

    /// Time since the connection last checked in.
    pub fn idle_time(&self) -> Duration {
        self.last_checkin.elapsed()
    }

    /// Time since the connection last checked in, in `unit`.
    pub fn idle_time_in(&self, unit: TimeUnit) -> u128 {
        unit.convert(self.idle_time())
    }

    /// Can the connection be reused, given how long it has been idle?
    pub fn is_reusable(&self) -> bool {
        reusable(self.max_idle_time, self.idle_time())
    }

    /// Mark the connection idle as of now.
    pub fn checkin(&mut self) {
        self.last_checkin = Instant::now();
    }

    /// Choose how transport-originated messages reach the owner.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), Error> {
        let Some(handle) = self.handle.checkout() else {
            return Err(Error::Closed);
        };

        match self.transport.set_mode(handle, mode) {
            Ok(handle) => {
                self.handle = Handle::Connected(handle);
                Ok(())
            }
            Err(Failed { handle, error }) => {
                debug!(?mode, "unable to set mode: {error}");
                self.handle = Handle::Connected(handle);
                Err(Error::Closed)
            }
        }
    }

    /// Drain a stray transport message while the connection is idle.
    ///
    /// This never panics. If the adapter panics while ingesting the message, its
    /// handle is lost and the connection is left [`Handle::Lost`].
    pub fn discard(&mut self, message: T::Message) -> Discard {
        let Some(handle) = self.handle.checkout() else {
            return Discard::Unknown;
        };

        let transport = &self.transport;
        let streamed = catch_unwind(AssertUnwindSafe(move || transport.stream(handle, message)));

        match streamed {
            Ok(Streamed::Unknown(handle)) => {
                self.handle = Handle::Connected(handle);
                Discard::Unknown
            }
            Ok(Streamed::Ingested(handle, frames)) => {
                trace!(frames = frames.len(), "discarded transport message");
                self.handle = Handle::Connected(handle);
                Discard::Drained
            }
            Ok(Streamed::Error(Failed { handle, error })) => {
                self.handle = Handle::Connected(handle);
                Discard::Error(error)
            }
            Err(_) => {
                error!(origin = %self.origin, "transport panicked while discarding a message");
                Discard::Error(TransportError::protocol("transport panicked"))
            }
        }
    }

    /// Close the connection. Closing a disconnected or lost connection does nothing.
    pub async fn close(&mut self) {
        let Some(handle) = self.handle.checkout() else {
            return;
        };

        trace!(origin = %self.origin, "closing connection");
        let handle = self.transport.close(handle).await;
        self.handle = Handle::Connected(handle);
    }
}
