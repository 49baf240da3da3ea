//! Transport adapters move bytes for a single HTTP/1.1 connection.
//!
//! A [`Transport`] owns no connection state itself. Every operation takes the
//! transport handle by value and hands back its replacement, so a handle is never
//! mutated in place and a caller can never observe a stale one. Operations which
//! fail after a handle was established return [`Failed`], which carries the
//! adapter's latest handle alongside the error.
//!
//! Two adapters are provided:
//! - [`HttpTransport`]: TCP (and TLS with the `tls` feature), with framing
//!   delegated to `hyper`'s HTTP/1 client connection.
//! - [`mock::MockTransport`]: a scripted adapter which records every call, for
//!   testing code which drives connections.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::uri::Scheme;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;

use crate::conn::OwnerId;

mod body;
pub mod http1;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
#[cfg(feature = "tls")]
pub mod tls;

pub use self::http1::{HttpHandle, HttpMessage, HttpOptions, HttpTransport};

/// An ordered list of header fields, as they appear on the wire.
pub type HeaderList = Vec<(HeaderName, HeaderValue)>;

/// Outcome of a transport operation which produces a value alongside the new handle.
pub type Outcome<H, T> = Result<(H, T), Failed<H>>;

/// The remote endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Origin {
    /// Create a new origin from its parts.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// The URI scheme, `http` or `https`.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The remote host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The remote port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Is this origin reached over TLS?
    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// The HTTP protocol to negotiate for a connection.
///
/// Connections driven by this crate always pin negotiation to [`HttpProtocol::Http1`],
/// even when an adapter could offer more.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum HttpProtocol {
    /// Connect using HTTP/1.1
    Http1,

    /// Connect using HTTP/2
    Http2,
}

impl HttpProtocol {
    /// The ALPN identifier for this protocol.
    pub fn alpn(&self) -> &'static [u8] {
        match self {
            Self::Http1 => b"http/1.1",
            Self::Http2 => b"h2",
        }
    }

    /// Convert the protocol to an HTTP version.
    pub fn version(&self) -> http::Version {
        match self {
            Self::Http1 => http::Version::HTTP_11,
            Self::Http2 => http::Version::HTTP_2,
        }
    }
}

/// Everything an adapter needs to establish a new handle.
#[derive(Debug)]
#[non_exhaustive]
pub struct ConnectRequest<'a, O> {
    /// Where to connect.
    pub origin: &'a Origin,

    /// Adapter specific options, passed through untouched.
    pub options: &'a O,

    /// Protocols the adapter may negotiate.
    pub protocols: &'a [HttpProtocol],

    /// Should the adapter capture TLS secrets for [`Transport::tls_secrets`]?
    pub capture_secrets: bool,
}

impl<'a, O> ConnectRequest<'a, O> {
    /// Create a request to connect to `origin` with the given protocols.
    pub fn new(origin: &'a Origin, options: &'a O, protocols: &'a [HttpProtocol]) -> Self {
        Self {
            origin,
            options,
            protocols,
            capture_secrets: false,
        }
    }

    /// Ask the adapter to capture TLS secrets during the handshake.
    pub fn with_secrets(mut self, capture: bool) -> Self {
        self.capture_secrets = capture;
        self
    }
}

static STREAM_REF: AtomicU64 = AtomicU64::new(1);

/// Correlates a sent request with the response frames it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamRef(u64);

impl StreamRef {
    /// Issue a new, unique stream reference.
    pub fn new() -> Self {
        Self(STREAM_REF.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for StreamRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref-{}", self.0)
    }
}

/// The start of a request: method, request target and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method
    pub method: Method,

    /// Request target in origin form (path and optional query).
    pub target: String,

    /// Header fields, in order.
    pub headers: HeaderList,
}

/// How the request body accompanies the head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No body.
    Empty,

    /// The whole body, sent together with the head.
    Full(Bytes),

    /// The body follows in [`Transport::stream_body`] calls.
    Streaming,
}

/// A piece of a streamed request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyChunk {
    /// More body data.
    Data(Bytes),

    /// The body is complete.
    Eof,
}

/// A response framing entry, tagged with the stream it belongs to.
#[derive(Debug)]
pub enum Frame {
    /// The response status line.
    Status(StreamRef, StatusCode),

    /// Response headers, or trailers when they follow body data.
    Headers(StreamRef, HeaderList),

    /// A chunk of response body.
    Data(StreamRef, Bytes),

    /// The response is complete.
    Done(StreamRef),

    /// The response failed.
    Error(StreamRef, TransportError),
}

impl Frame {
    /// The stream this frame belongs to.
    pub fn stream(&self) -> StreamRef {
        match self {
            Frame::Status(stream, _)
            | Frame::Headers(stream, _)
            | Frame::Data(stream, _)
            | Frame::Done(stream)
            | Frame::Error(stream, _) => *stream,
        }
    }
}

/// How transport-originated messages reach the connection's owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Messages are delivered to the owner as they happen.
    Active,

    /// Messages are only observed when the owner asks for them.
    #[default]
    Passive,
}

/// A TLS secret exported by an adapter, in NSS key log terms.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsSecret {
    /// Key log label, e.g. `CLIENT_HANDSHAKE_TRAFFIC_SECRET`.
    pub label: String,

    /// The client random of the session.
    pub client_random: Vec<u8>,

    /// The secret itself.
    pub secret: Vec<u8>,
}

impl fmt::Debug for TlsSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSecret")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Result of handing a transport-originated message to an adapter.
#[derive(Debug)]
pub enum Streamed<H> {
    /// The message does not belong to this handle.
    Unknown(H),

    /// The message was consumed, possibly producing frames.
    Ingested(H, Vec<Frame>),

    /// The message reported a protocol error.
    Error(Failed<H>),
}

/// A failed transport operation, with the handle the adapter left behind.
#[derive(Debug)]
pub struct Failed<H> {
    /// The adapter's latest handle.
    pub handle: H,

    /// What went wrong.
    pub error: TransportError,
}

impl<H> Failed<H> {
    /// Pair an error with the handle it leaves behind.
    pub fn new(handle: H, error: impl Into<TransportError>) -> Self {
        Self {
            handle,
            error: error.into(),
        }
    }
}

/// Errors reported by transport adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// No handle has been established.
    #[error("not connected")]
    NotConnected,

    /// The handle is closed.
    #[error("connection closed")]
    Closed,

    /// No activity within the allotted time.
    #[error("timeout")]
    Timeout,

    /// The adapter cannot speak any of the requested protocols.
    #[error("unsupported protocol")]
    UnsupportedProtocol,

    /// A frame arrived for a stream other than the one in flight.
    #[error("frame for {found} while awaiting {expected}")]
    StreamMismatch {
        /// The stream in flight.
        expected: StreamRef,

        /// The stream the frame was tagged with.
        found: StreamRef,
    },

    /// Malformed or unexpected framing.
    #[error("protocol: {0}")]
    Protocol(String),

    /// I/O error on the underlying socket.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Error reported by the HTTP/1 machinery.
    #[error("http: {0}")]
    Http(#[from] hyper::Error),
}

impl TransportError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        TransportError::Protocol(message.into())
    }
}

/// An adapter exposing one HTTP/1.1 wire connection.
///
/// Handles are values: each operation consumes the current handle and returns the
/// next one. Implementations must return a handle from every fallible operation,
/// including on failure, so the caller's view of the connection stays current.
pub trait Transport: Send + Sync + 'static {
    /// The connection handle.
    type Handle: Send + 'static;

    /// Opaque connection options, passed through from the connection.
    type Options: fmt::Debug + Send + Sync + 'static;

    /// Transport-originated messages, see [`Transport::stream`].
    type Message: Send + 'static;

    /// Establish a new handle.
    fn connect<'a>(
        &'a self,
        request: ConnectRequest<'a, Self::Options>,
    ) -> BoxFuture<'a, Result<Self::Handle, TransportError>>;

    /// Send a request head, with the body when it is not streamed.
    fn request(
        &self,
        handle: Self::Handle,
        head: RequestHead,
        payload: Payload,
    ) -> BoxFuture<'_, Outcome<Self::Handle, StreamRef>>;

    /// Send one piece of a streamed request body.
    fn stream_body(
        &self,
        handle: Self::Handle,
        stream: StreamRef,
        chunk: BodyChunk,
    ) -> BoxFuture<'_, Result<Self::Handle, Failed<Self::Handle>>>;

    /// Wait up to `timeout` for response frames.
    fn receive(
        &self,
        handle: Self::Handle,
        timeout: Duration,
    ) -> BoxFuture<'_, Outcome<Self::Handle, Vec<Frame>>>;

    /// Close the handle, returning it in its closed state.
    fn close(&self, handle: Self::Handle) -> BoxFuture<'_, Self::Handle>;

    /// Is the handle still usable?
    fn is_open(&self, handle: &Self::Handle) -> bool;

    /// Switch how transport-originated messages are delivered.
    fn set_mode(
        &self,
        handle: Self::Handle,
        mode: Mode,
    ) -> Result<Self::Handle, Failed<Self::Handle>>;

    /// Hand control of the handle to another owner.
    fn transfer_ownership(&self, handle: &Self::Handle, owner: OwnerId)
        -> Result<(), TransportError>;

    /// Ingest a transport-originated message.
    fn stream(&self, handle: Self::Handle, message: Self::Message) -> Streamed<Self::Handle>;

    /// TLS secrets captured while connecting, if any.
    fn tls_secrets(&self, _handle: &Self::Handle) -> Vec<TlsSecret> {
        Vec::new()
    }
}
