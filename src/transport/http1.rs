//! HTTP/1.1 transport over TCP, with wire framing delegated to hyper.
//!
//! Each handle wraps a hyper [`http1::SendRequest`] whose connection driver runs on
//! a spawned tokio task. Requests are dispatched immediately, and [`Transport::receive`]
//! turns the eventual [`Response`] into frames one step at a time: the head first
//! (status and headers), then one body frame per call.
//!
//! When a handle is in [`Mode::Active`] and [`HttpOptions::events`] is set, the
//! driver task reports the end of the connection as an [`HttpMessage`], which the
//! owner can feed back through [`Transport::stream`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use http::header::HOST;
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body::Body as _;
use http_body_util::BodyExt as _;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument as _};

use super::body::OutgoingBody;
use super::{
    BodyChunk, ConnectRequest, Failed, Frame, HeaderList, HttpProtocol, Mode, Origin, Outcome,
    Payload, RequestHead, StreamRef, Streamed, TlsSecret, Transport, TransportError,
};
use crate::conn::OwnerId;

type ResponseFuture = Pin<Box<dyn Future<Output = hyper::Result<Response<Incoming>>> + Send>>;

static HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one established HTTP/1 connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    fn new() -> Self {
        Self(HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h1-{}", self.0)
    }
}

/// What happened to a connection, as reported by its driver task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpEvent {
    /// The peer closed the connection.
    Closed,

    /// The connection failed.
    Failed(String),
}

/// A transport-originated message for an [`HttpHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    /// The handle this message concerns.
    pub id: HandleId,

    /// What happened.
    pub event: HttpEvent,
}

/// Configuration for [`HttpTransport`] connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HttpOptions {
    /// The timeout for connecting to a remote address.
    pub connect_timeout: Option<Duration>,

    /// The idle time before TCP keep-alive probes are sent.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// How many streamed body chunks may be buffered ahead of the socket.
    pub body_buffer: usize,

    /// Where active-mode connection events are delivered.
    pub events: Option<mpsc::UnboundedSender<HttpMessage>>,

    /// TLS configuration for `https` origins.
    #[cfg(feature = "tls")]
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
            body_buffer: 16,
            events: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl HttpOptions {
    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Deliver active-mode connection events to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<HttpMessage>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use `config` for TLS connections.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }
}

struct InFlight {
    stream: StreamRef,
    body: Option<mpsc::Sender<Bytes>>,
    state: Receiving,
}

enum Receiving {
    Head(ResponseFuture),
    Body(Incoming),
}

/// Handle for one HTTP/1 connection established by [`HttpTransport`].
pub struct HttpHandle {
    id: HandleId,
    authority: HeaderValue,
    body_buffer: usize,
    sender: Option<http1::SendRequest<OutgoingBody>>,
    driver: Option<JoinHandle<()>>,
    active: Arc<AtomicBool>,
    inflight: Option<InFlight>,
    secrets: Vec<TlsSecret>,
}

impl HttpHandle {
    /// The identity of this connection.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The current message delivery mode.
    pub fn mode(&self) -> Mode {
        if self.active.load(Ordering::Acquire) {
            Mode::Active
        } else {
            Mode::Passive
        }
    }

    /// Tear down the connection. Any exchange in flight is abandoned.
    fn shutdown(&mut self) {
        self.inflight = None;
        self.sender = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl fmt::Debug for HttpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHandle")
            .field("id", &self.id)
            .field("open", &self.sender.is_some())
            .field("inflight", &self.inflight.as_ref().map(|i| i.stream))
            .field("mode", &self.mode())
            .finish()
    }
}

/// Transport adapter for HTTP/1.1 over TCP, and TLS with the `tls` feature.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    builder: http1::Builder,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            builder: http1::Builder::new(),
        }
    }
}

impl HttpTransport {
    /// Create a transport with hyper's default HTTP/1 settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport using a pre-configured hyper HTTP/1 builder.
    pub fn with_builder(builder: http1::Builder) -> Self {
        Self { builder }
    }

    /// Get the HTTP/1.1 configuration.
    pub fn http1(&mut self) -> &mut http1::Builder {
        &mut self.builder
    }

    async fn dial(origin: &Origin, options: &HttpOptions) -> Result<TcpStream, TransportError> {
        let connecting = TcpStream::connect((origin.host(), origin.port()));
        let stream = match options.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, connecting).await {
                Ok(stream) => stream?,
                Err(_) => {
                    trace!(?timeout, "connection timed out");
                    return Err(TransportError::Timeout);
                }
            },
            None => connecting.await?,
        };

        if let Err(error) = stream.set_nodelay(options.nodelay) {
            warn!("tcp set_nodelay error: {}", error);
        }

        if let Some(time) = options.keep_alive_timeout {
            let keepalive = socket2::TcpKeepalive::new().with_time(time);
            if let Err(error) = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                warn!("tcp set_keepalive error: {}", error);
            }
        }

        Ok(stream)
    }

    async fn handshake<IO>(
        &self,
        io: IO,
        origin: &Origin,
        options: &HttpOptions,
        secrets: Vec<TlsSecret>,
    ) -> Result<HttpHandle, TransportError>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        trace!("handshake h1");
        let authority = authority(origin)?;
        let (sender, conn) = self
            .builder
            .handshake::<_, OutgoingBody>(TokioIo::new(io))
            .await?;

        let id = HandleId::new();
        let active = Arc::new(AtomicBool::new(false));
        let notify = active.clone();
        let events = options.events.clone();

        let driver = tokio::spawn(
            async move {
                let event = match conn.await {
                    Ok(()) => {
                        trace!("h1 connection finished");
                        HttpEvent::Closed
                    }
                    Err(err) => {
                        debug!(%err, "h1 connection driver error");
                        HttpEvent::Failed(err.to_string())
                    }
                };

                if notify.load(Ordering::Acquire) {
                    if let Some(events) = events {
                        let _ = events.send(HttpMessage { id, event });
                    }
                }
            }
            .instrument(tracing::trace_span!("h1-driver", %id)),
        );

        trace!(%id, "handshake complete");
        Ok(HttpHandle {
            id,
            authority,
            body_buffer: options.body_buffer,
            sender: Some(sender),
            driver: Some(driver),
            active,
            inflight: None,
            secrets,
        })
    }

    #[cfg(feature = "tls")]
    async fn connect_tls(
        &self,
        request: &ConnectRequest<'_, HttpOptions>,
        stream: TcpStream,
    ) -> Result<HttpHandle, TransportError> {
        use super::tls::{pinned_config, SecretCapture};

        let base = match &request.options.tls {
            Some(config) => config.clone(),
            None => Arc::new(super::tls::default_tls_config()),
        };
        let capture = request
            .capture_secrets
            .then(|| Arc::new(SecretCapture::default()));
        let config = pinned_config(&base, request.protocols, capture.clone())?;

        let domain = rustls::pki_types::ServerName::try_from(request.origin.host().to_owned())
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidInput, error))?;

        trace!(host = %request.origin.host(), "tls handshake");
        let stream = tokio_rustls::TlsConnector::from(config)
            .connect(domain, stream)
            .await?;

        if let Some(alpn) = stream.get_ref().1.alpn_protocol() {
            if alpn != HttpProtocol::Http1.alpn() {
                debug!(alpn = ?String::from_utf8_lossy(alpn), "server negotiated a different protocol");
                return Err(TransportError::UnsupportedProtocol);
            }
        }

        let secrets = capture.map(|capture| capture.take()).unwrap_or_default();
        self.handshake(stream, request.origin, request.options, secrets)
            .await
    }

    #[cfg(not(feature = "tls"))]
    async fn connect_tls(
        &self,
        _request: &ConnectRequest<'_, HttpOptions>,
        _stream: TcpStream,
    ) -> Result<HttpHandle, TransportError> {
        warn!("https requested, but TLS support is not enabled");
        Err(TransportError::UnsupportedProtocol)
    }
}

fn authority(origin: &Origin) -> Result<HeaderValue, TransportError> {
    let default_port = if origin.is_https() { 443 } else { 80 };
    let authority = if origin.port() == default_port {
        origin.host().to_owned()
    } else {
        format!("{}:{}", origin.host(), origin.port())
    };

    HeaderValue::try_from(authority).map_err(|error| TransportError::protocol(error.to_string()))
}

fn header_list(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn build_request(
    head: RequestHead,
    body: OutgoingBody,
    authority: &HeaderValue,
) -> Result<Request<OutgoingBody>, http::Error> {
    let mut builder = Request::builder()
        .method(head.method)
        .uri(head.target)
        .version(http::Version::HTTP_11);

    if !head.headers.iter().any(|(name, _)| *name == HOST) {
        builder = builder.header(HOST, authority.clone());
    }

    for (name, value) in head.headers {
        builder = builder.header(name, value);
    }

    builder.body(body)
}

enum Step {
    Head(Result<hyper::Result<Response<Incoming>>, tokio::time::error::Elapsed>),
    Body(Result<Option<hyper::Result<http_body::Frame<Bytes>>>, tokio::time::error::Elapsed>),
}

impl Transport for HttpTransport {
    type Handle = HttpHandle;
    type Options = HttpOptions;
    type Message = HttpMessage;

    fn connect<'a>(
        &'a self,
        request: ConnectRequest<'a, HttpOptions>,
    ) -> BoxFuture<'a, Result<HttpHandle, TransportError>> {
        Box::pin(async move {
            if !request.protocols.contains(&HttpProtocol::Http1) {
                return Err(TransportError::UnsupportedProtocol);
            }

            let stream = Self::dial(request.origin, request.options).await?;
            if request.origin.is_https() {
                return self.connect_tls(&request, stream).await;
            }

            self.handshake(stream, request.origin, request.options, Vec::new())
                .await
        })
    }

    fn request(
        &self,
        mut handle: HttpHandle,
        head: RequestHead,
        payload: Payload,
    ) -> BoxFuture<'_, Outcome<HttpHandle, StreamRef>> {
        Box::pin(async move {
            if handle.inflight.is_some() {
                return Err(Failed::new(
                    handle,
                    TransportError::protocol("a request is already in flight"),
                ));
            }

            let (body_tx, body) = match payload {
                Payload::Empty => (None, OutgoingBody::Empty),
                Payload::Full(data) => (None, OutgoingBody::from(data)),
                Payload::Streaming => {
                    let (tx, body) = OutgoingBody::channel(handle.body_buffer);
                    (Some(tx), body)
                }
            };

            let request = match build_request(head, body, &handle.authority) {
                Ok(request) => request,
                Err(error) => {
                    return Err(Failed::new(
                        handle,
                        TransportError::protocol(error.to_string()),
                    ))
                }
            };

            let response = match handle.sender.as_mut() {
                None => Err(TransportError::Closed),
                Some(sender) => match sender.ready().await {
                    Ok(()) => Ok(Box::pin(sender.send_request(request)) as ResponseFuture),
                    Err(error) => Err(TransportError::from(error)),
                },
            };

            match response {
                Ok(response) => {
                    let stream = StreamRef::new();
                    trace!(id = %handle.id, %stream, "request dispatched");
                    handle.inflight = Some(InFlight {
                        stream,
                        body: body_tx,
                        state: Receiving::Head(response),
                    });
                    Ok((handle, stream))
                }
                Err(error) => Err(Failed::new(handle, error)),
            }
        })
    }

    fn stream_body(
        &self,
        mut handle: HttpHandle,
        stream: StreamRef,
        chunk: BodyChunk,
    ) -> BoxFuture<'_, Result<HttpHandle, Failed<HttpHandle>>> {
        Box::pin(async move {
            match handle.inflight.as_ref().map(|inflight| inflight.stream) {
                Some(expected) if expected != stream => {
                    return Err(Failed::new(
                        handle,
                        TransportError::StreamMismatch {
                            expected,
                            found: stream,
                        },
                    ))
                }
                None => {
                    return Err(Failed::new(
                        handle,
                        TransportError::protocol("no request in flight"),
                    ))
                }
                Some(_) => {}
            }

            let result = match chunk {
                BodyChunk::Data(data) => {
                    match handle.inflight.as_ref().and_then(|i| i.body.as_ref()) {
                        Some(tx) => tx.send(data).await.map_err(|_| TransportError::Closed),
                        None => Err(TransportError::protocol("request body already finished")),
                    }
                }
                BodyChunk::Eof => {
                    if let Some(inflight) = handle.inflight.as_mut() {
                        inflight.body = None;
                    }
                    Ok(())
                }
            };

            match result {
                Ok(()) => Ok(handle),
                Err(error) => Err(Failed::new(handle, error)),
            }
        })
    }

    fn receive(
        &self,
        mut handle: HttpHandle,
        timeout: Duration,
    ) -> BoxFuture<'_, Outcome<HttpHandle, Vec<Frame>>> {
        Box::pin(async move {
            let Some(mut inflight) = handle.inflight.take() else {
                return Err(Failed::new(
                    handle,
                    TransportError::protocol("no request in flight"),
                ));
            };
            let stream = inflight.stream;

            let step = match &mut inflight.state {
                Receiving::Head(response) => Step::Head(tokio::time::timeout(timeout, response).await),
                Receiving::Body(body) => Step::Body(tokio::time::timeout(timeout, body.frame()).await),
            };

            let mut frames = Vec::new();
            match step {
                // An abandoned response can't be resumed, so the connection is done.
                Step::Head(Err(_)) | Step::Body(Err(_)) => {
                    debug!(id = %handle.id, %stream, ?timeout, "receive timed out");
                    handle.shutdown();
                    return Err(Failed::new(handle, TransportError::Timeout));
                }
                Step::Head(Ok(Err(error))) | Step::Body(Ok(Some(Err(error)))) => {
                    handle.shutdown();
                    return Err(Failed::new(handle, error));
                }
                Step::Head(Ok(Ok(response))) => {
                    let (parts, body) = response.into_parts();
                    frames.push(Frame::Status(stream, parts.status));
                    frames.push(Frame::Headers(stream, header_list(&parts.headers)));
                    if body.is_end_stream() {
                        frames.push(Frame::Done(stream));
                    } else {
                        inflight.state = Receiving::Body(body);
                        handle.inflight = Some(inflight);
                    }
                }
                Step::Body(Ok(None)) => frames.push(Frame::Done(stream)),
                Step::Body(Ok(Some(Ok(frame)))) => {
                    match frame.into_data() {
                        Ok(data) => frames.push(Frame::Data(stream, data)),
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                frames.push(Frame::Headers(stream, header_list(&trailers)));
                            }
                        }
                    }

                    let finished =
                        matches!(&inflight.state, Receiving::Body(body) if body.is_end_stream());
                    if finished {
                        frames.push(Frame::Done(stream));
                    } else {
                        handle.inflight = Some(inflight);
                    }
                }
            }

            Ok((handle, frames))
        })
    }

    fn close(&self, mut handle: HttpHandle) -> BoxFuture<'_, HttpHandle> {
        handle.shutdown();
        trace!(id = %handle.id, "h1 connection closed");
        futures_util::future::ready(handle).boxed()
    }

    fn is_open(&self, handle: &HttpHandle) -> bool {
        handle
            .sender
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    fn set_mode(&self, handle: HttpHandle, mode: Mode) -> Result<HttpHandle, Failed<HttpHandle>> {
        if !self.is_open(&handle) {
            return Err(Failed::new(handle, TransportError::Closed));
        }
        handle
            .active
            .store(matches!(mode, Mode::Active), Ordering::Release);
        Ok(handle)
    }

    fn transfer_ownership(&self, handle: &HttpHandle, owner: OwnerId) -> Result<(), TransportError> {
        if !self.is_open(handle) {
            return Err(TransportError::Closed);
        }
        trace!(id = %handle.id, %owner, "ownership transferred");
        Ok(())
    }

    fn stream(&self, mut handle: HttpHandle, message: HttpMessage) -> Streamed<HttpHandle> {
        if message.id != handle.id {
            return Streamed::Unknown(handle);
        }

        handle.sender = None;
        handle.driver = None;
        match message.event {
            HttpEvent::Closed => Streamed::Ingested(handle, Vec::new()),
            HttpEvent::Failed(reason) => {
                Streamed::Error(Failed::new(handle, TransportError::Protocol(reason)))
            }
        }
    }

    fn tls_secrets(&self, handle: &HttpHandle) -> Vec<TlsSecret> {
        handle.secrets.clone()
    }
}
