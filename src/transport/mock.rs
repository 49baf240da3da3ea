//! A scripted transport, suitable for testing connection behavior without a network.
//!
//! [`MockTransport`] records every adapter call it receives. Responses are scripted
//! as a queue of [`MockReply`] values, one per `receive` call; when the queue runs
//! dry, `receive` reports a timeout.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use tracing::trace;

use super::{
    BodyChunk, ConnectRequest, Failed, Frame, HeaderList, HttpProtocol, Mode, Outcome, Payload,
    RequestHead, StreamRef, Streamed, TlsSecret, Transport, TransportError,
};
use crate::conn::OwnerId;

static IDENT: AtomicU16 = AtomicU16::new(1);

/// An adapter call, as recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `connect` with the offered protocols.
    Connect(Vec<HttpProtocol>),

    /// `request` with the head and payload.
    Request {
        /// Request method.
        method: Method,
        /// Request target.
        target: String,
        /// Body sent with the head.
        payload: Payload,
    },

    /// `stream_body`
    Body(BodyChunk),

    /// `receive` with its timeout.
    Receive(Duration),

    /// `close`
    Close,

    /// `set_mode`
    SetMode(Mode),

    /// `transfer_ownership`
    Transfer(OwnerId),

    /// `stream`
    Stream,
}

/// A frame to deliver, tagged with the in-flight stream when sent.
#[derive(Debug, Clone)]
pub enum MockFrame {
    /// Response status.
    Status(StatusCode),
    /// Response headers.
    Headers(HeaderList),
    /// Response body data.
    Data(Bytes),
    /// End of response.
    Done,
    /// Response error.
    Error(String),
    /// Body data for some other stream.
    Stray,
}

/// What one `receive` call produces.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// A batch of frames.
    Frames(Vec<MockFrame>),
    /// No activity before the timeout.
    Timeout,
    /// The peer closed the connection.
    Closed,
    /// The adapter panics.
    Panic(&'static str),
}

/// A message originating from a mock handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    /// The handle this message belongs to.
    pub id: u16,
    /// A protocol error carried by the message.
    pub error: Option<&'static str>,
}

/// Handle produced by [`MockTransport`].
///
/// Every operation returns a handle with a bumped generation, which makes it easy to
/// check that callers keep the latest handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockHandle {
    id: u16,
    generation: u32,
    open: bool,
    mode: Mode,
    stream: Option<StreamRef>,
    secrets: Vec<TlsSecret>,
}

impl MockHandle {
    fn new(secrets: Vec<TlsSecret>) -> Self {
        let handle = Self {
            id: IDENT.fetch_add(1, Ordering::SeqCst),
            generation: 0,
            open: true,
            mode: Mode::default(),
            stream: None,
            secrets,
        };
        trace!(id = handle.id, "creating mock handle");
        handle
    }

    /// Unique identity of the connection behind this handle.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// How many operations produced this handle.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Is the handle open?
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The message delivery mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn next(mut self) -> Self {
        self.generation += 1;
        self
    }
}

#[derive(Debug, Default)]
struct Script {
    refuse_connect: bool,
    fail_request: bool,
    fail_chunk: Option<usize>,
    reject_transfer: bool,
    replies: VecDeque<MockReply>,
    secrets: Vec<TlsSecret>,
    chunks: usize,
}

/// A transport which plays back a script and records what it was asked to do.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockTransport {
    /// Create a transport which connects, accepts requests and times out on receive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection attempt.
    pub fn refuse_connect(self) -> Self {
        self.script.lock().refuse_connect = true;
        self
    }

    /// Fail to send request heads.
    pub fn fail_request(self) -> Self {
        self.script.lock().fail_request = true;
        self
    }

    /// Fail on the `n`th streamed body chunk, counting from one.
    pub fn fail_chunk(self, n: usize) -> Self {
        self.script.lock().fail_chunk = Some(n);
        self
    }

    /// Reject ownership transfers.
    pub fn reject_transfer(self) -> Self {
        self.script.lock().reject_transfer = true;
        self
    }

    /// Export these secrets from handles which asked to capture them.
    pub fn with_secrets(self, secrets: Vec<TlsSecret>) -> Self {
        self.script.lock().secrets = secrets;
        self
    }

    /// Queue a reply for a future `receive` call.
    pub fn reply(self, reply: MockReply) -> Self {
        self.script.lock().replies.push_back(reply);
        self
    }

    /// Queue a batch of frames for a future `receive` call.
    pub fn frames(self, frames: impl IntoIterator<Item = MockFrame>) -> Self {
        self.reply(MockReply::Frames(frames.into_iter().collect()))
    }

    /// Every call recorded so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// How many times `close` was called.
    pub fn closes(&self) -> usize {
        self.count(|call| matches!(call, MockCall::Close))
    }

    /// Streamed body pieces, in the order they were sent.
    pub fn body(&self) -> Vec<BodyChunk> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::Body(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    }

    /// How many recorded calls match `predicate`.
    pub fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

fn broken_pipe() -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "mock send failure"))
}

impl Transport for MockTransport {
    type Handle = MockHandle;
    type Options = ();
    type Message = MockMessage;

    fn connect<'a>(
        &'a self,
        request: ConnectRequest<'a, ()>,
    ) -> BoxFuture<'a, Result<MockHandle, TransportError>> {
        self.record(MockCall::Connect(request.protocols.to_vec()));
        let script = self.script.lock();
        let result = if script.refuse_connect {
            Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock connection refused",
            )))
        } else if request.capture_secrets {
            Ok(MockHandle::new(script.secrets.clone()))
        } else {
            Ok(MockHandle::new(Vec::new()))
        };
        Box::pin(async move { result })
    }

    fn request(
        &self,
        mut handle: MockHandle,
        head: RequestHead,
        payload: Payload,
    ) -> BoxFuture<'_, Outcome<MockHandle, StreamRef>> {
        self.record(MockCall::Request {
            method: head.method,
            target: head.target,
            payload,
        });

        let result = if !handle.open {
            Err(Failed::new(handle.next(), TransportError::Closed))
        } else if self.script.lock().fail_request {
            Err(Failed::new(handle.next(), broken_pipe()))
        } else {
            let stream = StreamRef::new();
            handle.stream = Some(stream);
            Ok((handle.next(), stream))
        };
        Box::pin(async move { result })
    }

    fn stream_body(
        &self,
        handle: MockHandle,
        stream: StreamRef,
        chunk: BodyChunk,
    ) -> BoxFuture<'_, Result<MockHandle, Failed<MockHandle>>> {
        self.record(MockCall::Body(chunk.clone()));

        let failed = {
            let mut script = self.script.lock();
            if matches!(chunk, BodyChunk::Data(_)) {
                script.chunks += 1;
                script.fail_chunk == Some(script.chunks)
            } else {
                false
            }
        };

        let result = if handle.stream != Some(stream) {
            let expected = handle.stream.unwrap_or_default();
            Err(Failed::new(
                handle.next(),
                TransportError::StreamMismatch {
                    expected,
                    found: stream,
                },
            ))
        } else if failed {
            Err(Failed::new(handle.next(), broken_pipe()))
        } else {
            Ok(handle.next())
        };
        Box::pin(async move { result })
    }

    fn receive(
        &self,
        mut handle: MockHandle,
        timeout: Duration,
    ) -> BoxFuture<'_, Outcome<MockHandle, Vec<Frame>>> {
        self.record(MockCall::Receive(timeout));
        let reply = self.script.lock().replies.pop_front();

        Box::pin(async move {
            let stream = handle.stream.unwrap_or_default();
            match reply {
                None | Some(MockReply::Timeout) => {
                    Err(Failed::new(handle.next(), TransportError::Timeout))
                }
                Some(MockReply::Closed) => {
                    handle.open = false;
                    Err(Failed::new(handle.next(), TransportError::Closed))
                }
                Some(MockReply::Panic(message)) => std::panic::panic_any(message),
                Some(MockReply::Frames(frames)) => {
                    let frames = frames
                        .into_iter()
                        .map(|frame| match frame {
                            MockFrame::Status(status) => Frame::Status(stream, status),
                            MockFrame::Headers(headers) => Frame::Headers(stream, headers),
                            MockFrame::Data(data) => Frame::Data(stream, data),
                            MockFrame::Done => Frame::Done(stream),
                            MockFrame::Error(reason) => {
                                Frame::Error(stream, TransportError::Protocol(reason))
                            }
                            MockFrame::Stray => {
                                Frame::Data(StreamRef::new(), Bytes::from_static(b"stray"))
                            }
                        })
                        .collect();
                    Ok((handle.next(), frames))
                }
            }
        })
    }

    fn close(&self, mut handle: MockHandle) -> BoxFuture<'_, MockHandle> {
        self.record(MockCall::Close);
        handle.open = false;
        handle.stream = None;
        Box::pin(async move { handle.next() })
    }

    fn is_open(&self, handle: &MockHandle) -> bool {
        handle.open
    }

    fn set_mode(&self, mut handle: MockHandle, mode: Mode) -> Result<MockHandle, Failed<MockHandle>> {
        self.record(MockCall::SetMode(mode));
        if !handle.open {
            return Err(Failed::new(handle.next(), TransportError::Closed));
        }
        handle.mode = mode;
        Ok(handle.next())
    }

    fn transfer_ownership(&self, handle: &MockHandle, owner: OwnerId) -> Result<(), TransportError> {
        self.record(MockCall::Transfer(owner));
        if !handle.open {
            return Err(TransportError::Closed);
        }
        if self.script.lock().reject_transfer {
            return Err(TransportError::protocol("transfer rejected"));
        }
        Ok(())
    }

    fn stream(&self, handle: MockHandle, message: MockMessage) -> Streamed<MockHandle> {
        self.record(MockCall::Stream);
        if message.id != handle.id {
            return Streamed::Unknown(handle);
        }

        match message.error {
            Some(reason) => Streamed::Error(Failed::new(
                handle.next(),
                TransportError::protocol(reason),
            )),
            None => Streamed::Ingested(handle.next(), Vec::new()),
        }
    }

    fn tls_secrets(&self, handle: &MockHandle) -> Vec<TlsSecret> {
        handle.secrets.clone()
    }
}
