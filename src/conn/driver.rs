//! Driving one request/response exchange over a connection.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::{FutureExt as _, StreamExt as _};
use http::StatusCode;
use tracing::{debug, error, trace, Instrument as _};

use super::{Connection, Handle};
use crate::error::Error;
use crate::request::{Request, RequestBody};
use crate::response::ResponsePart;
use crate::telemetry::{Event, ExceptionKind, Measurements, Metadata, SpanToken};
use crate::transport::{
    BodyChunk, Failed, Frame, Payload, RequestHead, StreamRef, Transport, TransportError,
};

/// State which must survive a fault: the handle while the driver holds it, the
/// open response span and the status seen so far.
struct Exchange<H> {
    handle: Option<H>,
    response: Option<SpanToken>,
    status: Option<StatusCode>,
}

impl<H> Exchange<H> {
    fn take(&mut self) -> Result<H, Error> {
        self.handle.take().ok_or(Error::Closed)
    }

    fn put(&mut self, handle: H) {
        self.handle = Some(handle);
    }
}

impl<T: Transport> Connection<T> {
    /// Send `request` and fold the response into `acc`.
    ///
    /// The response arrives as a sequence of [`ResponsePart`]s, each passed to `fold`
    /// together with the accumulator so far. Every call to the adapter's receive is
    /// bounded by `receive_timeout`; a slow response succeeds as long as each call
    /// sees some activity. `idle_time` is how long the connection sat idle before
    /// this request, reported with the request telemetry.
    ///
    /// Errors leave the connection holding the adapter's latest handle. A panic
    /// anywhere in the exchange (in the adapter, the request body stream or `fold`)
    /// closes the connection, is reported as a `response` exception, and then
    /// resumes unwinding with the original payload. If the panic took the handle
    /// with it, or this future is dropped mid-exchange, the connection is left
    /// [`Handle::Lost`].
    ///
    /// A lost connection fails with [`Error::Closed`].
    pub async fn request<A, F>(
        &mut self,
        request: Request,
        acc: A,
        mut fold: F,
        receive_timeout: Duration,
        idle_time: Duration,
    ) -> Result<A, Error>
    where
        F: FnMut(ResponsePart, A) -> A,
    {
        if self.handle.is_lost() {
            return Err(Error::Closed);
        }
        let Some(handle) = self.handle.checkout() else {
            return Err(Error::Connect(TransportError::NotConnected));
        };

        let (head, body) = request.into_parts();
        let metadata = self.metadata().with_request(&head.method, &head.target);
        let span = tracing::debug_span!(
            "request",
            origin = %self.origin,
            method = %head.method,
            target = %head.target
        );

        let mut state = Exchange {
            handle: Some(handle),
            response: None,
            status: None,
        };

        let outcome = AssertUnwindSafe(
            self.exchange(
                &mut state,
                head,
                body,
                acc,
                &mut fold,
                receive_timeout,
                idle_time,
                &metadata,
            )
            .instrument(span),
        )
        .catch_unwind()
        .await;

        match outcome {
            Ok(result) => {
                if let Some(handle) = state.handle.take() {
                    self.handle = Handle::Connected(handle);
                }
                self.checkin();
                result
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(origin = %self.origin, "exchange panicked: {reason}");

                match state.handle.take() {
                    Some(handle) => {
                        let handle = self.transport.close(handle).await;
                        self.handle = Handle::Connected(handle);
                    }
                    None => debug!(origin = %self.origin, "handle lost in the fault"),
                }

                let token = state.response.take().unwrap_or_else(SpanToken::new);
                self.telemetry.exception(
                    Event::Response,
                    token,
                    ExceptionKind::Panic,
                    reason,
                    &metadata.with_status(state.status),
                    Measurements::default(),
                );

                std::panic::resume_unwind(payload)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange<A, F>(
        &self,
        state: &mut Exchange<T::Handle>,
        head: RequestHead,
        body: RequestBody,
        acc: A,
        fold: &mut F,
        receive_timeout: Duration,
        idle_time: Duration,
        metadata: &Metadata,
    ) -> Result<A, Error>
    where
        F: FnMut(ResponsePart, A) -> A,
    {
        let measurements = Measurements::idle(idle_time);
        let token = self.telemetry.start(Event::Request, metadata, measurements);

        let stream = match self.send(state, head, body).await {
            Ok(stream) => {
                self.telemetry
                    .stop(Event::Request, token, metadata, measurements);
                stream
            }
            Err(error) => {
                debug!("request failed: {error}");
                self.telemetry.stop(
                    Event::Request,
                    token,
                    &metadata.clone().with_error(&error),
                    measurements,
                );
                return Err(error);
            }
        };

        state.response = Some(self.telemetry.start(
            Event::Response,
            metadata,
            Measurements::default(),
        ));

        let result = self.receive(state, stream, acc, fold, receive_timeout).await;

        let token = state.response.take().unwrap_or_else(SpanToken::new);
        let metadata = metadata.clone().with_status(state.status);
        match &result {
            Ok(_) => self
                .telemetry
                .stop(Event::Response, token, &metadata, Measurements::default()),
            Err(error) => {
                debug!("response failed: {error}");
                self.telemetry.stop(
                    Event::Response,
                    token,
                    &metadata.with_error(error),
                    Measurements::default(),
                )
            }
        }

        result
    }

    async fn send(
        &self,
        state: &mut Exchange<T::Handle>,
        head: RequestHead,
        body: RequestBody,
    ) -> Result<StreamRef, Error> {
        let (payload, chunks) = match body {
            RequestBody::Empty => (Payload::Empty, None),
            RequestBody::Full(bytes) => (Payload::Full(bytes), None),
            RequestBody::Stream(chunks) => (Payload::Streaming, Some(chunks)),
        };

        let handle = state.take()?;
        let stream = match self.transport.request(handle, head, payload).await {
            Ok((handle, stream)) => {
                state.put(handle);
                stream
            }
            Err(Failed { handle, error }) => {
                state.put(handle);
                return Err(Error::Send(error));
            }
        };

        if let Some(mut chunks) = chunks {
            let mut sent = 0usize;
            while let Some(chunk) = chunks.next().await {
                self.stream_body(state, stream, BodyChunk::Data(chunk))
                    .await?;
                sent += 1;
            }
            self.stream_body(state, stream, BodyChunk::Eof).await?;
            trace!(%stream, chunks = sent, "streamed request body");
        }

        Ok(stream)
    }

    async fn stream_body(
        &self,
        state: &mut Exchange<T::Handle>,
        stream: StreamRef,
        chunk: BodyChunk,
    ) -> Result<(), Error> {
        let handle = state.take()?;
        match self.transport.stream_body(handle, stream, chunk).await {
            Ok(handle) => {
                state.put(handle);
                Ok(())
            }
            Err(Failed { handle, error }) => {
                state.put(handle);
                Err(Error::Send(error))
            }
        }
    }

    async fn receive<A, F>(
        &self,
        state: &mut Exchange<T::Handle>,
        stream: StreamRef,
        mut acc: A,
        fold: &mut F,
        receive_timeout: Duration,
    ) -> Result<A, Error>
    where
        F: FnMut(ResponsePart, A) -> A,
    {
        loop {
            let handle = state.take()?;
            let frames = match self.transport.receive(handle, receive_timeout).await {
                Ok((handle, frames)) => {
                    state.put(handle);
                    frames
                }
                Err(Failed { handle, error }) => {
                    state.put(handle);
                    return Err(Error::receive(error));
                }
            };

            for frame in frames {
                let found = frame.stream();
                if found != stream {
                    return Err(Error::Protocol(TransportError::StreamMismatch {
                        expected: stream,
                        found,
                    }));
                }

                match frame {
                    Frame::Status(_, status) => {
                        state.status = Some(status);
                        acc = fold(ResponsePart::Status(status), acc);
                    }
                    Frame::Headers(_, headers) => acc = fold(ResponsePart::Headers(headers), acc),
                    Frame::Data(_, data) => acc = fold(ResponsePart::Data(data), acc),
                    Frame::Done(_) => return Ok(acc),
                    Frame::Error(_, error) => return Err(Error::Protocol(error)),
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use http::header::CONTENT_TYPE;
    use http::uri::Scheme;
    use http::{HeaderValue, Method};

    use crate::conn::tests::connection;
    use crate::telemetry::Record;
    use crate::transport::mock::{MockCall, MockFrame, MockReply, MockTransport};

    const TIMEOUT: Duration = Duration::from_millis(5000);

    fn headers() -> Vec<(http::HeaderName, HeaderValue)> {
        vec![(CONTENT_TYPE, HeaderValue::from_static("text/plain"))]
    }

    fn append(part: ResponsePart, acc: Vec<ResponsePart>) -> Vec<ResponsePart> {
        part.append(acc)
    }

    fn chunks(parts: &[&'static str]) -> RequestBody {
        let parts: Vec<Bytes> = parts.iter().map(|part| Bytes::from_static(part.as_bytes())).collect();
        RequestBody::stream(futures_util::stream::iter(parts))
    }

    #[tokio::test]
    async fn disconnected_request_fails_without_adapter() {
        let transport = MockTransport::new();
        let (mut conn, sink) = connection(&transport, Scheme::HTTP);

        let error = conn
            .request(Request::get("/"), Vec::new(), append, TIMEOUT, Duration::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Connect(TransportError::NotConnected)));
        assert!(transport.calls().is_empty());
        assert!(sink.records().is_empty());
        assert!(!conn.handle().is_connected());
    }

    #[tokio::test]
    async fn end_to_end_get() {
        let transport = MockTransport::new().frames([
            MockFrame::Status(StatusCode::OK),
            MockFrame::Headers(headers()),
            MockFrame::Data(Bytes::from_static(b"ab")),
            MockFrame::Data(Bytes::from_static(b"cd")),
            MockFrame::Done,
        ]);
        let (mut conn, sink) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let mut folds = 0;
        let parts = conn
            .request(
                Request::get("/"),
                Vec::new(),
                |part, acc| {
                    folds += 1;
                    append(part, acc)
                },
                TIMEOUT,
                Duration::ZERO,
            )
            .await
            .unwrap();

        assert_eq!(folds, 4);
        assert_eq!(
            parts,
            vec![
                ResponsePart::Status(StatusCode::OK),
                ResponsePart::Headers(headers()),
                ResponsePart::Data(Bytes::from_static(b"ab")),
                ResponsePart::Data(Bytes::from_static(b"cd")),
            ]
        );

        assert_eq!(
            transport.calls(),
            vec![
                MockCall::Connect(vec![crate::transport::HttpProtocol::Http1]),
                MockCall::Request {
                    method: Method::GET,
                    target: "/".into(),
                    payload: Payload::Empty,
                },
                MockCall::Receive(TIMEOUT),
            ]
        );

        assert_eq!(
            sink.names(),
            vec![
                "connect.start",
                "connect.stop",
                "request.start",
                "request.stop",
                "response.start",
                "response.stop",
            ]
        );
        let stop = sink.records().pop().unwrap();
        assert_eq!(stop.metadata().status, Some(StatusCode::OK));
        assert_eq!(stop.metadata().path.as_deref(), Some("/"));
        assert!(stop.metadata().error.is_none());

        assert!(conn.is_open());
        assert!(conn.idle_time() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn request_span_reports_idle_time() {
        let transport = MockTransport::new().frames([MockFrame::Done]);
        let (mut conn, sink) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let idle = Duration::from_millis(1234);
        conn.request(Request::get("/"), (), |_, acc| acc, TIMEOUT, idle)
            .await
            .unwrap();

        let start = sink
            .records()
            .into_iter()
            .find(|record| record.name() == "request.start")
            .unwrap();
        assert_eq!(start.measurements().idle_time, Some(idle));
        assert_eq!(start.metadata().method, Some(Method::GET));
    }

    #[tokio::test]
    async fn target_includes_query_and_full_body() {
        let transport = MockTransport::new().frames([MockFrame::Done]);
        let (mut conn, _) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let request = Request::post("/upload", "payload").with_query("part=1");
        conn.request(request, (), |_, acc| acc, TIMEOUT, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(
            transport.count(|call| {
                *call
                    == MockCall::Request {
                        method: Method::POST,
                        target: "/upload?part=1".into(),
                        payload: Payload::Full(Bytes::from_static(b"payload")),
                    }
            }),
            1
        );
        assert!(transport.body().is_empty());
    }

    #[tokio::test]
    async fn streamed_body_ends_with_eof() {
        let transport = MockTransport::new().frames([MockFrame::Done]);
        let (mut conn, _) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let request = Request::new(Method::PUT, "/stream").with_body(chunks(&["a", "b", "c"]));
        conn.request(request, (), |_, acc| acc, TIMEOUT, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(
            transport.body(),
            vec![
                BodyChunk::Data(Bytes::from_static(b"a")),
                BodyChunk::Data(Bytes::from_static(b"b")),
                BodyChunk::Data(Bytes::from_static(b"c")),
                BodyChunk::Eof,
            ]
        );
        assert_eq!(
            transport.count(|call| matches!(
                call,
                MockCall::Request {
                    payload: Payload::Streaming,
                    ..
                }
            )),
            1
        );
    }

    #[tokio::test]
    async fn failed_chunk_stops_stream() {
        let transport = MockTransport::new().fail_chunk(2);
        let (mut conn, sink) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let request = Request::new(Method::PUT, "/stream").with_body(chunks(&["a", "b", "c"]));
        let error = conn
            .request(request, (), |_, acc| acc, TIMEOUT, Duration::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Send(TransportError::Io(_))));
        // Chunk 2 was attempted and failed; chunk 3 and the end marker never went out.
        assert_eq!(
            transport.body(),
            vec![
                BodyChunk::Data(Bytes::from_static(b"a")),
                BodyChunk::Data(Bytes::from_static(b"b")),
            ]
        );
        assert_eq!(transport.count(|call| matches!(call, MockCall::Receive(_))), 0);

        let names = sink.names();
        assert!(!names.iter().any(|name| name.starts_with("response")));
        let stop = sink.records().pop().unwrap();
        assert_eq!(stop.name(), "request.stop");
        assert!(stop.metadata().error.is_some());
        assert!(conn.handle().is_connected());
    }

    #[tokio::test]
    async fn failed_head_is_send_error() {
        let transport = MockTransport::new().fail_request();
        let (mut conn, sink) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();
        let generation = conn.handle().as_connected().unwrap().generation();

        let error = conn
            .request(Request::get("/"), (), |_, acc| acc, TIMEOUT, Duration::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Send(_)));
        assert!(conn.handle().as_connected().unwrap().generation() > generation);
        assert_eq!(sink.names().last().map(String::as_str), Some("request.stop"));
    }

    #[tokio::test]
    async fn error_frame_ends_receive() {
        let transport = MockTransport::new().frames([
            MockFrame::Status(StatusCode::OK),
            MockFrame::Error("bad chunk size".into()),
            MockFrame::Data(Bytes::from_static(b"never")),
        ]);
        let (mut conn, sink) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let mut folds = 0;
        let error = conn
            .request(
                Request::get("/"),
                (),
                |_, acc| {
                    folds += 1;
                    acc
                },
                TIMEOUT,
                Duration::ZERO,
            )
            .await
            .unwrap_err();

        assert_eq!(folds, 1);
        assert!(matches!(error, Error::Protocol(TransportError::Protocol(ref reason)) if reason == "bad chunk size"));

        // request, receive: each bumps the generation
        assert_eq!(conn.handle().as_connected().unwrap().generation(), 2);

        let stop = sink.records().pop().unwrap();
        assert_eq!(stop.name(), "response.stop");
        assert_eq!(stop.metadata().status, Some(StatusCode::OK));
        assert!(stop.metadata().error.is_some());
    }

    #[tokio::test]
    async fn frames_across_receive_calls() {
        let transport = MockTransport::new()
            .frames([MockFrame::Status(StatusCode::CREATED)])
            .reply(MockReply::Frames(Vec::new()))
            .frames([MockFrame::Data(Bytes::from_static(b"x"))])
            .frames([MockFrame::Done]);
        let (mut conn, _) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let parts = conn
            .request(Request::get("/"), Vec::new(), append, TIMEOUT, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(
            transport.count(|call| *call == MockCall::Receive(TIMEOUT)),
            4
        );
    }

    #[tokio::test]
    async fn receive_timeout() {
        let transport = MockTransport::new().reply(MockReply::Timeout);
        let (mut conn, _) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let error = conn
            .request(
                Request::get("/"),
                (),
                |_, acc| acc,
                Duration::from_millis(10),
                Duration::ZERO,
            )
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Timeout));
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn peer_closed_is_protocol_error() {
        let transport = MockTransport::new().reply(MockReply::Closed);
        let (mut conn, _) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let error = conn
            .request(Request::get("/"), (), |_, acc| acc, TIMEOUT, Duration::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Protocol(TransportError::Closed)));
        assert!(!conn.is_open());
        assert!(conn.handle().is_connected());
    }

    #[tokio::test]
    async fn stray_frame_is_protocol_error() {
        let transport = MockTransport::new().frames([MockFrame::Stray]);
        let (mut conn, _) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let error = conn
            .request(Request::get("/"), (), |_, acc| acc, TIMEOUT, Duration::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Protocol(TransportError::StreamMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn fold_panic_closes_and_resumes() {
        let transport = MockTransport::new().frames([
            MockFrame::Status(StatusCode::OK),
            MockFrame::Data(Bytes::from_static(b"ab")),
            MockFrame::Done,
        ]);
        let (mut conn, sink) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let outcome = AssertUnwindSafe(conn.request(
            Request::get("/"),
            (),
            |part, acc| {
                if matches!(part, ResponsePart::Data(_)) {
                    panic!("boom");
                }
                acc
            },
            TIMEOUT,
            Duration::ZERO,
        ))
        .catch_unwind()
        .await;

        let payload = outcome.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
        assert_eq!(transport.closes(), 1);
        assert!(!conn.is_open());

        let exception = sink.records().pop().unwrap();
        assert_eq!(exception.name(), "response.exception");
        assert_eq!(exception.metadata().status, Some(StatusCode::OK));
        assert!(matches!(
            exception,
            Record::Exception { ref reason, kind: ExceptionKind::Panic, .. } if reason == "boom"
        ));
    }

    #[tokio::test]
    async fn body_stream_panic_closes() {
        let transport = MockTransport::new();
        let (mut conn, sink) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let body = RequestBody::stream(futures_util::stream::iter([1, 2]).map(|n| {
            if n == 2 {
                panic!("{}", String::from("stream failed"));
            }
            Bytes::from_static(b"one")
        }));

        let outcome = AssertUnwindSafe(conn.request(
            Request::new(Method::PUT, "/").with_body(body),
            (),
            |_, acc| acc,
            TIMEOUT,
            Duration::ZERO,
        ))
        .catch_unwind()
        .await;

        let payload = outcome.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<String>().map(String::as_str),
            Some("stream failed")
        );
        assert_eq!(transport.closes(), 1);
        assert!(!transport.body().contains(&BodyChunk::Eof));

        let names = sink.names();
        assert_eq!(names.last().map(String::as_str), Some("response.exception"));
        assert!(!names.iter().any(|name| name == "response.start"));
    }

    #[tokio::test]
    async fn adapter_panic_loses_handle() {
        let transport = MockTransport::new().reply(MockReply::Panic("adapter"));
        let (mut conn, sink) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let outcome = AssertUnwindSafe(conn.request(
            Request::get("/"),
            (),
            |_, acc| acc,
            TIMEOUT,
            Duration::ZERO,
        ))
        .catch_unwind()
        .await;

        let payload = outcome.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"adapter"));
        // The adapter kept the handle, so there is nothing left to close.
        assert_eq!(transport.closes(), 0);
        assert!(conn.handle().is_lost());
        assert!(!conn.is_open());
        assert_eq!(
            sink.names().last().map(String::as_str),
            Some("response.exception")
        );

        let calls = transport.calls().len();
        assert!(matches!(conn.connect().await, Err(Error::Closed)));
        assert!(matches!(
            conn.request(Request::get("/"), (), |_, acc| acc, TIMEOUT, Duration::ZERO)
                .await,
            Err(Error::Closed)
        ));
        conn.close().await;
        assert_eq!(transport.calls().len(), calls);
        assert!(conn.handle().is_lost());
    }

    #[tokio::test]
    async fn dropped_request_loses_handle() {
        let transport = MockTransport::new();
        let (mut conn, _) = connection(&transport, Scheme::HTTP);
        conn.connect().await.unwrap();

        let body = RequestBody::stream(futures_util::stream::pending::<Bytes>());
        let request = Request::new(Method::PUT, "/").with_body(body);
        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            conn.request(request, (), |_, acc| acc, TIMEOUT, Duration::ZERO),
        )
        .await;

        assert!(outcome.is_err());
        assert!(conn.handle().is_lost());
        assert!(!conn.is_open());
        assert!(matches!(conn.connect().await, Err(Error::Closed)));
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "panic");
    }
}
