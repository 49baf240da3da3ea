use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http::uri::Scheme;
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt as _, Full, StreamBody};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use h1driver::conn::{Connection, Discard, OwnerId};
use h1driver::transport::{HttpOptions, HttpTransport, Mode, Origin, TransportError};
use h1driver::{Error, Request, RequestBody, Response};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Chunks sent by `/trickle`, and the pause before each one.
const TRICKLE: usize = 7;
const TRICKLE_GAP: Duration = Duration::from_millis(30);

type Body = UnsyncBoxBody<Bytes, Infallible>;

fn full(body: impl Into<Bytes>) -> Body {
    Full::new(body.into()).boxed_unsync()
}

fn trickle() -> Body {
    let chunks = futures_util::stream::unfold(0, |sent| async move {
        if sent == TRICKLE {
            return None;
        }
        tokio::time::sleep(TRICKLE_GAP).await;
        let frame = http_body::Frame::data(Bytes::from_static(b"drip "));
        Some((Ok::<_, Infallible>(frame), sent + 1))
    });
    StreamBody::new(chunks).boxed_unsync()
}

async fn service(
    req: http::Request<hyper::body::Incoming>,
) -> Result<http::Response<Body>, Infallible> {
    let host = req.headers().get(http::header::HOST).cloned();
    let path = req.uri().path().to_owned();

    let mut response = match path.as_str() {
        "/echo" => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => Bytes::from_static(b"error"),
            };
            http::Response::new(full(body))
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            http::Response::new(full("late"))
        }
        "/trickle" => http::Response::new(trickle()),
        "/bye" => {
            let mut response = http::Response::new(full("bye"));
            response.headers_mut().insert(
                http::header::CONNECTION,
                http::HeaderValue::from_static("close"),
            );
            response
        }
        _ => http::Response::new(full("hello")),
    };

    if let Some(host) = host {
        response.headers_mut().insert("o-host", host);
    }
    Ok(response)
}

async fn serve_one_h1(listener: TcpListener) -> Result<(), BoxError> {
    let (stream, _) = listener.accept().await?;

    let service = hyper::service::service_fn(service);
    let conn =
        hyper::server::conn::http1::Builder::new().serve_connection(TokioIo::new(stream), service);

    conn.await?;

    Ok(())
}

async fn server() -> Result<(Origin, tokio::task::JoinHandle<Result<(), BoxError>>), BoxError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let server = tokio::spawn(serve_one_h1(listener));
    Ok((Origin::new(Scheme::HTTP, "127.0.0.1", port), server))
}

fn connection(origin: Origin, options: HttpOptions) -> Connection<HttpTransport> {
    Connection::new(HttpTransport::new(), origin, options, OwnerId::new())
}

#[tokio::test]
async fn get_and_reuse() -> Result<(), BoxError> {
    let (origin, server) = server().await?;
    let mut conn = connection(origin.clone(), HttpOptions::default());

    conn.connect().await?;
    assert!(conn.is_open());

    let idle = conn.idle_time();
    let response = conn
        .request(
            Request::get("/"),
            Response::new(),
            Response::fold,
            TIMEOUT,
            idle,
        )
        .await?;

    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.body(), b"hello");
    assert_eq!(
        response.headers()["o-host"],
        format!("127.0.0.1:{}", origin.port()).as_str()
    );

    // A second exchange runs over the same connection.
    conn.connect().await?;
    let idle = conn.idle_time();
    let response = conn
        .request(
            Request::get("/again").with_query("n=2"),
            Response::new(),
            Response::fold,
            TIMEOUT,
            idle,
        )
        .await?;
    assert_eq!(response.body(), b"hello");
    assert!(conn.is_reusable());

    conn.close().await;
    assert!(!conn.is_open());

    server.abort();
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn streamed_echo() -> Result<(), BoxError> {
    let (origin, server) = server().await?;
    let mut conn = connection(origin, HttpOptions::default());
    conn.connect().await?;

    let chunks = ["first ", "second ", "third"].map(|chunk| Bytes::from_static(chunk.as_bytes()));
    let request = Request::post("/echo", RequestBody::stream(futures_util::stream::iter(chunks)));

    let response = conn
        .request(request, Response::new(), Response::fold, TIMEOUT, Duration::ZERO)
        .await?;

    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.body(), b"first second third");

    let response = conn
        .request(
            Request::post("/echo", "all at once"),
            Response::new(),
            Response::fold,
            TIMEOUT,
            Duration::ZERO,
        )
        .await?;
    assert_eq!(response.body(), b"all at once");

    server.abort();
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn receive_timeout_is_per_call() -> Result<(), BoxError> {
    let (origin, server) = server().await?;
    let mut conn = connection(origin, HttpOptions::default());
    conn.connect().await?;

    let timeout = Duration::from_millis(100);
    assert!(TRICKLE_GAP * TRICKLE as u32 > timeout);

    let started = std::time::Instant::now();
    let response = conn
        .request(
            Request::get("/trickle"),
            Response::new(),
            Response::fold,
            timeout,
            Duration::ZERO,
        )
        .await?;

    assert!(started.elapsed() > timeout);
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.body(), "drip ".repeat(TRICKLE).as_bytes());
    assert!(conn.is_open());

    server.abort();
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn receive_timeout_closes_connection() -> Result<(), BoxError> {
    let (origin, server) = server().await?;
    let mut conn = connection(origin, HttpOptions::default());
    conn.connect().await?;

    let error = conn
        .request(
            Request::get("/slow"),
            Response::new(),
            Response::fold,
            Duration::from_millis(20),
            Duration::ZERO,
        )
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Timeout));
    assert!(conn.handle().is_connected());
    assert!(!conn.is_open());

    // The abandoned response can't be picked up again.
    let error = conn
        .request(
            Request::get("/"),
            Response::new(),
            Response::fold,
            TIMEOUT,
            Duration::ZERO,
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Send(TransportError::Closed)));

    server.abort();
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn connect_refused() -> Result<(), BoxError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let mut conn = connection(
        Origin::new(Scheme::HTTP, "127.0.0.1", port),
        HttpOptions::default().with_connect_timeout(Some(Duration::from_secs(2))),
    );

    let error = conn.connect().await.unwrap_err();
    assert!(matches!(
        error,
        Error::Connect(TransportError::Io(_)) | Error::Connect(TransportError::Timeout)
    ));
    assert!(!conn.handle().is_connected());
    assert!(!conn.is_open());
    Ok(())
}

#[tokio::test]
async fn active_mode_reports_close() -> Result<(), BoxError> {
    let (origin, server) = server().await?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut conn = connection(origin, HttpOptions::default().with_events(tx));

    conn.connect().await?;
    conn.set_mode(Mode::Active)?;

    let response = conn
        .request(
            Request::get("/bye"),
            Response::new(),
            Response::fold,
            TIMEOUT,
            Duration::ZERO,
        )
        .await?;
    assert_eq!(response.body(), b"bye");

    let message = tokio::time::timeout(TIMEOUT, rx.recv())
        .await?
        .ok_or("events channel closed")?;

    assert!(matches!(conn.discard(message), Discard::Drained));
    assert!(!conn.is_open());

    let _ = server.await;
    Ok(())
}
