//! Requests sent over a connection.

use std::fmt;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::stream::BoxStream;
use futures_util::StreamExt as _;
use http::{HeaderName, HeaderValue, Method};

use crate::transport::{HeaderList, RequestHead};

/// The body of a request.
#[derive(Default)]
pub enum RequestBody {
    /// No body.
    #[default]
    Empty,

    /// A complete body, sent together with the request head.
    Full(Bytes),

    /// A body produced incrementally, sent chunk by chunk after the head.
    Stream(BoxStream<'static, Bytes>),
}

impl RequestBody {
    /// A streamed body.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        RequestBody::Stream(stream.boxed())
    }

    /// Is this body streamed?
    pub fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream(_))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Full(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Full(bytes.into())
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Full(text.into())
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        RequestBody::Full(Bytes::from_static(text.as_bytes()))
    }
}

impl From<Option<Bytes>> for RequestBody {
    fn from(bytes: Option<Bytes>) -> Self {
        bytes.map_or(RequestBody::Empty, RequestBody::Full)
    }
}

/// A request to send over a connection.
#[derive(Debug)]
pub struct Request {
    /// Request method
    pub method: Method,

    /// Request path
    pub path: String,

    /// Query string, without the leading `?`.
    pub query: Option<String>,

    /// Header fields, in the order they are sent.
    pub headers: HeaderList,

    /// Request body
    pub body: RequestBody,
}

impl Request {
    /// A request with no query, headers or body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    /// A `GET` request for `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// A `POST` request for `path` with `body`.
    pub fn post(path: impl Into<String>, body: impl Into<RequestBody>) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    /// Set the query string.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Append a header field.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// The request target: the path, followed by `?` and the query when one is set.
    pub fn target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    pub(crate) fn into_parts(self) -> (RequestHead, RequestBody) {
        let target = self.target();
        (
            RequestHead {
                method: self.method,
                target,
                headers: self.headers,
            },
            self.body,
        )
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(request: http::Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let body = if body.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Full(body)
        };

        Self {
            method: parts.method,
            path: parts.uri.path().to_owned(),
            query: parts.uri.query().map(str::to_owned),
            headers,
            body,
        }
    }
}
