//! Response parts delivered to fold functions, and helpers for collecting them.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

use crate::transport::HeaderList;

/// One piece of a response, as passed to a fold function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    /// The response status.
    Status(StatusCode),

    /// Header fields. When these follow body data, they are trailers.
    Headers(HeaderList),

    /// A chunk of the response body.
    Data(Bytes),
}

impl ResponsePart {
    /// A fold function which collects every part, in order.
    pub fn append(self, mut parts: Vec<ResponsePart>) -> Vec<ResponsePart> {
        parts.push(self);
        parts
    }
}

/// A response aggregated from its parts with [`Response::fold`].
#[derive(Debug, Clone, Default)]
pub struct Response {
    status: Option<StatusCode>,
    headers: HeaderMap,
    trailers: Option<HeaderMap>,
    body: BytesMut,
}

impl Response {
    /// An empty aggregate, to start a fold.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fold function which aggregates parts into a [`Response`].
    ///
    /// Headers received after any body data are collected as trailers.
    pub fn fold(part: ResponsePart, mut response: Response) -> Response {
        match part {
            ResponsePart::Status(status) => response.status = Some(status),
            ResponsePart::Headers(headers) => {
                let target = if response.body.is_empty() && response.trailers.is_none() {
                    &mut response.headers
                } else {
                    response.trailers.get_or_insert_with(HeaderMap::new)
                };
                for (name, value) in headers {
                    target.append(name, value);
                }
            }
            ResponsePart::Data(data) => response.body.extend_from_slice(&data),
        }
        response
    }

    /// The response status, once received.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Trailers, if any were received.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// The response body received so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Convert into an [`http::Response`], or `None` if no status was received.
    ///
    /// Trailers are not carried over.
    pub fn into_http(self) -> Option<http::Response<Bytes>> {
        let status = self.status?;
        let mut response = http::Response::new(self.body.freeze());
        *response.status_mut() = status;
        *response.headers_mut() = self.headers;
        Some(response)
    }
}
