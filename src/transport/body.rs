//! Outgoing request bodies for the HTTP/1 adapter.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Frame, SizeHint};
use tokio::sync::mpsc;

/// Request body handed to hyper.
///
/// Streamed bodies are fed through a bounded channel: each chunk sent by the driver
/// becomes one data frame, and dropping the sender ends the body.
#[derive(Debug)]
pub(crate) enum OutgoingBody {
    Empty,
    Full(Option<Bytes>),
    Channel(mpsc::Receiver<Bytes>),
}

impl OutgoingBody {
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, OutgoingBody::Channel(rx))
    }
}

impl From<Bytes> for OutgoingBody {
    fn from(body: Bytes) -> Self {
        OutgoingBody::Full(Some(body))
    }
}

impl http_body::Body for OutgoingBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            OutgoingBody::Empty => Poll::Ready(None),
            OutgoingBody::Full(data) => Poll::Ready(data.take().map(|data| Ok(Frame::data(data)))),
            OutgoingBody::Channel(rx) => rx
                .poll_recv(cx)
                .map(|chunk| chunk.map(|data| Ok(Frame::data(data)))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            OutgoingBody::Empty => true,
            OutgoingBody::Full(data) => data.is_none(),
            OutgoingBody::Channel(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            OutgoingBody::Empty | OutgoingBody::Full(None) => SizeHint::with_exact(0),
            OutgoingBody::Full(Some(data)) => SizeHint::with_exact(data.len() as u64),
            OutgoingBody::Channel(_) => SizeHint::default(),
        }
    }
}
