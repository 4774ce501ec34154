//! Body plumbing for proxied requests and responses.
//!
//! # Responsibilities
//! - One boxed body type flowing through every pass ([`ProxyBody`])
//! - Split an inbound body between `target` and `forward` ([`tee`])
//! - Record a bounded copy of the request body for 307/308 replay
//! - Signal when an upstream response body has been fully relayed

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::mpsc;

/// Boxed error carried by bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both legs of the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// An empty body.
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// A body holding `data`.
pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Box any body into a [`ProxyBody`].
pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

type FrameResult = Result<Frame<Bytes>, BoxError>;

/// Body fed from a channel.
struct ChannelBody {
    rx: mpsc::Receiver<FrameResult>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx.poll_recv(cx)
    }
}

fn copy_frame(frame: &Frame<Bytes>) -> Option<Frame<Bytes>> {
    if let Some(data) = frame.data_ref() {
        return Some(Frame::data(data.clone()));
    }
    frame.trailers_ref().map(|trailers| Frame::trailers(trailers.clone()))
}

/// Split `body` into two bodies that each yield every frame.
///
/// A slow reader applies backpressure to both. A reader that goes away is
/// dropped from the fan-out without affecting the other.
pub fn tee(body: ProxyBody) -> (ProxyBody, ProxyBody) {
    let (tx_a, rx_a) = mpsc::channel::<FrameResult>(16);
    let (tx_b, rx_b) = mpsc::channel::<FrameResult>(16);

    tokio::spawn(async move {
        let mut body = body;
        let mut outputs = [Some(tx_a), Some(tx_b)];

        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    let copy = copy_frame(&frame);
                    let frames = [Some(frame), copy];
                    for (slot, frame) in outputs.iter_mut().zip(frames) {
                        let (Some(tx), Some(frame)) = (slot.as_ref(), frame) else {
                            continue;
                        };
                        if tx.send(Ok(frame)).await.is_err() {
                            *slot = None;
                        }
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    for tx in outputs.iter().flatten() {
                        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, message.clone());
                        let _ = tx.send(Err(err.into())).await;
                    }
                    return;
                }
            }
            if outputs.iter().all(Option::is_none) {
                return;
            }
        }
    });

    (
        ChannelBody { rx: rx_a }.boxed_unsync(),
        ChannelBody { rx: rx_b }.boxed_unsync(),
    )
}

/// Bounded copy of a request body, shared with the redirect handler.
#[derive(Debug)]
pub struct ReplayBuffer {
    data: BytesMut,
    limit: usize,
    overflowed: bool,
    complete: bool,
}

impl ReplayBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            limit,
            overflowed: false,
            complete: false,
        }
    }

    fn record(&mut self, chunk: &Bytes) {
        if self.overflowed {
            return;
        }
        if self.data.len() + chunk.len() > self.limit {
            self.overflowed = true;
            self.data = BytesMut::new();
            return;
        }
        self.data.extend_from_slice(chunk);
    }

    /// The full body, if it was read to the end without exceeding the limit.
    pub fn snapshot(&self) -> Option<Bytes> {
        (self.complete && !self.overflowed).then(|| self.data.clone().freeze())
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }
}

/// Shared handle to a [`ReplayBuffer`].
pub type ReplayHandle = Arc<Mutex<ReplayBuffer>>;

/// Body wrapper copying data frames into a [`ReplayBuffer`].
pub struct RecordingBody {
    inner: ProxyBody,
    replay: ReplayHandle,
}

impl RecordingBody {
    pub fn new(inner: ProxyBody, limit: usize) -> (Self, ReplayHandle) {
        let replay = Arc::new(Mutex::new(ReplayBuffer::new(limit)));
        if inner.is_end_stream() {
            mark_complete(&replay);
        }
        (
            Self {
                inner,
                replay: Arc::clone(&replay),
            },
            replay,
        )
    }
}

fn mark_complete(replay: &ReplayHandle) {
    if let Ok(mut buffer) = replay.lock() {
        buffer.complete = true;
    }
}

impl Body for RecordingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(chunk), Ok(mut buffer)) = (frame.data_ref(), this.replay.lock()) {
                    buffer.record(chunk);
                }
                if this.inner.is_end_stream() {
                    mark_complete(&this.replay);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                mark_complete(&this.replay);
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Body wrapper that runs a callback once the inner body has been read to
/// the end. Dropping it early drops the inner body without the callback.
pub struct EndNotify {
    inner: ProxyBody,
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

impl EndNotify {
    pub fn new(inner: ProxyBody, on_end: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            on_end: Some(Box::new(on_end)),
        }
    }

    fn fire(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end();
        }
    }
}

impl Body for EndNotify {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if this.inner.is_end_stream() {
                    this.fire();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.fire();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
