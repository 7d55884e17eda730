use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use hyper::{HeaderMap, Method, StatusCode};
use tokio::time::Sleep;
use tracing::debug;

use crate::balancer::{Balancer, InFlightGuard};
use crate::metrics;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-request release ticket.
///
/// Dropping it is the `Released` state: the in-flight count comes back down
/// (via the inner guard), the selector gets the response-time sample, and the
/// request counter/duration metrics are emitted. It rides inside the response
/// body so release happens after the copy finishes, errors out, or the client
/// goes away — exactly once on every path.
pub struct RequestRelease {
    guard: InFlightGuard,
    balancer: Arc<dyn Balancer>,
    method: Method,
    status: StatusCode,
    started: Instant,
}

impl RequestRelease {
    pub fn new(guard: InFlightGuard, balancer: Arc<dyn Balancer>, method: Method) -> Self {
        Self {
            guard,
            balancer,
            method,
            status: StatusCode::BAD_GATEWAY,
            started: Instant::now(),
        }
    }

    /// Record the status the client will observe for this request.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }
}

impl Drop for RequestRelease {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let backend = self.guard.backend();

        self.balancer.record_response_time(backend, elapsed);
        metrics::record_request(
            backend.url(),
            self.method.as_str(),
            self.status.as_u16(),
            elapsed,
        );
        debug!(
            backend = %backend.url(),
            status = self.status.as_u16(),
            duration_ms = elapsed.as_millis() as u64,
            "request released"
        );
        // The in-flight decrement follows when `guard` drops.
    }
}

enum Mode {
    /// Forward origin frames unchanged.
    Passthrough,
    /// Re-frame the body so every complete line is its own frame, buffering
    /// partial lines across origin chunks. Byte-for-byte identical output.
    Lines {
        buf: BytesMut,
        inner_done: bool,
        pending_trailers: Option<HeaderMap>,
    },
}

/// Response body handed back to hyper: the origin body plus the release
/// ticket, with optional line re-framing and an optional copy deadline.
pub struct ProxyBody<B> {
    inner: B,
    mode: Mode,
    deadline: Option<Pin<Box<Sleep>>>,
    _release: RequestRelease,
}

impl<B> ProxyBody<B> {
    pub fn passthrough(inner: B, release: RequestRelease, deadline: Option<Duration>) -> Self {
        Self {
            inner,
            mode: Mode::Passthrough,
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep(d))),
            _release: release,
        }
    }

    pub fn lines(inner: B, release: RequestRelease, deadline: Option<Duration>) -> Self {
        Self {
            inner,
            mode: Mode::Lines {
                buf: BytesMut::new(),
                inner_done: false,
                pending_trailers: None,
            },
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep(d))),
            _release: release,
        }
    }
}

impl<B> Body for ProxyBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(deadline) = &mut this.deadline {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Some(Err("origin response deadline exceeded".into())));
            }
        }

        let inner = &mut this.inner;
        match &mut this.mode {
            Mode::Passthrough => match ready!(Pin::new(inner).poll_frame(cx)) {
                Some(result) => Poll::Ready(Some(result.map_err(Into::into))),
                None => Poll::Ready(None),
            },
            Mode::Lines {
                buf,
                inner_done,
                pending_trailers,
            } => loop {
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line = buf.split_to(pos + 1).freeze();
                    return Poll::Ready(Some(Ok(Frame::data(line))));
                }

                if *inner_done {
                    if !buf.is_empty() {
                        let rest = buf.split().freeze();
                        return Poll::Ready(Some(Ok(Frame::data(rest))));
                    }
                    if let Some(trailers) = pending_trailers.take() {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                    return Poll::Ready(None);
                }

                match ready!(Pin::new(&mut *inner).poll_frame(cx)) {
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) => buf.extend_from_slice(&data),
                        Err(frame) => {
                            // Trailers are the final frame; flush what is
                            // buffered before emitting them.
                            if let Ok(trailers) = frame.into_trailers() {
                                *pending_trailers = Some(trailers);
                            }
                            *inner_done = true;
                        }
                    },
                    Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                    None => *inner_done = true,
                }
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.mode {
            Mode::Passthrough => self.inner.is_end_stream(),
            Mode::Lines {
                buf,
                inner_done,
                pending_trailers,
            } => *inner_done && buf.is_empty() && pending_trailers.is_none(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.mode {
            Mode::Passthrough => self.inner.size_hint(),
            Mode::Lines { buf, .. } => {
                // Re-framing never adds or drops bytes.
                let inner = self.inner.size_hint();
                let mut hint = SizeHint::new();
                hint.set_lower(inner.lower() + buf.len() as u64);
                if let Some(upper) = inner.upper() {
                    hint.set_upper(upper + buf.len() as u64);
                }
                hint
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{self, Backend, WeightedResponseTimeBalancer};
    use http_body_util::BodyExt;
    use std::collections::VecDeque;
    use std::convert::Infallible;

    struct ChunkBody {
        frames: VecDeque<Bytes>,
    }

    impl ChunkBody {
        fn new(chunks: &[&str]) -> Self {
            Self {
                frames: chunks.iter().map(|c| Bytes::copy_from_slice(c.as_bytes())).collect(),
            }
        }
    }

    impl Body for ChunkBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            Poll::Ready(self.frames.pop_front().map(|data| Ok(Frame::data(data))))
        }
    }

    fn test_release() -> (Arc<Backend>, RequestRelease) {
        let backend = Backend::new("http://origin:8001".to_string(), 1);
        let balancer = balancer::build("roundrobin", vec![Arc::clone(&backend)]).unwrap();
        let release = RequestRelease::new(backend.acquire(), balancer, Method::GET);
        (backend, release)
    }

    async fn collect_frames<B>(mut body: B) -> Vec<Bytes>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Debug,
    {
        let mut frames = Vec::new();
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame.unwrap().into_data() {
                frames.push(data);
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_lines_reframed_across_chunks() {
        let (_, release) = test_release();
        let inner = ChunkBody::new(&["li", "ne 1\nline 2\nli", "ne 3\n"]);
        let body = ProxyBody::lines(inner, release, None);

        let frames = collect_frames(body).await;
        assert_eq!(frames, vec!["line 1\n", "line 2\n", "line 3\n"]);
    }

    #[tokio::test]
    async fn test_lines_flushes_trailing_partial_line() {
        let (_, release) = test_release();
        let inner = ChunkBody::new(&["complete\n", "no newline"]);
        let body = ProxyBody::lines(inner, release, None);

        let frames = collect_frames(body).await;
        assert_eq!(frames, vec!["complete\n", "no newline"]);
    }

    #[tokio::test]
    async fn test_passthrough_keeps_frames() {
        let (_, release) = test_release();
        let inner = ChunkBody::new(&["chunk one", "chunk two"]);
        let body = ProxyBody::passthrough(inner, release, None);

        let frames = collect_frames(body).await;
        assert_eq!(frames, vec!["chunk one", "chunk two"]);
    }

    #[tokio::test]
    async fn test_release_fires_when_body_completes() {
        let (backend, release) = test_release();
        assert_eq!(backend.in_flight(), 1);

        let body = ProxyBody::passthrough(ChunkBody::new(&["done"]), release, None);
        collect_frames(body).await;

        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_release_fires_when_body_dropped() {
        let (backend, release) = test_release();
        let body = ProxyBody::lines(ChunkBody::new(&["never read"]), release, None);

        drop(body);
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_release_feeds_weighted_tracker() {
        let backend = Backend::new("http://origin:8001".to_string(), 1);
        let weighted = Arc::new(WeightedResponseTimeBalancer::new(vec![Arc::clone(&backend)]));
        let selector: Arc<dyn Balancer> = weighted.clone();
        let release = RequestRelease::new(backend.acquire(), selector, Method::GET);

        drop(release);
        assert!(weighted.average_response_time(&backend) > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_deadline_errors_the_body() {
        let (_, release) = test_release();

        struct PendingBody;
        impl Body for PendingBody {
            type Data = Bytes;
            type Error = Infallible;
            fn poll_frame(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
                Poll::Pending
            }
        }

        let mut body =
            ProxyBody::passthrough(PendingBody, release, Some(Duration::from_millis(20)));

        let frame = body.frame().await;
        assert!(matches!(frame, Some(Err(_))));
    }
}
