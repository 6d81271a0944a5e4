//! Response body wrapper that reports how the relay ended

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};

use crate::error::SupervisorError;
use crate::proxy::transport::BoxError;

/// How a relayed body finished
#[derive(Debug)]
pub enum BodyOutcome {
    /// Every frame reached the client
    Complete,
    /// Upstream failed or went idle mid-stream
    Failed(SupervisorError),
    /// The client went away before the end of the stream
    Aborted,
}

type OnEnd = Box<dyn FnOnce(BodyOutcome) + Send>;

/// Deadline rearmed on every frame
struct IdleTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn rearm(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.sleep.as_mut().reset(deadline);
    }
}

pin_project! {
    /// Wraps a body and invokes a callback exactly once when it ends,
    /// fails, stalls past its idle timeout, or is dropped early.
    pub struct ReportingBody<B> {
        #[pin]
        inner: B,
        on_end: Option<OnEnd>,
        idle: Option<IdleTimer>,
        expired: bool,
    }

    impl<B> PinnedDrop for ReportingBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(on_end) = this.on_end.take() {
                on_end(BodyOutcome::Aborted);
            }
        }
    }
}

impl<B> ReportingBody<B>
where
    B: Body,
{
    pub fn new<F>(inner: B, on_end: F) -> Self
    where
        F: FnOnce(BodyOutcome) + Send + 'static,
    {
        // An already finished body may never be polled
        if inner.is_end_stream() {
            on_end(BodyOutcome::Complete);
            return Self {
                inner,
                on_end: None,
                idle: None,
                expired: false,
            };
        }

        Self {
            inner,
            on_end: Some(Box::new(on_end)),
            idle: None,
            expired: false,
        }
    }

    /// Fail the body with [`SupervisorError::Timeout`] when no frame arrives
    /// within `timeout`. Must be called from within a tokio runtime.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        if self.on_end.is_some() {
            self.idle = Some(IdleTimer::new(timeout));
        }
        self
    }
}

fn finish(on_end: &mut Option<OnEnd>, outcome: BodyOutcome) {
    if let Some(on_end) = on_end.take() {
        on_end(outcome);
    }
}

impl<B> Body for ReportingBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        if *this.expired {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if this.inner.is_end_stream() {
                    *this.idle = None;
                    finish(this.on_end, BodyOutcome::Complete);
                } else if let Some(idle) = this.idle.as_mut() {
                    idle.rearm();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                let e: BoxError = e.into();
                *this.idle = None;
                let error = SupervisorError::Transport(format!("Upstream body failed: {}", e));
                finish(this.on_end, BodyOutcome::Failed(error));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                *this.idle = None;
                finish(this.on_end, BodyOutcome::Complete);
                Poll::Ready(None)
            }
            Poll::Pending => {
                let stalled = match this.idle.as_mut() {
                    Some(idle) => idle.sleep.as_mut().poll(cx).is_ready(),
                    None => false,
                };
                if !stalled {
                    return Poll::Pending;
                }

                *this.idle = None;
                *this.expired = true;
                finish(this.on_end, BodyOutcome::Failed(SupervisorError::Timeout));
                Poll::Ready(Some(Err(Box::new(SupervisorError::Timeout))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
