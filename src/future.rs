use futures::channel::oneshot;
use futures::ready;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::driver::Response;
use crate::error::ZkError;

type Finish<T> = Box<dyn FnOnce(Result<Response, ZkError>) -> T + Send>;

/// The pending result of an already-submitted operation.
///
/// Handed out by the `async_`-prefixed session methods. By the time the
/// caller holds one of these the request is with the driver, so dropping the
/// future abandons the answer but never the submission itself.
#[pin_project]
pub struct OpFuture<T> {
    #[pin]
    rx: oneshot::Receiver<Result<Response, ZkError>>,
    /// Code substituted when the driver drops the completion slot without
    /// writing it.
    canceled_as: ZkError,
    finish: Option<Finish<T>>,
}

impl<T> OpFuture<T> {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<Response, ZkError>>,
        canceled_as: ZkError,
        finish: impl FnOnce(Result<Response, ZkError>) -> T + Send + 'static,
    ) -> Self {
        OpFuture {
            rx,
            canceled_as,
            finish: Some(Box::new(finish)),
        }
    }
}

impl<T> Future for OpFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = match ready!(this.rx.poll(cx)) {
            Ok(res) => res,
            Err(oneshot::Canceled) => Err(*this.canceled_as),
        };
        let finish = this
            .finish
            .take()
            .expect("operation future polled after completion");
        Poll::Ready(finish(res))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_the_completion_through_finish() {
        let (tx, rx) = oneshot::channel();
        let fut = OpFuture::new(rx, ZkError::ConnectionLoss, |res| match res {
            Ok(Response::Empty) => "done",
            _ => "unexpected",
        });
        tx.send(Ok(Response::Empty)).unwrap();
        assert_eq!(futures::executor::block_on(fut), "done");
    }

    #[test]
    fn dropped_completion_slot_becomes_the_substituted_code() {
        let (tx, rx) = oneshot::channel();
        let fut = OpFuture::new(rx, ZkError::SessionExpired, |res| res.unwrap_err());
        drop(tx);
        assert_eq!(futures::executor::block_on(fut), ZkError::SessionExpired);
    }
}
