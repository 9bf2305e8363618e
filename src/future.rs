use crate::error::DhtError;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    sync::oneshot,
    task::{self, JoinHandle},
};

/// Result of a DHT operation that runs in the background.
///
/// Resolves to `DhtError::Cancelled` when the operation is aborted, e.g. because the controller
/// that started it stopped.
#[must_use = "futures do nothing unless polled"]
pub struct DhtFuture<T> {
    rx: oneshot::Receiver<Result<T, DhtError>>,
}

impl<T: Send + 'static> DhtFuture<T> {
    /// Run `future` on its own task.
    pub(crate) fn spawn<F>(future: F) -> (Self, JoinHandle<()>)
    where
        F: Future<Output = Result<T, DhtError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = task::spawn(async move {
            tx.send(future.await).ok();
        });

        (Self { rx }, handle)
    }
}

impl<T> DhtFuture<T> {
    /// Already completed operation.
    pub fn ready(result: Result<T, DhtError>) -> Self {
        let (tx, rx) = oneshot::channel();
        tx.send(result).ok();
        Self { rx }
    }

    pub fn failed(error: DhtError) -> Self {
        Self::ready(Err(error))
    }
}

impl<T> Future for DhtFuture<T> {
    type Output = Result<T, DhtError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DhtError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
