//! One-shot asynchronous results
//!
//! Operations that report their outcome once (extra info updates, relay
//! changes, mixer calls, media player loads) return a [`Completion`]. It can
//! be awaited directly or dropped if the caller does not care.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Pending result of an asynchronous operation
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Sending half kept by the task that finishes the operation
#[derive(Debug)]
pub(crate) struct Completer<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn channel() -> (Completer<T>, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        (Completer { tx }, Completion { rx })
    }

    /// Already finished
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (completer, completion) = Self::channel();
        completer.complete(result);
        completion
    }

    /// Wait for the result. A dropped operation yields [`Error::Cancelled`].
    pub async fn wait(self) -> Result<T> {
        self.await
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::Cancelled)))
    }
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, result: Result<T>) {
        // The caller may have dropped the Completion
        let _ = self.tx.send(result);
    }
}
