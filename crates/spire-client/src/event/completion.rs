//! Exactly-once completion of async commands.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::ClientError;

/// The sending half of an async command's result.
///
/// Completing consumes it, and dropping it unfinished reports
/// [`ClientError::Aborted`], so the caller hears back exactly once no
/// matter how the command ends.
pub(crate) struct Completion<T> {
    tx: Option<oneshot::Sender<Result<T, ClientError>>>,
}

impl<T> Completion<T> {
    pub fn complete(mut self, result: Result<T, ClientError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(ClientError::Aborted));
        }
    }
}

/// A submitted async command.
///
/// Await the handle (or call [`wait_blocking`](Self::wait_blocking) off the
/// runtime) for the result. [`abort`](Self::abort) cancels the command; its
/// connection is closed rather than pooled and the result is
/// [`ClientError::Aborted`].
#[derive(Debug)]
pub struct CommandHandle<T> {
    rx: oneshot::Receiver<Result<T, ClientError>>,
    abort: Option<oneshot::Sender<()>>,
}

impl<T> CommandHandle<T> {
    pub fn abort(&mut self) {
        if let Some(tx) = self.abort.take() {
            let _ = tx.send(());
        }
    }

    /// Blocks the current thread until the command finishes. Must not be
    /// called from inside an async runtime.
    pub fn wait_blocking(self) -> Result<T, ClientError> {
        self.rx.blocking_recv().unwrap_or(Err(ClientError::Aborted))
    }
}

impl<T> Future for CommandHandle<T> {
    type Output = Result<T, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ClientError::Aborted)))
    }
}

/// Creates a completion, the caller's handle, and the receiver the driver
/// watches for an abort.
pub(crate) fn channel<T>() -> (Completion<T>, CommandHandle<T>, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let (abort_tx, abort_rx) = oneshot::channel();
    (
        Completion { tx: Some(tx) },
        CommandHandle {
            rx,
            abort: Some(abort_tx),
        },
        abort_rx,
    )
}
