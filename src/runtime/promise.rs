//! One-shot completion handles.
//!
//! A [`Promise`] is the write side held by whoever performs an operation on
//! the loop thread; the matching [`Completion`] is handed to the caller.
//! Completing consumes the promise, so a second completion cannot be
//! expressed. Dropping an uncompleted promise resolves the completion with
//! [`Error::Abandoned`].

use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::time::Duration;

/// Create a connected promise/completion pair.
pub fn promise<T>() -> (Promise<T>, Completion<T>) {
    let (tx, rx) = bounded(1);
    (
        Promise { tx: Some(tx) },
        Completion {
            rx,
            taken: None,
        },
    )
}

/// Write side of a one-shot result.
pub struct Promise<T> {
    tx: Option<Sender<Result<T>>>,
}

impl<T> Promise<T> {
    /// A promise nobody waits on.
    pub fn detached() -> Self {
        Promise { tx: None }
    }

    /// Resolve the paired completion.
    pub fn complete(mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            // The receiver may be gone; the outcome is simply unobserved.
            let sent = tx.try_send(result);
            debug_assert!(
                !matches!(sent, Err(crossbeam_channel::TrySendError::Full(_))),
                "promise completed twice"
            );
        }
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, err: Error) {
        self.complete(Err(err));
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(Err(Error::Abandoned));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("detached", &self.tx.is_none())
            .finish()
    }
}

/// Read side of a one-shot result.
pub struct Completion<T> {
    rx: Receiver<Result<T>>,
    taken: Option<Result<T>>,
}

impl<T> Completion<T> {
    /// A completion that is already resolved.
    pub fn ready(result: Result<T>) -> Self {
        let (p, c) = promise();
        p.complete(result);
        c
    }

    /// Block until the promise resolves.
    pub fn wait(mut self) -> Result<T> {
        if let Some(result) = self.taken.take() {
            return result;
        }
        self.rx.recv().unwrap_or(Err(Error::Abandoned))
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<T> {
        if let Some(result) = self.taken.take() {
            return result;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Abandoned),
        }
    }

    /// Non-blocking poll; returns `None` while the promise is pending.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        if let Some(result) = self.taken.take() {
            return Some(result);
        }
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::Abandoned)),
        }
    }

    /// True once the promise has resolved (the result stays available).
    pub fn is_complete(&mut self) -> bool {
        if self.taken.is_some() {
            return true;
        }
        match self.try_take() {
            Some(result) => {
                self.taken = Some(result);
                true
            }
            None => false,
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("resolved", &(self.taken.is_some() || !self.rx.is_empty()))
            .finish()
    }
}
