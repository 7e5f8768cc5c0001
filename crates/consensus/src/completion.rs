//! One-shot completion handles
//!
//! A [`Completion`] is held by whoever produces a result; the matching
//! [`CompletionHandle`] is handed to the submitter. Each completion resolves at
//! most once. Dropping a completion without resolving it makes the handle
//! report [`ConsensusError::Shutdown`].

use crate::error::{ConsensusError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::time::Duration;

/// Producer side of a one-shot result
pub struct Completion<T> {
    tx: Sender<T>,
}

/// Consumer side of a one-shot result
pub struct CompletionHandle<T> {
    rx: Receiver<T>,
}

/// Create a connected completion pair
pub fn completion<T>() -> (Completion<T>, CompletionHandle<T>) {
    let (tx, rx) = bounded(1);
    (Completion { tx }, CompletionHandle { rx })
}

impl<T> Completion<T> {
    /// Resolve the handle; consumes the completion so it cannot fire twice
    pub fn resolve(self, value: T) {
        // The submitter may have stopped waiting
        let _ = self.tx.send(value);
    }
}

impl<T> CompletionHandle<T> {
    /// A handle that is already resolved
    pub fn ready(value: T) -> Self {
        let (done, handle) = completion();
        done.resolve(value);
        handle
    }

    /// Block until the result arrives
    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| ConsensusError::Shutdown)
    }

    /// Block until the result arrives or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(ConsensusError::timeout("completion")),
            Err(RecvTimeoutError::Disconnected) => Err(ConsensusError::Shutdown),
        }
    }

    /// Non-blocking poll; `None` while still pending
    pub fn try_get(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ConsensusError::Shutdown)),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("ready", &!self.rx.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_then_wait() {
        let (done, handle) = completion();
        done.resolve(42u32);
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_dropped_completion_reports_shutdown() {
        let (done, handle) = completion::<u32>();
        drop(done);
        assert_eq!(handle.wait(), Err(ConsensusError::Shutdown));
    }

    #[test]
    fn test_pending_handle_times_out() {
        let (_done, handle) = completion::<u32>();
        assert!(handle.try_get().is_none());
        let err = handle.wait_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, ConsensusError::Timeout { .. }));
    }
}
