// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types.

use thiserror::Error;

/// A queue operation was attempted on a queue that was already closed.
///
/// This is a contract violation: each queue has a single authorized closer,
/// and a producer must not send after closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClosedQueueError {
    /// Sending on a closed queue.
    #[error("send on a closed queue")]
    Send,
    /// Closing an already closed queue.
    #[error("close of a closed queue")]
    Close,
}

/// Outcome of a non-blocking receive that didn't yield an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// The queue is open but currently holds no items.
    #[error("queue is empty")]
    Empty,
    /// The queue is closed and all its items were received.
    #[error("queue is closed and drained")]
    Exhausted,
}

/// A recoverable failure to process a single job.
///
/// Carried inside a [`JobResult`](crate::JobResult); it never stops the worker
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    /// The processing function reported a failure.
    #[error("processing failed: {0}")]
    Failed(String),
    /// The processing function panicked.
    #[error("processing panicked: {0}")]
    Panicked(String),
}

impl ProcessingError {
    /// Builds a [`ProcessingError::Panicked`] from the payload of a caught
    /// panic.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        ProcessingError::Panicked(message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(ClosedQueueError::Send.to_string(), "send on a closed queue");
        assert_eq!(
            ClosedQueueError::Close.to_string(),
            "close of a closed queue"
        );
        assert_eq!(
            ProcessingError::Failed("bad input".into()).to_string(),
            "processing failed: bad input"
        );
    }

    #[test]
    fn panic_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(
            ProcessingError::from_panic(payload),
            ProcessingError::Panicked("static message".into())
        );

        let value = 42;
        let payload = std::panic::catch_unwind(|| panic!("formatted {value}")).unwrap_err();
        assert_eq!(
            ProcessingError::from_panic(payload),
            ProcessingError::Panicked("formatted 42".into())
        );

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7u32)).unwrap_err();
        assert_eq!(
            ProcessingError::from_panic(payload),
            ProcessingError::Panicked("unknown panic payload".into())
        );
    }
}
