//! Error types for the evaluation core.

use thiserror::Error;

/// Failures of a single evaluation.
///
/// Every variant's `Display` reads `<ErrorKindName>: <message>` so the
/// runner can surface it to the caller as the `🚫`-prefixed sentinel
/// string. Guest errors never reach the HTTP layer as errors.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The guest threw. The payload is already `<name>: <message>`, either
    /// captured by the prelude or recovered from a script-level failure.
    #[error("{0}")]
    GuestThrew(String),

    /// Wall-clock budget exhausted; the isolate was terminated.
    #[error("TimeoutError: evaluation exceeded {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 approached the heap cap and execution was terminated.
    #[error("RangeError: isolate heap limit exceeded")]
    HeapLimit,

    /// Any other host-side failure.
    #[error("InternalError: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Failures of the admission queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue already holds its maximum number of waiters.
    #[error("queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue bound.
        capacity: usize,
    },

    /// The consumer dropped the reply channel without delivering a result.
    #[error("consumer dropped the reply channel")]
    ConsumerGone,
}
