#![warn(missing_docs)]

//! # potat-sandbox
//!
//! Execution core of the PotatEval service.
//!
//! Untrusted snippets run in a deno_core V8 isolate with no filesystem,
//! module, or ambient network access. The only bridge to the host is a
//! `fetch` binding that is concurrency-capped and SSRF-guarded on both the
//! literal host and every resolved DNS answer.
//!
//! ## Security model
//!
//! - **Fresh isolate per evaluation**: no state leakage between snippets
//! - **8 MiB heap cap**: a near-heap-limit callback terminates the guest
//! - **5 s wall clock**: a watchdog thread terminates CPU-bound loops
//! - **Serial admission**: a bounded FIFO feeds a single consumer, so at
//!   most one isolate exists at any instant
//! - **Value-copy boundary**: everything crossing the host/guest boundary
//!   travels as JSON strings through ops

pub mod addr;
pub mod error;
pub mod fetch;
pub mod ops;
pub mod queue;
pub mod runner;
pub mod shape;

pub use error::{EvalError, QueueError};
pub use queue::AdmissionQueue;
pub use runner::{IsolateRunner, RunnerConfig};

/// Collaborator that populates the guest global scope with helper bindings
/// before user code runs.
///
/// The returned source is evaluated in the guest after the host bridge is
/// installed and before the shaped user script. Implementations hold the
/// helper bundle; the sandbox only promises to run it.
pub trait UtilsInjector: Send + Sync {
    /// JavaScript source evaluated in the guest global scope.
    fn source(&self) -> String;
}

/// Injector that adds no bindings.
pub struct NoopUtils;

impl UtilsInjector for NoopUtils {
    fn source(&self) -> String {
        String::new()
    }
}
