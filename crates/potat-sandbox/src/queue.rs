//! Admission queue: a bounded FIFO feeding a single consumer.
//!
//! Isolates are expensive; one at a time keeps the resource budget
//! predictable. The queue is the serialization point: however many HTTP
//! requests arrive concurrently, evaluations run strictly one after
//! another, in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::QueueError;
use crate::runner::IsolateRunner;

/// Default queue bound.
pub const DEFAULT_CAPACITY: usize = 20;

/// A queued evaluation and its single-use completion channel.
struct Waiter {
    code: String,
    msg: Value,
    resolver: oneshot::Sender<String>,
}

struct QueueState {
    waiters: VecDeque<Waiter>,
    draining: bool,
}

/// Serializes evaluations into the isolate runner.
pub struct AdmissionQueue {
    runner: Arc<IsolateRunner>,
    state: Mutex<QueueState>,
    capacity: usize,
}

impl AdmissionQueue {
    /// Queue with the default capacity of 20.
    pub fn new(runner: Arc<IsolateRunner>) -> Arc<Self> {
        Self::with_capacity(runner, DEFAULT_CAPACITY)
    }

    /// Queue with an explicit capacity.
    pub fn with_capacity(runner: Arc<IsolateRunner>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            runner,
            state: Mutex::new(QueueState {
                waiters: VecDeque::new(),
                draining: false,
            }),
            capacity,
        })
    }

    /// Admit one evaluation.
    ///
    /// Overflow is rejected before the waiter is enqueued; admitted
    /// requests resolve with the runner's result string once the consumer
    /// reaches them.
    pub async fn submit(self: &Arc<Self>, code: String, msg: Value) -> Result<String, QueueError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.waiters.len() >= self.capacity {
                tracing::warn!(queued = state.waiters.len(), "queue full, rejecting");
                return Err(QueueError::QueueFull {
                    capacity: self.capacity,
                });
            }
            state.waiters.push_back(Waiter {
                code,
                msg,
                resolver: tx,
            });
            if !state.draining {
                state.draining = true;
                tokio::spawn(Arc::clone(self).drain());
            }
        }
        rx.await.map_err(|_| QueueError::ConsumerGone)
    }

    /// Current queue depth.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.waiters.len()
    }

    /// Consumer loop: pop the head, run it to completion, deliver, repeat.
    /// The idle transition happens under the same lock as admission, so a
    /// submit racing an empty pop always finds either a live consumer or
    /// the idle flag.
    async fn drain(self: Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.lock().await;
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            let result = self.runner.run(&waiter.code, &waiter.msg).await;
            if waiter.resolver.send(result).is_err() {
                tracing::debug!("waiter dropped before result delivery");
            }
        }
    }
}
