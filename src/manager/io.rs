//! Admission control for file operations.
//!
//! Loading and dumping master files is expensive so only a limited number
//! of them run at the same time. Operations that have to wait are queued
//! in one of two queues. Permits freed up go to the high priority queue
//! first.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

//------------ IoQueue -------------------------------------------------------

#[derive(Debug)]
pub struct IoQueue {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    limit: usize,
    active: usize,
    high: VecDeque<oneshot::Sender<()>>,
    low: VecDeque<oneshot::Sender<()>>,
}

impl IoQueue {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(IoQueue {
            state: Mutex::new(State {
                limit: limit.max(1),
                active: 0,
                high: VecDeque::new(),
                low: VecDeque::new(),
            }),
        })
    }

    /// Changes the number of concurrent operations.
    pub fn set_limit(&self, limit: usize) {
        let mut state = self.state.lock();
        state.limit = limit.max(1);
        while state.active < state.limit && Self::hand_over(&mut state) {
            state.active += 1;
        }
    }

    /// Returns the number of running and waiting operations.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.active, state.high.len() + state.low.len())
    }

    /// Waits for permission to start an operation.
    ///
    /// The operation may run for as long as the returned permit is kept.
    /// If the future is dropped before it resolves, the place in the
    /// queue is given up.
    pub async fn acquire(self: &Arc<Self>, high: bool) -> IoPermit {
        let rx = {
            let mut state = self.state.lock();
            if state.active < state.limit {
                state.active += 1;
                return IoPermit {
                    queue: self.clone(),
                };
            }
            let (tx, rx) = oneshot::channel();
            if high {
                state.high.push_back(tx);
            } else {
                state.low.push_back(tx);
            }
            trace!("I/O operation queued");
            rx
        };
        let mut waiter = Waiter {
            queue: self.clone(),
            rx: Some(rx),
        };
        waiter.wait().await;
        IoPermit {
            queue: self.clone(),
        }
    }

    /// Passes a running slot to the next waiter.
    ///
    /// Returns whether there was one.
    fn hand_over(state: &mut State) -> bool {
        while let Some(tx) = state.high.pop_front().or_else(|| state.low.pop_front()) {
            if tx.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.active > state.limit || !Self::hand_over(&mut state) {
            state.active = state.active.saturating_sub(1);
        }
    }
}

//------------ Waiter --------------------------------------------------------

/// A place in the queue.
struct Waiter {
    queue: Arc<IoQueue>,
    rx: Option<oneshot::Receiver<()>>,
}

impl Waiter {
    async fn wait(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            // The sender is never dropped without sending while the queue
            // exists, so an error can't happen in practice.
            let _ = rx.await;
        }
        self.rx = None;
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            // We might have been handed a slot just now.
            if rx.try_recv().is_ok() {
                self.queue.release();
            }
        }
    }
}

//------------ IoPermit ------------------------------------------------------

/// Permission to run a file operation.
#[derive(Debug)]
pub struct IoPermit {
    queue: Arc<IoQueue>,
}

impl Drop for IoPermit {
    fn drop(&mut self) {
        self.queue.release();
    }
}

//============ Testing =======================================================
