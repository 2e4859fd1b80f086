//! Concurrency slots shared by every node of one harness run.
//!
//! A bounded semaphore with direct hand-off: when a slot is released while
//! somebody is queued, the slot passes straight to the oldest waiter and the
//! running count does not change, so no third party can grab it in between.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::lock;

/// Outcome of a non-blocking acquire.
#[derive(Debug)]
pub enum Acquire {
    /// A free slot was taken immediately.
    Ready,
    /// No slot was free; the receiver fires when one is handed over.
    Queued(oneshot::Receiver<()>),
}

#[derive(Debug, Default)]
struct SlotState {
    running: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// The scheduler context: `max` parallel slots with FIFO hand-off.
#[derive(Debug)]
pub struct Slots {
    max: usize,
    state: Mutex<SlotState>,
}

impl Slots {
    /// Creates a context with `max` slots, none of them taken. A `max` of 0
    /// is treated as 1.
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(SlotState::default()),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of slots currently held.
    pub fn running(&self) -> usize {
        lock(&self.state).running
    }

    /// Number of acquirers queued for a hand-off.
    pub fn waiting(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    /// Takes a slot if one is free, otherwise joins the queue.
    pub fn try_acquire(&self) -> Acquire {
        let mut state = lock(&self.state);
        if state.running < self.max {
            state.running += 1;
            return Acquire::Ready;
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Acquire::Queued(rx)
    }

    /// Waits for a slot. Returns `true` if it arrived by hand-off.
    pub async fn acquire(&self) -> bool {
        match self.try_acquire() {
            Acquire::Ready => false,
            Acquire::Queued(rx) => {
                // The sender is only ever consumed by `release`.
                let _ = rx.await;
                true
            }
        }
    }

    /// Gives up a slot. Returns `true` if it was handed to a waiter.
    ///
    /// Waiters whose receiver has gone away are skipped.
    pub fn release(&self) -> bool {
        let mut state = lock(&self.state);
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return true;
            }
        }
        state.running = state.running.saturating_sub(1);
        false
    }
}
