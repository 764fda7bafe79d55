//! The poll/dispatch loop and stream-level flow control.
//!
//! The original callback-chained polling scheme is expressed here as one plain
//! async loop running on the caller's runtime. Each iteration does exactly one
//! of: wait for resume while paused, submit a bounded-timeout fetch command to
//! the worker, or deliver one slice of the current batch and yield. Slicing
//! bounds how much handler work happens per scheduling turn so a large batch
//! never starves unrelated tasks sharing the runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::StreamOptions;
use crate::consumer::BlockingConsumer;
use crate::error::StreamError;
use crate::metrics_consts::{
    STREAM_BATCHES_FETCHED, STREAM_BATCH_SIZE, STREAM_EMPTY_POLLS, STREAM_POLL_ERRORS,
    STREAM_RECORDS_DELIVERED,
};
use crate::stream::Handlers;
use crate::types::Record;
use crate::worker::ConsumerWorker;

/// Lifecycle phases of a stream. Transitions only ever move forward:
/// Idle → Running → Closing → Closed (Idle may jump straight to Closing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Idle = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl Lifecycle {
    #[cfg(test)]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Idle,
            1 => Lifecycle::Running,
            2 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }
}

/// The flags shared between the caller context and the dispatch loop.
///
/// `paused` and the lifecycle phase are the only state touched from both sides;
/// everything else either lives behind the worker's command funnel or is owned
/// by the dispatch task.
pub(crate) struct StreamState {
    lifecycle: AtomicU8,
    paused: AtomicBool,
    /// Wakes the dispatch loop out of a pause wait, on resume or close.
    wake: Notify,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            lifecycle: AtomicU8::new(Lifecycle::Idle as u8),
            // Delivery starts suspended; the first subscribe/assign resumes it
            // once the worker is up.
            paused: AtomicBool::new(true),
            wake: Notify::new(),
        }
    }

    #[cfg(test)]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    /// Idle → Running; false if streaming already started or the stream is
    /// shutting down.
    pub fn begin_streaming(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Idle as u8,
                Lifecycle::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to Closing from whichever live phase we are in. Returns the phase
    /// we left, or `None` when close already happened.
    pub fn begin_close(&self) -> Option<Lifecycle> {
        for from in [Lifecycle::Idle, Lifecycle::Running] {
            if self
                .lifecycle
                .compare_exchange(
                    from as u8,
                    Lifecycle::Closing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                self.wake.notify_one();
                return Some(from);
            }
        }
        None
    }

    /// Running → Idle, undoing `begin_streaming` when startup fails before the
    /// worker exists. A close that raced in wins; the failed CAS is ignored.
    pub fn abort_streaming(&self) {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Running as u8,
                Lifecycle::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok();
    }

    pub fn finish_close(&self) {
        self.lifecycle
            .store(Lifecycle::Closed as u8, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) >= Lifecycle::Closing as u8
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clears the pause flag; true if the flag actually flipped (and the
    /// dispatch loop was woken to re-enter delivery).
    pub fn resume(&self) -> bool {
        let was_paused = self.paused.swap(false, Ordering::SeqCst);
        if was_paused {
            self.wake.notify_one();
        }
        was_paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn wait_wake(&self) {
        self.wake.notified().await;
    }
}

/// The self-contained poll/deliver task. One per stream, spawned on the
/// caller's runtime by the first `subscribe`/`assign`.
pub(crate) struct DispatchLoop<C: BlockingConsumer> {
    pub worker: Arc<ConsumerWorker<C>>,
    pub state: Arc<StreamState>,
    pub handlers: Arc<Handlers>,
    pub options: StreamOptions,
}

impl<C: BlockingConsumer> DispatchLoop<C> {
    pub async fn run(self) {
        // Cursor over the most recently fetched, not-yet-delivered batch.
        let mut current: VecDeque<Record> = VecDeque::new();

        loop {
            if self.state.is_shutting_down() {
                break;
            }
            if self.state.is_paused() {
                self.state.wait_wake().await;
                continue;
            }

            if current.is_empty() {
                let timeout = self.options.poll_timeout;
                match self.worker.submit(move |c| c.poll(timeout)).await {
                    Ok(batch) if !batch.is_empty() => {
                        metrics::counter!(STREAM_BATCHES_FETCHED).increment(1);
                        metrics::histogram!(STREAM_BATCH_SIZE).record(batch.len() as f64);
                        current = VecDeque::from(batch);
                    }
                    Ok(_) => {
                        // Timed out with nothing available; back off briefly so
                        // an idle stream neither busy-spins nor goes deaf.
                        metrics::counter!(STREAM_EMPTY_POLLS).increment(1);
                        tokio::time::sleep(self.options.empty_backoff).await;
                    }
                    Err(e) if e.is_wakeup() => {
                        // Close interrupted the fetch; the loop head sees the
                        // lifecycle change.
                        debug!("Poll interrupted by wakeup");
                    }
                    Err(StreamError::Closed) => break,
                    Err(e) => {
                        metrics::counter!(STREAM_POLL_ERRORS).increment(1);
                        warn!(error = %e, "Poll failed; continuing");
                        self.handlers.report_error(e);
                        tokio::time::sleep(self.options.empty_backoff).await;
                    }
                }
            } else {
                self.deliver_slice(&mut current);
                // One slice per scheduling turn.
                tokio::task::yield_now().await;
            }
        }

        debug!("Dispatch loop exited");
        self.handlers.notify_end();
    }

    /// Deliver up to `slice_size` records, re-checking pause/close before each
    /// one so flow control takes effect mid-batch, not just at batch edges.
    fn deliver_slice(&self, current: &mut VecDeque<Record>) {
        let mut handler = self.handlers.take_record_handler();
        let mut delivered = 0u64;

        while (delivered as usize) < self.options.slice_size {
            if self.state.is_paused() || self.state.is_shutting_down() {
                break;
            }
            let Some(record) = current.pop_front() else {
                break;
            };
            match handler.as_mut() {
                Some(h) => h(record),
                // No handler: the record is consumed and discarded, matching
                // the contract that delivery only targets the current handler.
                None => {}
            }
            delivered += 1;
        }

        metrics::counter!(STREAM_RECORDS_DELIVERED).increment(delivered);
        if let Some(h) = handler {
            self.handlers.restore_record_handler(h);
        }
    }
}
