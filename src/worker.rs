//! The dedicated worker that exclusively owns the blocking consumer.
//!
//! Every operation against the consumer — including the poll loop's fetches —
//! is a [`Task`] queued onto one unbounded channel and executed in strict FIFO
//! order on a single `std::thread`. That funnel is what makes otherwise-racy
//! sequences like "assign, then seek, then poll" safe when issued from the
//! async side: they become totally ordered on the worker.
//!
//! The submitting side gets a [`Pending`] handle back for every command. It is
//! a plain future over the command's result; awaiting it is optional, and
//! dropping it turns the command into fire-and-forget (the worker's completion
//! send just fails silently). Failures inside a command resolve the handle with
//! the error — nothing is ever thrown across the thread boundary.

use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::consumer::BlockingConsumer;
use crate::error::{StreamError, StreamResult};
use crate::metrics_consts::{WORKER_COMMANDS_SUBMITTED, WORKER_COMMAND_FAILURES};

type Task<C> = Box<dyn FnOnce(&mut C) -> ControlFlow<()> + Send>;

/// Handle to a command's eventual result.
///
/// Resolves with the command's success value or failure cause once the worker
/// has executed it, or with [`StreamError::Closed`] if the worker shut down
/// before reaching it. Dropping the handle opts out of the result entirely.
pub struct Pending<T> {
    inner: PendingInner<T>,
}

enum PendingInner<T> {
    Ready(Option<StreamResult<T>>),
    Waiting(oneshot::Receiver<StreamResult<T>>),
}

impl<T> Pending<T> {
    /// An already-resolved handle, used for synchronous outcomes (e.g. closing
    /// an already-closed stream).
    pub(crate) fn ready(result: StreamResult<T>) -> Self {
        Self {
            inner: PendingInner::Ready(Some(result)),
        }
    }

    pub(crate) fn closed() -> Self {
        Self::ready(Err(StreamError::Closed))
    }

    fn waiting(rx: oneshot::Receiver<StreamResult<T>>) -> Self {
        Self {
            inner: PendingInner::Waiting(rx),
        }
    }
}

impl<T> Unpin for Pending<T> {}

// Manual impl: the waiting variant holds a oneshot receiver, which has no
// useful Debug representation of its own.
impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            PendingInner::Ready(_) => "ready",
            PendingInner::Waiting(_) => "waiting",
        };
        f.debug_struct("Pending").field("state", &state).finish()
    }
}

impl<T> Future for Pending<T> {
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Ready(slot) => Poll::Ready(slot.take().unwrap_or(Err(StreamError::Closed))),
            PendingInner::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // Worker dropped the task without running it: shut down first.
                Poll::Ready(Err(_)) => Poll::Ready(Err(StreamError::Closed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Owns the consumer on a dedicated thread and executes submitted commands
/// sequentially against it.
pub struct ConsumerWorker<C: BlockingConsumer> {
    tx: mpsc::UnboundedSender<Task<C>>,
}

impl<C: BlockingConsumer> ConsumerWorker<C> {
    /// Move `consumer` onto a fresh worker thread. From here on the thread is
    /// the only code that touches it.
    pub fn start(consumer: C) -> StreamResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Task<C>>();

        std::thread::Builder::new()
            .name("kafka-streamer-worker".to_string())
            .spawn(move || Self::run(consumer, rx))?;

        Ok(Self { tx })
    }

    fn run(mut consumer: C, mut rx: mpsc::UnboundedReceiver<Task<C>>) {
        debug!("Consumer worker started");
        while let Some(task) = rx.blocking_recv() {
            if task(&mut consumer).is_break() {
                break;
            }
        }
        // Dropping the receiver drops any tasks queued behind a terminal
        // command; their Pending handles resolve with StreamError::Closed.
        drop(rx);
        drop(consumer);
        debug!("Consumer worker stopped");
    }

    /// Queue `f` for sequential execution against the consumer.
    pub fn submit<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> StreamResult<T> + Send + 'static,
    {
        self.submit_inner(f, ControlFlow::Continue(()))
    }

    /// Queue `f` as the worker's final command: after it runs, the worker stops
    /// and every command still queued behind it resolves `Closed`.
    pub fn submit_terminal<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> StreamResult<T> + Send + 'static,
    {
        self.submit_inner(f, ControlFlow::Break(()))
    }

    fn submit_inner<T, F>(&self, f: F, flow: ControlFlow<()>) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> StreamResult<T> + Send + 'static,
    {
        metrics::counter!(WORKER_COMMANDS_SUBMITTED).increment(1);

        let (done_tx, done_rx) = oneshot::channel();
        let task: Task<C> = Box::new(move |consumer| {
            let result = f(consumer);
            if let Err(e) = &result {
                if !e.is_wakeup() {
                    metrics::counter!(WORKER_COMMAND_FAILURES).increment(1);
                    error!(error = %e, "Consumer command failed");
                }
            }
            // Receiver gone means the caller opted out of the result.
            done_tx.send(result).ok();
            flow
        });

        if self.tx.send(task).is_err() {
            return Pending::closed();
        }
        Pending::waiting(done_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockConsumer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_commands_run_in_submission_order() {
        let (consumer, _handle) = MockConsumer::new();
        let worker = ConsumerWorker::start(consumer).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut last = None;
        for i in 0..100 {
            let order = order.clone();
            last = Some(worker.submit(move |_c| {
                order.lock().unwrap().push(i);
                Ok(())
            }));
        }
        last.unwrap().await.unwrap();

        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_command_failure_resolves_pending() {
        let (consumer, _handle) = MockConsumer::new();
        let worker = ConsumerWorker::start(consumer).unwrap();

        let result: StreamResult<()> = worker
            .submit(|_c| Err(StreamError::Client("commit rejected".to_string())))
            .await;
        assert!(matches!(result, Err(StreamError::Client(_))));
    }

    #[tokio::test]
    async fn test_dropped_pending_is_fire_and_forget() {
        let (consumer, _handle) = MockConsumer::new();
        let worker = ConsumerWorker::start(consumer).unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            drop(worker.submit(move |_c| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        // A later awaited command proves the earlier one already executed.
        worker.submit(|_c| Ok(())).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_debug_reports_state_only() {
        let ready = Pending::ready(Ok(1));
        assert_eq!(format!("{ready:?}"), r#"Pending { state: "ready" }"#);

        let (_tx, rx) = tokio::sync::oneshot::channel::<StreamResult<i32>>();
        let waiting = Pending::waiting(rx);
        assert_eq!(format!("{waiting:?}"), r#"Pending { state: "waiting" }"#);
    }

    #[test]
    fn test_ready_pending_resolves_without_a_worker() {
        let mut handle = tokio_test::task::spawn(Pending::ready(Ok(7)));
        let result = tokio_test::assert_ready!(handle.poll());
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_commands_after_terminal_resolve_closed() {
        let (consumer, _handle) = MockConsumer::new();
        let worker = ConsumerWorker::start(consumer).unwrap();

        worker.submit_terminal(|_c| Ok(())).await.unwrap();

        // The worker thread has stopped; the channel is gone or the task is
        // dropped unexecuted. Either way the handle resolves Closed.
        let result: StreamResult<()> = worker.submit(|_c| Ok(())).await;
        assert!(matches!(result, Err(StreamError::Closed)));
    }
}
