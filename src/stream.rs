//! The public stream facade.
//!
//! A [`ReadStream`] wraps one blocking consumer behind a worker thread and
//! pushes fetched records to a registered handler on the caller's runtime.
//! Every operation that touches the consumer becomes a command on the worker;
//! everything else is a caller-side state toggle. Operations return a
//! [`Pending`] handle — await it for the result, or drop it to fire and forget.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::runtime::Handle;
use tracing::info;

use crate::config::StreamOptions;
use crate::consumer::{BlockingConsumer, ConsumerWaker};
use crate::dispatch::{DispatchLoop, Lifecycle, StreamState};
use crate::error::{StreamError, StreamResult};
use crate::rdkafka_consumer::RdkafkaConsumer;
use crate::rebalance::{self, RebalanceReceiver};
use crate::types::{OffsetAndMetadata, Partition, PartitionInfo, Record};
use crate::worker::{ConsumerWorker, Pending};

type RecordHandler = Box<dyn FnMut(Record) + Send>;
type ErrorHandler = Box<dyn FnMut(StreamError) + Send>;
type PartitionsHandler = Box<dyn FnMut(HashSet<Partition>) + Send>;
type EndHandler = Box<dyn FnMut() + Send>;

/// Registered user callbacks. Invocation always takes the handler out of its
/// slot first and restores it afterwards, so a handler may safely call back
/// into the facade (pause, commit, even re-register) without deadlocking.
/// If a new handler was registered mid-invocation, the new one wins.
pub(crate) struct Handlers {
    record: Mutex<Option<RecordHandler>>,
    error: Mutex<Option<ErrorHandler>>,
    assigned: Mutex<Option<PartitionsHandler>>,
    revoked: Mutex<Option<PartitionsHandler>>,
    end: Mutex<Option<EndHandler>>,
}

impl Handlers {
    fn new() -> Self {
        Self {
            record: Mutex::new(None),
            error: Mutex::new(None),
            assigned: Mutex::new(None),
            revoked: Mutex::new(None),
            end: Mutex::new(None),
        }
    }

    fn has_record_handler(&self) -> bool {
        self.record.lock().unwrap().is_some()
    }

    pub(crate) fn take_record_handler(&self) -> Option<RecordHandler> {
        self.record.lock().unwrap().take()
    }

    pub(crate) fn restore_record_handler(&self, handler: RecordHandler) {
        let mut slot = self.record.lock().unwrap();
        if slot.is_none() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn report_error(&self, error: StreamError) {
        let taken = self.error.lock().unwrap().take();
        if let Some(mut handler) = taken {
            handler(error);
            let mut slot = self.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    /// Returns false when no handler was registered (the event is dropped).
    pub(crate) fn notify_assigned(&self, partitions: HashSet<Partition>) -> bool {
        Self::notify_partitions(&self.assigned, partitions)
    }

    pub(crate) fn notify_revoked(&self, partitions: HashSet<Partition>) -> bool {
        Self::notify_partitions(&self.revoked, partitions)
    }

    fn notify_partitions(
        slot: &Mutex<Option<PartitionsHandler>>,
        partitions: HashSet<Partition>,
    ) -> bool {
        let taken = slot.lock().unwrap().take();
        match taken {
            Some(mut handler) => {
                handler(partitions);
                let mut guard = slot.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(handler);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn notify_end(&self) {
        let taken = self.end.lock().unwrap().take();
        if let Some(mut handler) = taken {
            handler();
        }
    }
}

struct StreamInner<C: BlockingConsumer> {
    state: Arc<StreamState>,
    handlers: Arc<Handlers>,
    options: StreamOptions,
    /// Held until the first subscribe/assign moves it onto the worker.
    pending_consumer: Mutex<Option<C>>,
    rebalance_rx: Mutex<Option<RebalanceReceiver>>,
    worker: OnceLock<Arc<ConsumerWorker<C>>>,
    waker: Arc<dyn ConsumerWaker>,
}

/// Event-driven read stream over a blocking consumer.
///
/// Lifecycle: construct, register handlers, then `subscribe` or `assign` —
/// which lazily starts the worker and the poll/dispatch loop on the current
/// tokio runtime. `close` tears everything down; it interrupts an in-flight
/// poll via the consumer's wakeup primitive and rejects commands submitted
/// afterwards with [`StreamError::Closed`].
pub struct ReadStream<C: BlockingConsumer = RdkafkaConsumer> {
    inner: Arc<StreamInner<C>>,
}

impl<C: BlockingConsumer> Clone for ReadStream<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ReadStream<RdkafkaConsumer> {
    /// Build a stream over an rdkafka consumer created from `config`.
    pub fn create(config: &rdkafka::ClientConfig, options: StreamOptions) -> StreamResult<Self> {
        let (rebalance_tx, rebalance_rx) = rebalance::channel();
        let consumer = RdkafkaConsumer::from_config(config, rebalance_tx, options.max_batch_size)?;
        Ok(Self::wrap(consumer, rebalance_rx, options))
    }
}

impl<C: BlockingConsumer> ReadStream<C> {
    /// Wrap an already-built consumer. `rebalance_rx` is the receiving half of
    /// the channel the consumer's rebalance callbacks post into.
    pub fn wrap(consumer: C, rebalance_rx: RebalanceReceiver, options: StreamOptions) -> Self {
        let waker = consumer.waker();
        Self {
            inner: Arc::new(StreamInner {
                state: Arc::new(StreamState::new()),
                handlers: Arc::new(Handlers::new()),
                options,
                pending_consumer: Mutex::new(Some(consumer)),
                rebalance_rx: Mutex::new(Some(rebalance_rx)),
                worker: OnceLock::new(),
                waker,
            }),
        }
    }

    // ---- Handler registration ----

    /// Register the record handler. Must happen before the first
    /// `subscribe`/`assign`; later calls swap the handler in place without
    /// restarting anything.
    pub fn on_record(&self, handler: impl FnMut(Record) + Send + 'static) -> &Self {
        *self.inner.handlers.record.lock().unwrap() = Some(Box::new(handler));
        self
    }

    /// Register the handler for stream-level failures (poll errors). Command
    /// failures resolve their own `Pending` handles instead.
    pub fn on_error(&self, handler: impl FnMut(StreamError) + Send + 'static) -> &Self {
        *self.inner.handlers.error.lock().unwrap() = Some(Box::new(handler));
        self
    }

    pub fn on_partitions_assigned(
        &self,
        handler: impl FnMut(HashSet<Partition>) + Send + 'static,
    ) -> &Self {
        *self.inner.handlers.assigned.lock().unwrap() = Some(Box::new(handler));
        self
    }

    pub fn on_partitions_revoked(
        &self,
        handler: impl FnMut(HashSet<Partition>) + Send + 'static,
    ) -> &Self {
        *self.inner.handlers.revoked.lock().unwrap() = Some(Box::new(handler));
        self
    }

    /// Register the handler invoked once, after close, when delivery ends.
    pub fn on_end(&self, handler: impl FnMut() + Send + 'static) -> &Self {
        *self.inner.handlers.end.lock().unwrap() = Some(Box::new(handler));
        self
    }

    // ---- Subscription and assignment ----

    /// Join the consumer group for `topics`. The first call starts the worker
    /// and the dispatch loop; requires a registered record handler and a
    /// current tokio runtime.
    pub fn subscribe(&self, topics: Vec<String>) -> StreamResult<Pending<()>> {
        self.start_or_submit("subscribe", move |c| c.subscribe(&topics))
    }

    /// Take manual ownership of `partitions`, bypassing group coordination.
    pub fn assign(&self, partitions: Vec<Partition>) -> StreamResult<Pending<()>> {
        self.start_or_submit("assign", move |c| c.assign(&partitions))
    }

    fn start_or_submit<F>(&self, op: &'static str, f: F) -> StreamResult<Pending<()>>
    where
        F: FnOnce(&mut C) -> StreamResult<()> + Send + 'static,
    {
        if !self.inner.handlers.has_record_handler() {
            return Err(StreamError::HandlerRequired(op));
        }
        if self.inner.state.is_shutting_down() {
            return Err(StreamError::Closed);
        }

        if self.inner.state.begin_streaming() {
            let worker = match self.start_streaming() {
                Ok(worker) => worker,
                Err(e) => {
                    // Leave the lifecycle as it was found so a later attempt
                    // can start cleanly.
                    self.inner.state.abort_streaming();
                    return Err(e);
                }
            };
            let pending = worker.submit(f);
            // The first poll command queues behind this subscribe/assign, so
            // resuming delivery immediately cannot reorder anything.
            self.inner.state.resume();
            Ok(pending)
        } else {
            Ok(self.submit(f))
        }
    }

    /// Move the consumer onto its worker thread and spawn the dispatch and
    /// rebalance tasks on the current runtime. Runs at most once per stream.
    fn start_streaming(&self) -> StreamResult<Arc<ConsumerWorker<C>>> {
        // Resolve the runtime before touching anything else: failing here must
        // leave the stream exactly as it was.
        let handle = Handle::try_current()?;

        let consumer = self
            .inner
            .pending_consumer
            .lock()
            .unwrap()
            .take()
            .ok_or(StreamError::Closed)?;

        let worker = Arc::new(ConsumerWorker::start(consumer)?);
        self.inner.worker.set(worker.clone()).ok();

        if let Some(rx) = self.inner.rebalance_rx.lock().unwrap().take() {
            handle.spawn(rebalance::run_dispatcher(rx, self.inner.handlers.clone()));
        }
        handle.spawn(
            DispatchLoop {
                worker: worker.clone(),
                state: self.inner.state.clone(),
                handlers: self.inner.handlers.clone(),
                options: self.inner.options.clone(),
            }
            .run(),
        );

        info!("Streaming started");
        Ok(worker)
    }

    fn submit<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> StreamResult<T> + Send + 'static,
    {
        if self.inner.state.is_shutting_down() {
            return Pending::closed();
        }
        match self.inner.worker.get() {
            Some(worker) => worker.submit(f),
            None => Pending::ready(Err(StreamError::NotStarted)),
        }
    }

    pub fn unsubscribe(&self) -> Pending<()> {
        self.submit(|c| c.unsubscribe())
    }

    pub fn subscription(&self) -> Pending<HashSet<String>> {
        self.submit(|c| c.subscription())
    }

    /// The partitions currently owned by this consumer.
    pub fn assignment(&self) -> Pending<HashSet<Partition>> {
        self.submit(|c| c.assignment())
    }

    // ---- Flow control ----

    /// Suspend record delivery. Polling already in flight is unaffected; the
    /// fetched batch is held until `resume`.
    pub fn pause(&self) -> &Self {
        self.inner.state.pause();
        self
    }

    /// Re-enable delivery, picking up at the next unconsumed record.
    pub fn resume(&self) -> &Self {
        self.inner.state.resume();
        self
    }

    /// Stop fetching from specific partitions at the consumer level. Composes
    /// with, and is independent of, the stream-level `pause`.
    pub fn pause_partitions(&self, partitions: Vec<Partition>) -> Pending<()> {
        self.submit(move |c| c.pause_partitions(&partitions))
    }

    pub fn resume_partitions(&self, partitions: Vec<Partition>) -> Pending<()> {
        self.submit(move |c| c.resume_partitions(&partitions))
    }

    // ---- Offsets ----

    pub fn seek(&self, partition: Partition, offset: i64) -> Pending<()> {
        self.submit(move |c| c.seek(&partition, offset))
    }

    pub fn seek_to_beginning(&self, partitions: Vec<Partition>) -> Pending<()> {
        self.submit(move |c| c.seek_to_beginning(&partitions))
    }

    pub fn seek_to_end(&self, partitions: Vec<Partition>) -> Pending<()> {
        self.submit(move |c| c.seek_to_end(&partitions))
    }

    /// Commit the current position of every assigned partition. Resolves with
    /// the offsets actually committed.
    pub fn commit(&self) -> Pending<HashMap<Partition, OffsetAndMetadata>> {
        self.submit(|c| c.commit(None))
    }

    /// Commit explicit offsets.
    pub fn commit_offsets(
        &self,
        offsets: HashMap<Partition, OffsetAndMetadata>,
    ) -> Pending<HashMap<Partition, OffsetAndMetadata>> {
        self.submit(move |c| c.commit(Some(&offsets)))
    }

    /// The last committed offset for `partition`, if any.
    pub fn committed(&self, partition: Partition) -> Pending<Option<OffsetAndMetadata>> {
        self.submit(move |c| c.committed(&partition))
    }

    /// The offset of the next record that would be fetched from `partition`.
    pub fn position(&self, partition: Partition) -> Pending<i64> {
        self.submit(move |c| c.position(&partition))
    }

    pub fn beginning_offsets(&self, partitions: Vec<Partition>) -> Pending<HashMap<Partition, i64>> {
        self.submit(move |c| c.beginning_offsets(&partitions))
    }

    pub fn beginning_offset(&self, partition: Partition) -> Pending<i64> {
        self.submit(move |c| {
            let offsets = c.beginning_offsets(std::slice::from_ref(&partition))?;
            offsets
                .get(&partition)
                .copied()
                .ok_or_else(|| StreamError::Client(format!("no beginning offset for {partition}")))
        })
    }

    pub fn end_offsets(&self, partitions: Vec<Partition>) -> Pending<HashMap<Partition, i64>> {
        self.submit(move |c| c.end_offsets(&partitions))
    }

    pub fn end_offset(&self, partition: Partition) -> Pending<i64> {
        self.submit(move |c| {
            let offsets = c.end_offsets(std::slice::from_ref(&partition))?;
            offsets
                .get(&partition)
                .copied()
                .ok_or_else(|| StreamError::Client(format!("no end offset for {partition}")))
        })
    }

    /// For each partition, the offset of the first record at or after the given
    /// timestamp (ms since epoch).
    pub fn offsets_for_times(
        &self,
        timestamps: HashMap<Partition, i64>,
    ) -> Pending<HashMap<Partition, Option<i64>>> {
        self.submit(move |c| c.offsets_for_times(&timestamps))
    }

    pub fn offset_for_time(&self, partition: Partition, timestamp: i64) -> Pending<Option<i64>> {
        self.submit(move |c| {
            let mut timestamps = HashMap::new();
            timestamps.insert(partition.clone(), timestamp);
            let offsets = c.offsets_for_times(&timestamps)?;
            Ok(offsets.get(&partition).copied().flatten())
        })
    }

    // ---- Metadata ----

    pub fn list_topics(&self) -> Pending<HashMap<String, Vec<PartitionInfo>>> {
        self.submit(|c| c.list_topics())
    }

    pub fn partitions_for(&self, topic: impl Into<String>) -> Pending<Vec<PartitionInfo>> {
        let topic = topic.into();
        self.submit(move |c| c.partitions_for(&topic))
    }

    // ---- Shutdown ----

    /// Close the stream: interrupt any blocked poll, run the client's close as
    /// the worker's final command, and reject everything submitted afterwards.
    /// Idempotent — repeated closes resolve `Ok` immediately.
    pub fn close(&self) -> Pending<()> {
        match self.inner.state.begin_close() {
            Some(Lifecycle::Running) => {
                info!("Closing stream");
                self.inner.waker.wakeup();
                let state = self.inner.state.clone();
                match self.inner.worker.get() {
                    Some(worker) => worker.submit_terminal(move |c| {
                        let result = c.close();
                        state.finish_close();
                        result
                    }),
                    None => {
                        state.finish_close();
                        Pending::ready(Ok(()))
                    }
                }
            }
            Some(_) => {
                // Never started; just release the client.
                let consumer = self.inner.pending_consumer.lock().unwrap().take();
                drop(consumer);
                self.inner.state.finish_close();
                Pending::ready(Ok(()))
            }
            None => Pending::ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockConsumer;

    fn mock_stream() -> (ReadStream<MockConsumer>, crate::test_utils::MockHandle) {
        let (consumer, handle) = MockConsumer::new();
        let rx = handle.take_rebalance_rx();
        (
            ReadStream::wrap(consumer, rx, StreamOptions::default()),
            handle,
        )
    }

    #[tokio::test]
    async fn test_subscribe_requires_record_handler() {
        let (stream, _handle) = mock_stream();
        let err = stream.subscribe(vec!["t".to_string()]).unwrap_err();
        assert!(matches!(err, StreamError::HandlerRequired("subscribe")));

        let err = stream.assign(vec![Partition::new("t", 0)]).unwrap_err();
        assert!(matches!(err, StreamError::HandlerRequired("assign")));
    }

    #[tokio::test]
    async fn test_queries_before_start_fail_fast() {
        let (stream, _handle) = mock_stream();
        let result = stream.assignment().await;
        assert!(matches!(result, Err(StreamError::NotStarted)));
    }

    #[tokio::test]
    async fn test_close_before_start_is_immediate_and_idempotent() {
        let (stream, _handle) = mock_stream();
        stream.close().await.unwrap();
        stream.close().await.unwrap();

        let err = stream.subscribe(vec!["t".to_string()]);
        // Handler check runs first; register one to reach the closed check.
        assert!(err.is_err());
        stream.on_record(|_record| {});
        let err = stream.subscribe(vec!["t".to_string()]).unwrap_err();
        assert!(matches!(err, StreamError::Closed));
    }

    #[test]
    fn test_subscribe_outside_a_runtime_fails_and_rolls_back() {
        let (stream, _handle) = mock_stream();
        stream.on_record(|_record| {});

        // No runtime here: the error must come back instead of a panic, and it
        // must not leave the stream wedged half-started.
        let err = stream.subscribe(vec!["t".to_string()]).unwrap_err();
        assert!(matches!(err, StreamError::Runtime(_)));

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            stream
                .subscribe(vec!["t".to_string()])
                .unwrap()
                .await
                .unwrap();
            stream.close().await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_commands_after_close_are_rejected() {
        let (stream, handle) = mock_stream();
        stream.on_record(|_record| {});
        stream.subscribe(vec!["t".to_string()]).unwrap().await.unwrap();

        stream.close().await.unwrap();
        let result = stream.assignment().await;
        assert!(matches!(result, Err(StreamError::Closed)));
        assert!(handle.is_closed());
    }
}
