//! The blocking consumer interface the streamer adapts.
//!
//! Implementations are assumed to be *not* safe for concurrent use: every
//! method takes `&mut self` and the [`ConsumerWorker`](crate::worker::ConsumerWorker)
//! is the only code that ever holds the instance once streaming starts. The one
//! escape hatch is [`ConsumerWaker`], which must be callable from any thread to
//! unblock an in-progress [`BlockingConsumer::poll`].
//!
//! Rebalance notifications are wired at construction time, not through this
//! trait: an implementation that participates in consumer groups takes a
//! [`RebalanceEvent`](crate::rebalance::RebalanceEvent) sender when it is built
//! and fires events from whatever thread invokes its internal callbacks
//! (for rdkafka that is the worker thread, mid-poll).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StreamResult;
use crate::types::{OffsetAndMetadata, Partition, PartitionInfo, Record};

/// Interrupts a blocking poll from another thread. Idempotent; a wakeup with no
/// poll in flight is consumed by the next poll attempt.
pub trait ConsumerWaker: Send + Sync {
    fn wakeup(&self);
}

/// Blocking, single-thread-confined view of a partitioned-log consumer.
///
/// `poll` returns a possibly-empty batch after at most `timeout`, or
/// `Err(StreamError::WakeUp)` when interrupted by the waker. All other methods
/// block until the client answers.
pub trait BlockingConsumer: Send + 'static {
    fn poll(&mut self, timeout: Duration) -> StreamResult<Vec<Record>>;

    fn subscribe(&mut self, topics: &[String]) -> StreamResult<()>;
    fn unsubscribe(&mut self) -> StreamResult<()>;
    fn subscription(&mut self) -> StreamResult<HashSet<String>>;

    fn assign(&mut self, partitions: &[Partition]) -> StreamResult<()>;
    fn assignment(&mut self) -> StreamResult<HashSet<Partition>>;

    fn seek(&mut self, partition: &Partition, offset: i64) -> StreamResult<()>;
    fn seek_to_beginning(&mut self, partitions: &[Partition]) -> StreamResult<()>;
    fn seek_to_end(&mut self, partitions: &[Partition]) -> StreamResult<()>;

    /// Commit explicit offsets, or the current positions of the assignment when
    /// `offsets` is `None`. Returns the offsets actually committed.
    fn commit(
        &mut self,
        offsets: Option<&HashMap<Partition, OffsetAndMetadata>>,
    ) -> StreamResult<HashMap<Partition, OffsetAndMetadata>>;
    fn committed(&mut self, partition: &Partition) -> StreamResult<Option<OffsetAndMetadata>>;
    fn position(&mut self, partition: &Partition) -> StreamResult<i64>;

    /// Suppress fetching for specific partitions; the subscription stays intact.
    fn pause_partitions(&mut self, partitions: &[Partition]) -> StreamResult<()>;
    fn resume_partitions(&mut self, partitions: &[Partition]) -> StreamResult<()>;

    fn beginning_offsets(
        &mut self,
        partitions: &[Partition],
    ) -> StreamResult<HashMap<Partition, i64>>;
    fn end_offsets(&mut self, partitions: &[Partition]) -> StreamResult<HashMap<Partition, i64>>;
    /// For each partition, the offset of the first record at or after the given
    /// timestamp (ms since epoch), or `None` when no such record exists.
    fn offsets_for_times(
        &mut self,
        timestamps: &HashMap<Partition, i64>,
    ) -> StreamResult<HashMap<Partition, Option<i64>>>;

    fn list_topics(&mut self) -> StreamResult<HashMap<String, Vec<PartitionInfo>>>;
    fn partitions_for(&mut self, topic: &str) -> StreamResult<Vec<PartitionInfo>>;

    /// Release the client. The worker drops the instance right after this runs.
    fn close(&mut self) -> StreamResult<()>;

    /// Handle for interrupting a blocking poll; taken once before the consumer
    /// moves onto the worker thread.
    fn waker(&self) -> Arc<dyn ConsumerWaker>;
}
