//! In-process fake consumer for tests.
//!
//! [`MockConsumer`] implements [`BlockingConsumer`] over an in-memory
//! partitioned log shared through a [`MockHandle`]. Polls block on a condvar
//! until records are produced, the timeout lapses, or the waker fires, so
//! tests exercise the same blocking behavior the real client has. Every trait
//! method asserts it is not entered concurrently, which turns any violation of
//! the one-thread-owns-the-consumer rule into a panic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::consumer::{BlockingConsumer, ConsumerWaker};
use crate::error::{StreamError, StreamResult};
use crate::rebalance::{self, RebalanceEvent, RebalanceReceiver, RebalanceSender};
use crate::types::{OffsetAndMetadata, Partition, PartitionInfo, Record};

/// Shared topic logs and committed offsets. Outlives any one consumer
/// session, so a second session can pick up where a committed first left off.
#[derive(Default)]
struct Cluster {
    /// Per-topic, per-partition append-only logs.
    topics: HashMap<String, Vec<Vec<Record>>>,
    committed: HashMap<Partition, OffsetAndMetadata>,
}

impl Cluster {
    fn log(&self, partition: &Partition) -> Option<&Vec<Record>> {
        self.topics
            .get(partition.topic())
            .and_then(|logs| logs.get(partition.partition_number() as usize))
    }
}

/// One consumer session: what the broker would track per group member.
#[derive(Default)]
struct Session {
    subscription: HashSet<String>,
    assignment: HashSet<Partition>,
    positions: HashMap<Partition, i64>,
    paused: HashSet<Partition>,
    pending_rebalance: VecDeque<RebalanceEvent>,
    pending_poll_errors: VecDeque<StreamError>,
    woken: bool,
    closed: bool,
    entered: bool,
    calls: Vec<String>,
    poll_thread: Option<ThreadId>,
}

struct Shared {
    cluster: Arc<Mutex<Cluster>>,
    session: Mutex<Session>,
    cond: Condvar,
    rebalance_tx: RebalanceSender,
}

struct MockWaker {
    shared: Arc<Shared>,
}

impl ConsumerWaker for MockWaker {
    fn wakeup(&self) {
        let mut session = self.shared.session.lock().unwrap();
        session.woken = true;
        self.shared.cond.notify_all();
    }
}

/// Fake blocking consumer backed by a shared in-memory cluster.
pub struct MockConsumer {
    shared: Arc<Shared>,
}

/// Test-side handle: produce records, script rebalances, inspect state.
pub struct MockHandle {
    shared: Arc<Shared>,
    rebalance_rx: Mutex<Option<RebalanceReceiver>>,
}

impl MockConsumer {
    pub fn new() -> (Self, MockHandle) {
        Self::with_cluster(Arc::new(Mutex::new(Cluster::default())))
    }

    fn with_cluster(cluster: Arc<Mutex<Cluster>>) -> (Self, MockHandle) {
        let (tx, rx) = rebalance::channel();
        let shared = Arc::new(Shared {
            cluster,
            session: Mutex::new(Session::default()),
            cond: Condvar::new(),
            rebalance_tx: tx,
        });
        (
            Self {
                shared: shared.clone(),
            },
            MockHandle {
                shared,
                rebalance_rx: Mutex::new(Some(rx)),
            },
        )
    }

    fn enter(&self, call: &str) -> EntryGuard<'_> {
        let mut session = self.shared.session.lock().unwrap();
        assert!(
            !session.entered,
            "consumer entered concurrently during {call}"
        );
        session.entered = true;
        session.calls.push(call.to_string());
        EntryGuard {
            shared: &self.shared,
        }
    }

    /// Apply and forward any scripted rebalance events. Runs on the polling
    /// thread, mirroring where the real client fires its callbacks.
    fn fire_pending_rebalances(&self) {
        let events: Vec<RebalanceEvent> = {
            let mut session = self.shared.session.lock().unwrap();
            session.pending_rebalance.drain(..).collect()
        };
        for event in events {
            {
                let cluster = self.shared.cluster.lock().unwrap();
                let mut session = self.shared.session.lock().unwrap();
                match &event {
                    RebalanceEvent::Assigned(partitions) => {
                        for partition in partitions {
                            let start = cluster
                                .committed
                                .get(partition)
                                .map_or(0, |om| om.offset);
                            session.assignment.insert(partition.clone());
                            session.positions.entry(partition.clone()).or_insert(start);
                        }
                    }
                    RebalanceEvent::Revoked(partitions) => {
                        for partition in partitions {
                            session.assignment.remove(partition);
                            session.positions.remove(partition);
                        }
                    }
                }
            }
            self.shared.rebalance_tx.send(event).ok();
        }
    }

    /// Everything available past the current positions of the assigned,
    /// unpaused partitions, in partition order.
    fn gather(&self) -> Vec<Record> {
        let (assignment, paused, positions) = {
            let session = self.shared.session.lock().unwrap();
            (
                session.assignment.clone(),
                session.paused.clone(),
                session.positions.clone(),
            )
        };

        let mut ordered: Vec<Partition> = assignment.into_iter().collect();
        ordered.sort_by(|a, b| {
            (a.topic(), a.partition_number()).cmp(&(b.topic(), b.partition_number()))
        });

        let mut batch = Vec::new();
        let mut advanced = HashMap::new();
        {
            let cluster = self.shared.cluster.lock().unwrap();
            for partition in &ordered {
                if paused.contains(partition) {
                    continue;
                }
                let position = positions.get(partition).copied().unwrap_or(0);
                if let Some(log) = cluster.log(partition) {
                    let end = log.len() as i64;
                    if end > position {
                        batch.extend(log[position as usize..].iter().cloned());
                        advanced.insert(partition.clone(), end);
                    }
                }
            }
        }

        if !advanced.is_empty() {
            let mut session = self.shared.session.lock().unwrap();
            for (partition, position) in advanced {
                session.positions.insert(partition, position);
            }
        }
        batch
    }

    fn partitions_of_topics(&self, topics: &HashSet<String>) -> Vec<Partition> {
        let cluster = self.shared.cluster.lock().unwrap();
        let mut partitions = Vec::new();
        for topic in topics {
            if let Some(logs) = cluster.topics.get(topic) {
                for number in 0..logs.len() {
                    partitions.push(Partition::new(topic, number as i32));
                }
            }
        }
        partitions
    }
}

struct EntryGuard<'a> {
    shared: &'a Shared,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.shared.session.lock().unwrap().entered = false;
    }
}

impl BlockingConsumer for MockConsumer {
    fn poll(&mut self, timeout: Duration) -> StreamResult<Vec<Record>> {
        let _guard = self.enter("poll");
        {
            let mut session = self.shared.session.lock().unwrap();
            session.poll_thread = Some(std::thread::current().id());
        }
        let deadline = Instant::now() + timeout;

        loop {
            self.fire_pending_rebalances();

            {
                let mut session = self.shared.session.lock().unwrap();
                if session.woken {
                    session.woken = false;
                    return Err(StreamError::WakeUp);
                }
            }

            let scripted_error = {
                let mut session = self.shared.session.lock().unwrap();
                session.pending_poll_errors.pop_front()
            };
            if let Some(error) = scripted_error {
                return Err(error);
            }

            let batch = self.gather();
            if !batch.is_empty() {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let session = self.shared.session.lock().unwrap();
            // Short slices so freshly scripted rebalances are picked up even
            // without a produce notification.
            let (session, _timed_out) = self
                .shared
                .cond
                .wait_timeout(session, remaining.min(Duration::from_millis(5)))
                .unwrap();
            drop(session);
        }
    }

    fn subscribe(&mut self, topics: &[String]) -> StreamResult<()> {
        let _guard = self.enter("subscribe");
        let subscription: HashSet<String> = topics.iter().cloned().collect();
        let assigned = self.partitions_of_topics(&subscription);
        let mut session = self.shared.session.lock().unwrap();
        session.subscription = subscription;
        // Group join: the assignment arrives through a rebalance on the next
        // poll, like the real client.
        session
            .pending_rebalance
            .push_back(RebalanceEvent::Assigned(assigned));
        Ok(())
    }

    fn unsubscribe(&mut self) -> StreamResult<()> {
        let _guard = self.enter("unsubscribe");
        let mut session = self.shared.session.lock().unwrap();
        session.subscription.clear();
        session.assignment.clear();
        session.positions.clear();
        Ok(())
    }

    fn subscription(&mut self) -> StreamResult<HashSet<String>> {
        let _guard = self.enter("subscription");
        // Bound to a local: a tail-expression guard would outlive `_guard`,
        // whose drop re-locks the session.
        let subscription = self.shared.session.lock().unwrap().subscription.clone();
        Ok(subscription)
    }

    fn assign(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        let _guard = self.enter("assign");
        let cluster = self.shared.cluster.lock().unwrap();
        let mut session = self.shared.session.lock().unwrap();
        session.assignment = partitions.iter().cloned().collect();
        session.positions.clear();
        for partition in partitions {
            let start = cluster.committed.get(partition).map_or(0, |om| om.offset);
            session.positions.insert(partition.clone(), start);
        }
        Ok(())
    }

    fn assignment(&mut self) -> StreamResult<HashSet<Partition>> {
        let _guard = self.enter("assignment");
        let assignment = self.shared.session.lock().unwrap().assignment.clone();
        Ok(assignment)
    }

    fn seek(&mut self, partition: &Partition, offset: i64) -> StreamResult<()> {
        let _guard = self.enter("seek");
        let mut session = self.shared.session.lock().unwrap();
        if !session.assignment.contains(partition) {
            return Err(StreamError::Client(format!("{partition} is not assigned")));
        }
        session.positions.insert(partition.clone(), offset);
        Ok(())
    }

    fn seek_to_beginning(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        let _guard = self.enter("seek_to_beginning");
        let mut session = self.shared.session.lock().unwrap();
        for partition in partitions {
            session.positions.insert(partition.clone(), 0);
        }
        Ok(())
    }

    fn seek_to_end(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        let _guard = self.enter("seek_to_end");
        let cluster = self.shared.cluster.lock().unwrap();
        let mut session = self.shared.session.lock().unwrap();
        for partition in partitions {
            let end = cluster.log(partition).map_or(0, |log| log.len() as i64);
            session.positions.insert(partition.clone(), end);
        }
        Ok(())
    }

    fn commit(
        &mut self,
        offsets: Option<&HashMap<Partition, OffsetAndMetadata>>,
    ) -> StreamResult<HashMap<Partition, OffsetAndMetadata>> {
        let _guard = self.enter("commit");
        let committed: HashMap<Partition, OffsetAndMetadata> = match offsets {
            Some(map) => map.clone(),
            None => {
                let session = self.shared.session.lock().unwrap();
                session
                    .positions
                    .iter()
                    .map(|(p, offset)| (p.clone(), OffsetAndMetadata::new(*offset)))
                    .collect()
            }
        };
        let mut cluster = self.shared.cluster.lock().unwrap();
        for (partition, om) in &committed {
            cluster.committed.insert(partition.clone(), om.clone());
        }
        Ok(committed)
    }

    fn committed(&mut self, partition: &Partition) -> StreamResult<Option<OffsetAndMetadata>> {
        let _guard = self.enter("committed");
        let committed = self
            .shared
            .cluster
            .lock()
            .unwrap()
            .committed
            .get(partition)
            .cloned();
        Ok(committed)
    }

    fn position(&mut self, partition: &Partition) -> StreamResult<i64> {
        let _guard = self.enter("position");
        let position = self
            .shared
            .session
            .lock()
            .unwrap()
            .positions
            .get(partition)
            .copied();
        position.ok_or_else(|| StreamError::Client(format!("no position for {partition}")))
    }

    fn pause_partitions(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        let _guard = self.enter("pause_partitions");
        let mut session = self.shared.session.lock().unwrap();
        session.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume_partitions(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        let _guard = self.enter("resume_partitions");
        let mut session = self.shared.session.lock().unwrap();
        for partition in partitions {
            session.paused.remove(partition);
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    fn beginning_offsets(
        &mut self,
        partitions: &[Partition],
    ) -> StreamResult<HashMap<Partition, i64>> {
        let _guard = self.enter("beginning_offsets");
        Ok(partitions.iter().map(|p| (p.clone(), 0)).collect())
    }

    fn end_offsets(&mut self, partitions: &[Partition]) -> StreamResult<HashMap<Partition, i64>> {
        let _guard = self.enter("end_offsets");
        let cluster = self.shared.cluster.lock().unwrap();
        Ok(partitions
            .iter()
            .map(|p| (p.clone(), cluster.log(p).map_or(0, |log| log.len() as i64)))
            .collect())
    }

    fn offsets_for_times(
        &mut self,
        timestamps: &HashMap<Partition, i64>,
    ) -> StreamResult<HashMap<Partition, Option<i64>>> {
        let _guard = self.enter("offsets_for_times");
        let cluster = self.shared.cluster.lock().unwrap();
        Ok(timestamps
            .iter()
            .map(|(partition, target)| {
                let offset = cluster.log(partition).and_then(|log| {
                    log.iter()
                        .find(|record| record.timestamp.is_some_and(|ts| ts >= *target))
                        .map(|record| record.offset)
                });
                (partition.clone(), offset)
            })
            .collect())
    }

    fn list_topics(&mut self) -> StreamResult<HashMap<String, Vec<PartitionInfo>>> {
        let _guard = self.enter("list_topics");
        let cluster = self.shared.cluster.lock().unwrap();
        Ok(cluster
            .topics
            .iter()
            .map(|(name, logs)| (name.clone(), partition_infos(name, logs.len())))
            .collect())
    }

    fn partitions_for(&mut self, topic: &str) -> StreamResult<Vec<PartitionInfo>> {
        let _guard = self.enter("partitions_for");
        let cluster = self.shared.cluster.lock().unwrap();
        Ok(cluster
            .topics
            .get(topic)
            .map_or_else(Vec::new, |logs| partition_infos(topic, logs.len())))
    }

    fn close(&mut self) -> StreamResult<()> {
        let _guard = self.enter("close");
        self.shared.session.lock().unwrap().closed = true;
        Ok(())
    }

    fn waker(&self) -> Arc<dyn ConsumerWaker> {
        Arc::new(MockWaker {
            shared: self.shared.clone(),
        })
    }
}

fn partition_infos(topic: &str, count: usize) -> Vec<PartitionInfo> {
    (0..count)
        .map(|number| PartitionInfo {
            topic: topic.to_string(),
            partition_number: number as i32,
            leader: 0,
            replicas: vec![0],
            in_sync_replicas: vec![0],
        })
        .collect()
}

impl MockHandle {
    /// The receiving half of the rebalance channel, for wiring into
    /// [`ReadStream::wrap`](crate::ReadStream::wrap). Panics if taken twice.
    pub fn take_rebalance_rx(&self) -> RebalanceReceiver {
        self.rebalance_rx
            .lock()
            .unwrap()
            .take()
            .expect("rebalance receiver already taken")
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut cluster = self.shared.cluster.lock().unwrap();
        cluster
            .topics
            .insert(topic.to_string(), vec![Vec::new(); partitions]);
    }

    /// Append one record; its timestamp equals its offset. Returns the offset.
    pub fn produce(&self, topic: &str, partition: i32, key: &str, value: &str) -> i64 {
        let offset = {
            let mut cluster = self.shared.cluster.lock().unwrap();
            let log = cluster
                .topics
                .get_mut(topic)
                .and_then(|logs| logs.get_mut(partition as usize))
                .expect("produce to unknown topic/partition");
            let offset = log.len() as i64;
            log.push(Record {
                topic: topic.to_string(),
                partition_number: partition,
                offset,
                timestamp: Some(offset),
                key: Some(Bytes::copy_from_slice(key.as_bytes())),
                value: Some(Bytes::copy_from_slice(value.as_bytes())),
                headers: Vec::new(),
            });
            offset
        };
        self.shared.cond.notify_all();
        offset
    }

    /// Script a failure; the next poll returns it instead of records. Queued
    /// errors surface one per poll, after any pending rebalances.
    pub fn push_poll_error(&self, error: StreamError) {
        let mut session = self.shared.session.lock().unwrap();
        session.pending_poll_errors.push_back(error);
        self.shared.cond.notify_all();
    }

    /// Script a rebalance; it fires from inside the next poll, on the polling
    /// thread, exactly as the real client delivers its callbacks.
    pub fn push_rebalance(&self, event: RebalanceEvent) {
        let mut session = self.shared.session.lock().unwrap();
        session.pending_rebalance.push_back(event);
        self.shared.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.session.lock().unwrap().closed
    }

    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.shared
            .cluster
            .lock()
            .unwrap()
            .committed
            .get(partition)
            .map(|om| om.offset)
    }

    /// The thread the consumer last polled on.
    pub fn poll_thread(&self) -> Option<ThreadId> {
        self.shared.session.lock().unwrap().poll_thread
    }

    /// Every consumer method invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.shared.session.lock().unwrap().calls.clone()
    }

    /// A fresh consumer session against the same logs and committed offsets.
    pub fn new_session(&self) -> (MockConsumer, MockHandle) {
        MockConsumer::with_cluster(self.shared.cluster.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_blocks_until_produce() {
        let (mut consumer, handle) = MockConsumer::new();
        handle.create_topic("t", 1);
        consumer.assign(&[Partition::new("t", 0)]).unwrap();

        let start = Instant::now();
        let batch = consumer.poll(Duration::from_millis(50)).unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));

        handle.produce("t", 0, "k", "v");
        let batch = consumer.poll(Duration::from_millis(500)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 0);
    }

    #[test]
    fn test_wakeup_interrupts_poll() {
        let (mut consumer, _handle) = MockConsumer::new();
        let waker = consumer.waker();
        let poller = std::thread::spawn(move || {
            let result = consumer.poll(Duration::from_secs(30));
            assert!(matches!(result, Err(StreamError::WakeUp)));
        });
        std::thread::sleep(Duration::from_millis(20));
        waker.wakeup();
        poller.join().unwrap();
    }

    #[test]
    fn test_paused_partitions_are_skipped() {
        let (mut consumer, handle) = MockConsumer::new();
        handle.create_topic("t", 2);
        handle.produce("t", 0, "a", "1");
        handle.produce("t", 1, "b", "2");
        consumer
            .assign(&[Partition::new("t", 0), Partition::new("t", 1)])
            .unwrap();
        consumer.pause_partitions(&[Partition::new("t", 1)]).unwrap();

        let batch = consumer.poll(Duration::from_millis(100)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].partition_number, 0);

        consumer
            .resume_partitions(&[Partition::new("t", 1)])
            .unwrap();
        let batch = consumer.poll(Duration::from_millis(100)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].partition_number, 1);
    }

    #[test]
    fn test_state_queries_return_promptly() {
        let (mut consumer, handle) = MockConsumer::new();
        handle.create_topic("t", 1);
        let p0 = Partition::new("t", 0);

        consumer.subscribe(&["t".to_string()]).unwrap();
        assert_eq!(consumer.subscription().unwrap().len(), 1);

        consumer.assign(&[p0.clone()]).unwrap();
        assert!(consumer.assignment().unwrap().contains(&p0));
        assert_eq!(consumer.position(&p0).unwrap(), 0);
    }

    #[test]
    fn test_new_session_resumes_from_committed() {
        let (mut consumer, handle) = MockConsumer::new();
        handle.create_topic("t", 1);
        for i in 0..5 {
            handle.produce("t", 0, "k", &i.to_string());
        }
        consumer.assign(&[Partition::new("t", 0)]).unwrap();
        let batch = consumer.poll(Duration::from_millis(100)).unwrap();
        assert_eq!(batch.len(), 5);
        consumer.commit(None).unwrap();

        let (mut second, _second_handle) = handle.new_session();
        second.assign(&[Partition::new("t", 0)]).unwrap();
        assert_eq!(second.position(&Partition::new("t", 0)).unwrap(), 5);
    }
}
