//! rdkafka-backed implementation of [`BlockingConsumer`].
//!
//! Wraps a [`BaseConsumer`], the poll-driven blocking client. librdkafka fires
//! rebalance callbacks synchronously on whatever thread is inside `poll` — the
//! worker thread here — so the [`StreamerContext`] does nothing but forward
//! them onto the stream's rebalance channel, where the caller-side dispatcher
//! picks them up.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info};

use crate::consumer::{BlockingConsumer, ConsumerWaker};
use crate::error::{StreamError, StreamResult};
use crate::rebalance::{RebalanceEvent, RebalanceSender};
use crate::types::{OffsetAndMetadata, Partition, PartitionInfo, Record};

/// Timeout for one-shot broker queries (metadata, watermarks, committed).
const OP_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a blocking poll re-checks the wakeup flag. Bounds how long close
/// waits for an in-flight poll.
const WAKE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Consumer context that forwards rebalance callbacks to the stream.
pub struct StreamerContext {
    rebalance_tx: RebalanceSender,
}

impl ClientContext for StreamerContext {}

impl ConsumerContext for StreamerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // Cooperative-sticky sends empty revokes whenever group
                // membership changes; nothing to tell the caller about.
                if partitions.count() == 0 {
                    return;
                }
                info!(count = partitions.count(), "Partitions revoked");
                let partitions = partitions_of(partitions);
                if self
                    .rebalance_tx
                    .send(RebalanceEvent::Revoked(partitions))
                    .is_err()
                {
                    debug!("Rebalance channel closed; dropping revoke event");
                }
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                info!(count = partitions.count(), "Partitions assigned");
                let partitions = partitions_of(partitions);
                if self
                    .rebalance_tx
                    .send(RebalanceEvent::Assigned(partitions))
                    .is_err()
                {
                    debug!("Rebalance channel closed; dropping assign event");
                }
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements()
        .into_iter()
        .map(|elem| Partition::new(elem.topic(), elem.partition()))
        .collect()
}

fn tpl_of(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

fn record_of(msg: &BorrowedMessage<'_>) -> Record {
    let headers = msg
        .headers()
        .map(|hdrs| {
            (0..hdrs.count())
                .filter_map(|i| {
                    let header = hdrs.get(i);
                    let value = header.value?;
                    Some((header.key.to_string(), Bytes::copy_from_slice(value)))
                })
                .collect()
        })
        .unwrap_or_default();

    Record {
        topic: msg.topic().to_string(),
        partition_number: msg.partition(),
        offset: msg.offset(),
        timestamp: msg.timestamp().to_millis(),
        key: msg.key().map(Bytes::copy_from_slice),
        value: msg.payload().map(Bytes::copy_from_slice),
        headers,
    }
}

struct PollWaker {
    flag: AtomicBool,
}

impl PollWaker {
    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

impl ConsumerWaker for PollWaker {
    fn wakeup(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Blocking consumer over rdkafka's `BaseConsumer`.
pub struct RdkafkaConsumer {
    consumer: BaseConsumer<StreamerContext>,
    waker: Arc<PollWaker>,
    max_batch_size: usize,
}

impl RdkafkaConsumer {
    /// Create the consumer; `rebalance_tx` receives revoke/assign events fired
    /// from inside future polls.
    pub fn from_config(
        config: &ClientConfig,
        rebalance_tx: RebalanceSender,
        max_batch_size: usize,
    ) -> StreamResult<Self> {
        let context = StreamerContext { rebalance_tx };
        let consumer: BaseConsumer<StreamerContext> = config.create_with_context(context)?;
        Ok(Self {
            consumer,
            waker: Arc::new(PollWaker {
                flag: AtomicBool::new(false),
            }),
            max_batch_size,
        })
    }
}

impl BlockingConsumer for RdkafkaConsumer {
    /// One bounded blocking fetch. Waits up to `timeout` for the first record,
    /// then drains whatever librdkafka already has buffered (zero-timeout
    /// polls) up to the batch cap, so one command yields one batch.
    fn poll(&mut self, timeout: Duration) -> StreamResult<Vec<Record>> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();

        loop {
            if records.is_empty() && self.waker.take() {
                return Err(StreamError::WakeUp);
            }

            let wait = if records.is_empty() {
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(WAKE_CHECK_INTERVAL)
            } else {
                Duration::ZERO
            };

            match self.consumer.poll(wait) {
                Some(Ok(msg)) => {
                    records.push(record_of(&msg));
                    if records.len() >= self.max_batch_size {
                        break;
                    }
                }
                Some(Err(e)) => {
                    if records.is_empty() {
                        return Err(e.into());
                    }
                    // Deliver what we have; the error resurfaces on the next poll.
                    break;
                }
                None => {
                    if !records.is_empty() || Instant::now() >= deadline {
                        break;
                    }
                }
            }
        }

        Ok(records)
    }

    fn subscribe(&mut self, topics: &[String]) -> StreamResult<()> {
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&refs)?;
        Ok(())
    }

    fn unsubscribe(&mut self) -> StreamResult<()> {
        self.consumer.unsubscribe();
        Ok(())
    }

    fn subscription(&mut self) -> StreamResult<HashSet<String>> {
        let tpl = self.consumer.subscription()?;
        Ok(tpl
            .elements()
            .into_iter()
            .map(|elem| elem.topic().to_string())
            .collect())
    }

    fn assign(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        self.consumer.assign(&tpl_of(partitions))?;
        Ok(())
    }

    fn assignment(&mut self) -> StreamResult<HashSet<Partition>> {
        let tpl = self.consumer.assignment()?;
        Ok(partitions_of(&tpl).into_iter().collect())
    }

    fn seek(&mut self, partition: &Partition, offset: i64) -> StreamResult<()> {
        self.consumer.seek(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset),
            OP_TIMEOUT,
        )?;
        Ok(())
    }

    fn seek_to_beginning(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        for partition in partitions {
            self.consumer.seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Beginning,
                OP_TIMEOUT,
            )?;
        }
        Ok(())
    }

    fn seek_to_end(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        for partition in partitions {
            self.consumer.seek(
                partition.topic(),
                partition.partition_number(),
                Offset::End,
                OP_TIMEOUT,
            )?;
        }
        Ok(())
    }

    fn commit(
        &mut self,
        offsets: Option<&HashMap<Partition, OffsetAndMetadata>>,
    ) -> StreamResult<HashMap<Partition, OffsetAndMetadata>> {
        match offsets {
            Some(map) => {
                let mut tpl = TopicPartitionList::new();
                for (partition, om) in map {
                    tpl.add_partition_offset(
                        partition.topic(),
                        partition.partition_number(),
                        Offset::Offset(om.offset),
                    )?;
                }
                self.consumer.commit(&tpl, CommitMode::Sync)?;
                Ok(map.clone())
            }
            None => {
                // Commit the current position of every assigned partition.
                let positions = self.consumer.position()?;
                let mut committed = HashMap::new();
                let mut tpl = TopicPartitionList::new();
                for elem in positions.elements() {
                    if let Offset::Offset(offset) = elem.offset() {
                        tpl.add_partition_offset(
                            elem.topic(),
                            elem.partition(),
                            Offset::Offset(offset),
                        )?;
                        committed.insert(
                            Partition::new(elem.topic(), elem.partition()),
                            OffsetAndMetadata::new(offset),
                        );
                    }
                }
                if !committed.is_empty() {
                    self.consumer.commit(&tpl, CommitMode::Sync)?;
                }
                Ok(committed)
            }
        }
    }

    fn committed(&mut self, partition: &Partition) -> StreamResult<Option<OffsetAndMetadata>> {
        let result = self
            .consumer
            .committed_offsets(tpl_of(std::slice::from_ref(partition)), OP_TIMEOUT)?;
        for elem in result.elements() {
            if let Offset::Offset(offset) = elem.offset() {
                return Ok(Some(OffsetAndMetadata::new(offset)));
            }
        }
        Ok(None)
    }

    fn position(&mut self, partition: &Partition) -> StreamResult<i64> {
        let positions = self.consumer.position()?;
        for elem in positions.elements() {
            if elem.topic() == partition.topic() && elem.partition() == partition.partition_number()
            {
                if let Offset::Offset(offset) = elem.offset() {
                    return Ok(offset);
                }
            }
        }
        Err(StreamError::Client(format!("no position for {partition}")))
    }

    fn pause_partitions(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        self.consumer.pause(&tpl_of(partitions))?;
        Ok(())
    }

    fn resume_partitions(&mut self, partitions: &[Partition]) -> StreamResult<()> {
        self.consumer.resume(&tpl_of(partitions))?;
        Ok(())
    }

    fn beginning_offsets(
        &mut self,
        partitions: &[Partition],
    ) -> StreamResult<HashMap<Partition, i64>> {
        let mut offsets = HashMap::new();
        for partition in partitions {
            let (low, _high) = self.consumer.fetch_watermarks(
                partition.topic(),
                partition.partition_number(),
                OP_TIMEOUT,
            )?;
            offsets.insert(partition.clone(), low);
        }
        Ok(offsets)
    }

    fn end_offsets(&mut self, partitions: &[Partition]) -> StreamResult<HashMap<Partition, i64>> {
        let mut offsets = HashMap::new();
        for partition in partitions {
            let (_low, high) = self.consumer.fetch_watermarks(
                partition.topic(),
                partition.partition_number(),
                OP_TIMEOUT,
            )?;
            offsets.insert(partition.clone(), high);
        }
        Ok(offsets)
    }

    fn offsets_for_times(
        &mut self,
        timestamps: &HashMap<Partition, i64>,
    ) -> StreamResult<HashMap<Partition, Option<i64>>> {
        let mut query = TopicPartitionList::new();
        for (partition, timestamp) in timestamps {
            query.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*timestamp),
            )?;
        }
        let result = self.consumer.offsets_for_times(query, OP_TIMEOUT)?;

        let mut offsets = HashMap::new();
        for elem in result.elements() {
            let partition = Partition::new(elem.topic(), elem.partition());
            let offset = match elem.offset() {
                Offset::Offset(o) => Some(o),
                _ => None,
            };
            offsets.insert(partition, offset);
        }
        Ok(offsets)
    }

    fn list_topics(&mut self) -> StreamResult<HashMap<String, Vec<PartitionInfo>>> {
        let metadata = self.consumer.fetch_metadata(None, OP_TIMEOUT)?;
        let mut topics = HashMap::new();
        for topic in metadata.topics() {
            let partitions = topic
                .partitions()
                .iter()
                .map(|p| PartitionInfo {
                    topic: topic.name().to_string(),
                    partition_number: p.id(),
                    leader: p.leader(),
                    replicas: p.replicas().to_vec(),
                    in_sync_replicas: p.isr().to_vec(),
                })
                .collect();
            topics.insert(topic.name().to_string(), partitions);
        }
        Ok(topics)
    }

    fn partitions_for(&mut self, topic: &str) -> StreamResult<Vec<PartitionInfo>> {
        let metadata = self.consumer.fetch_metadata(Some(topic), OP_TIMEOUT)?;
        Ok(metadata
            .topics()
            .iter()
            .filter(|t| t.name() == topic)
            .flat_map(|t| {
                t.partitions().iter().map(|p| PartitionInfo {
                    topic: t.name().to_string(),
                    partition_number: p.id(),
                    leader: p.leader(),
                    replicas: p.replicas().to_vec(),
                    in_sync_replicas: p.isr().to_vec(),
                })
            })
            .collect())
    }

    fn close(&mut self) -> StreamResult<()> {
        self.consumer.unsubscribe();
        Ok(())
    }

    fn waker(&self) -> Arc<dyn ConsumerWaker> {
        self.waker.clone()
    }
}
