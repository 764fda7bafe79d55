//! Event-driven streaming over a blocking Kafka consumer.
//!
//! The blocking client must be driven from a single thread; this crate hides
//! that behind [`ReadStream`]: a dedicated worker thread owns the consumer,
//! every operation becomes a FIFO command on that thread, and fetched records
//! are pushed to a caller-registered handler on the tokio runtime. Rebalance
//! callbacks, which the client fires from inside `poll`, are marshaled back
//! onto the runtime as well.
//!
//! ```no_run
//! use kafka_streamer::{ConsumerConfigBuilder, ReadStream, StreamOptions};
//!
//! # async fn run() -> Result<(), kafka_streamer::StreamError> {
//! let config = ConsumerConfigBuilder::new("localhost:9092", "my-group").build();
//! let stream = ReadStream::create(&config, StreamOptions::default())?;
//! stream
//!     .on_record(|record| println!("{}@{}", record.partition(), record.offset))
//!     .on_error(|e| eprintln!("stream error: {e}"));
//! stream.subscribe(vec!["events".to_string()])?.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
mod dispatch;
pub mod error;
mod metrics_consts;
pub mod rdkafka_consumer;
pub mod rebalance;
pub mod stream;
pub mod test_utils;
pub mod types;
pub mod worker;

pub use config::{ConsumerConfigBuilder, StreamOptions};
pub use consumer::{BlockingConsumer, ConsumerWaker};
pub use error::{StreamError, StreamResult};
pub use rdkafka_consumer::RdkafkaConsumer;
pub use rebalance::RebalanceEvent;
pub use stream::ReadStream;
pub use types::{OffsetAndMetadata, Partition, PartitionInfo, Record};
pub use worker::Pending;
