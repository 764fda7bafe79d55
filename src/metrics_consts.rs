//! Metric names emitted by the streamer.

pub const STREAM_BATCHES_FETCHED: &str = "kafka_streamer_batches_fetched_total";
pub const STREAM_BATCH_SIZE: &str = "kafka_streamer_batch_size";
pub const STREAM_EMPTY_POLLS: &str = "kafka_streamer_empty_polls_total";
pub const STREAM_RECORDS_DELIVERED: &str = "kafka_streamer_records_delivered_total";
pub const STREAM_POLL_ERRORS: &str = "kafka_streamer_poll_errors_total";

pub const WORKER_COMMANDS_SUBMITTED: &str = "kafka_streamer_commands_submitted_total";
pub const WORKER_COMMAND_FAILURES: &str = "kafka_streamer_command_failures_total";

pub const REBALANCE_EVENTS: &str = "kafka_streamer_rebalance_events_total";
pub const REBALANCE_EVENTS_DROPPED: &str = "kafka_streamer_rebalance_events_dropped_total";
