use thiserror::Error;

/// Errors surfaced by the stream facade and by commands executed against the
/// underlying consumer.
///
/// Nothing here is fatal to the host process: poll errors are reported to the
/// stream error handler and the loop keeps going, command failures resolve the
/// command's `Pending` handle.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Client implementations that are not rdkafka-backed report through this.
    #[error("consumer error: {0}")]
    Client(String),

    /// A blocking poll was interrupted by the wakeup primitive. Expected during
    /// shutdown and swallowed by the dispatch loop, never shown to handlers.
    #[error("poll interrupted by wakeup")]
    WakeUp,

    /// The stream is closing or closed; the command was rejected, not queued.
    #[error("stream is closed")]
    Closed,

    /// `subscribe`/`assign` was called before a record handler was registered.
    #[error("a record handler must be registered before calling {0}")]
    HandlerRequired(&'static str),

    /// A worker-backed query was issued before the first `subscribe`/`assign`
    /// started the worker.
    #[error("stream not started")]
    NotStarted,

    #[error("failed to spawn consumer worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// `subscribe`/`assign` was called from outside a tokio runtime, so the
    /// dispatch and rebalance tasks had nowhere to run.
    #[error("no tokio runtime available: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

impl StreamError {
    pub fn is_wakeup(&self) -> bool {
        matches!(self, StreamError::WakeUp)
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
