use std::time::Duration;

use rdkafka::ClientConfig;

/// Tunables for the poll/dispatch loop.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// How long a single blocking fetch may wait for records.
    pub poll_timeout: Duration,
    /// Delay before re-polling after an empty fetch.
    pub empty_backoff: Duration,
    /// Maximum records delivered to the handler per scheduling turn.
    pub slice_size: usize,
    /// Cap on how many buffered records one fetch may drain into a batch.
    pub max_batch_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            empty_backoff: Duration::from_millis(1),
            slice_size: 10,
            max_batch_size: 500,
        }
    }
}

/// rdkafka consumer configuration builder with defaults suited to a streamed,
/// explicitly-committed consumer.
///
/// Auto-commit is off by default because the stream exposes `commit()`
/// directly; flip it back on with [`ConsumerConfigBuilder::set`] if the group
/// should commit on its own cadence.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for the broker connection.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Where to start when the group has no committed offset: "earliest" or
    /// "latest".
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    pub fn with_max_partition_fetch_bytes(mut self, bytes: u32) -> Self {
        self.config
            .set("max.partition.fetch.bytes", bytes.to_string());
        self
    }

    /// Add any custom configuration.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "streamer-group").build();
        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("streamer-group"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_builder_overrides() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "g")
            .with_offset_reset("latest")
            .with_tls(true)
            .set("client.id", "streamer-1")
            .build();
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("client.id"), Some("streamer-1"));
    }

    #[test]
    fn test_stream_options_defaults() {
        let options = StreamOptions::default();
        assert_eq!(options.poll_timeout, Duration::from_secs(1));
        assert_eq!(options.empty_backoff, Duration::from_millis(1));
        assert_eq!(options.slice_size, 10);
    }
}
