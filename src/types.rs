use bytes::Bytes;

/// A topic-partition pair, the unit of assignment and seeking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// A committed offset with its optional broker-side metadata string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    pub offset: i64,
    pub metadata: Option<String>,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: None,
        }
    }
}

/// Partition metadata returned by topic listing queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition_number: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub in_sync_replicas: Vec<i32>,
}

/// One fetched record. Keys and values are opaque bytes; decoding them is the
/// caller's concern.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition_number: i32,
    pub offset: i64,
    /// Milliseconds since epoch, when the broker supplied one.
    pub timestamp: Option<i64>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
}

impl Record {
    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_display_and_accessors() {
        let p = Partition::new("events", 3);
        assert_eq!(p.topic(), "events");
        assert_eq!(p.partition_number(), 3);
        assert_eq!(p.to_string(), "events:3");
    }

    #[test]
    fn test_record_partition() {
        let record = Record {
            topic: "events".to_string(),
            partition_number: 1,
            offset: 42,
            timestamp: None,
            key: None,
            value: Some(Bytes::from_static(b"payload")),
            headers: Vec::new(),
        };
        assert_eq!(record.partition(), Partition::new("events", 1));
    }
}
