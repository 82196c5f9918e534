//! The broker capability the consumption engine is built against.
//!
//! The engine never talks to Kafka directly: it resolves offsets, opens
//! subscriptions and lists topics through a [`BrokerClient`]. The `kafcat`
//! binary provides the rdkafka-backed implementation, tests use
//! [`crate::test_utils::MemoryBroker`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub type Partition = i32;
pub type Offset = i64;

/// Logical offsets the broker resolves to concrete numbers at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetBound {
    /// The oldest offset still retained (low watermark).
    Oldest,
    /// The offset the next produced message will get (high watermark).
    Newest,
}

impl fmt::Display for OffsetBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetBound::Oldest => write!(f, "oldest"),
            OffsetBound::Newest => write!(f, "newest"),
        }
    }
}

/// A single message read from one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// Errors reported by a [`BrokerClient`] implementation.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("timeout during {operation}")]
    Timeout { operation: &'static str },

    #[error("partition {partition} of topic {topic} is not available")]
    PartitionUnavailable { topic: String, partition: Partition },

    #[error("offset {offset} is before the oldest available offset {oldest} of partition {partition}")]
    OffsetOutOfRange {
        partition: Partition,
        offset: Offset,
        oldest: Offset,
    },

    #[error("broker error during {operation}: {source}")]
    Client {
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BrokerError {
    pub fn client<E>(operation: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BrokerError::Client {
            operation,
            source: Box::new(source),
        }
    }
}

/// Non-blocking close of a live subscription.
///
/// Calling it only requests the close: the subscription's message stream keeps
/// yielding whatever is already in flight and terminates afterwards. Calling it
/// more than once must be harmless.
pub trait AsyncClose: Send + Sync {
    fn async_close(&self);
}

/// An open streaming read of one partition.
pub struct PartitionSubscription {
    pub messages: BoxStream<'static, Message>,
    closer: Arc<dyn AsyncClose>,
}

impl PartitionSubscription {
    pub fn new(messages: BoxStream<'static, Message>, closer: Arc<dyn AsyncClose>) -> Self {
        Self { messages, closer }
    }

    pub fn closer(&self) -> Arc<dyn AsyncClose> {
        self.closer.clone()
    }

    pub fn into_parts(self) -> (BoxStream<'static, Message>, Arc<dyn AsyncClose>) {
        (self.messages, self.closer)
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;

    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        Ok(self.list_topics().await?.iter().any(|t| t == topic))
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, BrokerError>;

    async fn offset(
        &self,
        topic: &str,
        partition: Partition,
        bound: OffsetBound,
    ) -> Result<Offset, BrokerError>;

    async fn subscribe(
        &self,
        topic: &str,
        partition: Partition,
        start_offset: Offset,
    ) -> Result<PartitionSubscription, BrokerError>;
}
