//! rdkafka-backed [`BrokerClient`].
//!
//! Metadata and watermarks go through one shared `BaseConsumer`; every
//! subscription gets its own `StreamConsumer` manually assigned to a single
//! partition, without a consumer group and without committing offsets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message as KafkaMessage, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kafcat_common::broker::{
    AsyncClose, BrokerClient, BrokerError, Message, Offset, OffsetBound, Partition,
    PartitionSubscription,
};

use crate::config::KafkaConfig;

pub struct KafkaBrokerClient {
    client_config: ClientConfig,
    metadata: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaBrokerClient {
    pub fn new(
        peers: &[String],
        config: &KafkaConfig,
        verbose: bool,
    ) -> Result<KafkaBrokerClient, KafkaError> {
        info!("connecting to Kafka brokers at {}...", peers.join(","));

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", peers.join(","))
            .set("client.id", &config.kafka_client_id)
            .set(
                "session.timeout.ms",
                config.kafka_session_timeout_ms.to_string(),
            )
            .set(
                "fetch.wait.max.ms",
                config.kafka_fetch_wait_max_ms.to_string(),
            )
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            // A start past the end of the log is reset to the high watermark.
            .set("auto.offset.reset", "latest");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        if verbose {
            client_config.set_log_level(RDKafkaLogLevel::Debug);
        }

        debug!("rdkafka configuration: {:?}", client_config);
        let metadata: BaseConsumer = client_config.create()?;

        Ok(KafkaBrokerClient {
            client_config,
            metadata: Arc::new(metadata),
            timeout: Duration::from_millis(config.kafka_metadata_timeout_ms),
        })
    }

    /// Run a blocking metadata call off the async runtime.
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, Timeout) -> Result<T, KafkaError> + Send + 'static,
    {
        let consumer = self.metadata.clone();
        let timeout = Timeout::After(self.timeout);
        tokio::task::spawn_blocking(move || f(&consumer, timeout))
            .await
            .map_err(|e| BrokerError::client(operation, e))?
            .map_err(|e| match e {
                KafkaError::MetadataFetch(code) | KafkaError::OffsetFetch(code)
                    if code == rdkafka::types::RDKafkaErrorCode::OperationTimedOut =>
                {
                    BrokerError::Timeout { operation }
                }
                e => BrokerError::client(operation, e),
            })
    }

    async fn topic_partitions(&self, topic: &str) -> Result<Option<Vec<Partition>>, BrokerError> {
        let topic = topic.to_owned();
        self.blocking("fetch_metadata", move |consumer, timeout| {
            let metadata = consumer.fetch_metadata(None, timeout)?;
            Ok(metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .map(|t| t.partitions().iter().map(|p| p.id()).collect()))
        })
        .await
    }

    async fn watermarks(
        &self,
        topic: &str,
        partition: Partition,
    ) -> Result<(Offset, Offset), BrokerError> {
        let topic = topic.to_owned();
        self.blocking("fetch_watermarks", move |consumer, timeout| {
            consumer.fetch_watermarks(&topic, partition, timeout)
        })
        .await
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let mut topics = self
            .blocking("fetch_metadata", |consumer, timeout| {
                let metadata = consumer.fetch_metadata(None, timeout)?;
                Ok(metadata
                    .topics()
                    .iter()
                    .map(|t| t.name().to_owned())
                    .collect::<Vec<_>>())
            })
            .await?;
        topics.sort();
        Ok(topics)
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, BrokerError> {
        Ok(self.topic_partitions(topic).await?.unwrap_or_default())
    }

    async fn offset(
        &self,
        topic: &str,
        partition: Partition,
        bound: OffsetBound,
    ) -> Result<Offset, BrokerError> {
        let (low, high) = self.watermarks(topic, partition).await?;
        Ok(match bound {
            OffsetBound::Oldest => low,
            OffsetBound::Newest => high,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: Partition,
        start_offset: Offset,
    ) -> Result<PartitionSubscription, BrokerError> {
        let (oldest, _) = self.watermarks(topic, partition).await?;
        if start_offset < oldest {
            return Err(BrokerError::OffsetOutOfRange {
                partition,
                offset: start_offset,
                oldest,
            });
        }

        let consumer: StreamConsumer = self
            .client_config
            .create()
            .map_err(|e| BrokerError::client("create_consumer", e))?;

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, rdkafka::Offset::Offset(start_offset))
            .map_err(|e| BrokerError::client("assign", e))?;
        consumer
            .assign(&assignment)
            .map_err(|e| BrokerError::client("assign", e))?;

        let closing = CancellationToken::new();
        let state = SubscriptionState {
            consumer,
            closing: closing.clone(),
            topic: topic.to_owned(),
            partition,
        };
        let messages = futures::stream::unfold(state, |state| async move {
            let next = state.next_message().await;
            next.map(|message| (message, state))
        })
        .boxed();

        Ok(PartitionSubscription::new(
            messages,
            Arc::new(KafkaCloser(closing)),
        ))
    }
}

struct KafkaCloser(CancellationToken);

impl AsyncClose for KafkaCloser {
    fn async_close(&self) {
        self.0.cancel();
    }
}

struct SubscriptionState {
    consumer: StreamConsumer,
    closing: CancellationToken,
    topic: String,
    partition: Partition,
}

impl SubscriptionState {
    async fn next_message(&self) -> Option<Message> {
        loop {
            if self.closing.is_cancelled() {
                // Drain what librdkafka already fetched, then end the stream.
                return match self.consumer.recv().now_or_never() {
                    Some(Ok(message)) => Some(to_message(&message)),
                    _ => None,
                };
            }

            tokio::select! {
                _ = self.closing.cancelled() => continue,
                received = self.consumer.recv() => match received {
                    Ok(message) => return Some(to_message(&message)),
                    Err(err) => {
                        warn!(
                            topic = %self.topic,
                            partition = self.partition,
                            "error while consuming: {}",
                            err
                        );
                    }
                },
            }
        }
    }
}

fn to_message(message: &BorrowedMessage<'_>) -> Message {
    Message {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
    }
}
