//! Entry points of the consumption engine.

use std::str::FromStr;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, Partition};
use crate::error::ConsumeError;
use crate::merger::{FanInMerger, DEFAULT_BUFFER_SIZE};
use crate::offset::{OffsetResolver, ResolutionPolicy, StartPosition};
use crate::output::{FilterFormatter, FormatOptions, MessageFilter, OutputStats, OutputWriter};
use crate::reader::{PartitionReader, PartitionStats};
use crate::shutdown::ShutdownCoordinator;

/// Which partitions of the topic to consume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PartitionSelection {
    #[default]
    All,
    Explicit(Vec<Partition>),
}

impl FromStr for PartitionSelection {
    type Err = ConsumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(PartitionSelection::All);
        }

        let mut partitions = vec![];
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let partition = part.parse::<Partition>().map_err(|_| {
                ConsumeError::InvalidConfig(format!("{:?} is not a valid partition", part))
            })?;
            if partition < 0 {
                return Err(ConsumeError::InvalidConfig(format!(
                    "{} is not a valid partition",
                    partition
                )));
            }
            partitions.push(partition);
        }

        if partitions.is_empty() {
            return Err(ConsumeError::InvalidConfig(
                "partitions must be 'all' or a comma-separated list of numbers".to_owned(),
            ));
        }
        Ok(PartitionSelection::Explicit(partitions))
    }
}

/// Everything a session needs, built once at startup.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub topic: String,
    pub partitions: PartitionSelection,
    pub start: StartPosition,
    /// Shift applied to `Oldest` (added) and `Newest` (subtracted).
    pub relative: u64,
    pub resolution: ResolutionPolicy,
    pub buffer_size: usize,
    pub filter: MessageFilter,
    pub format: FormatOptions,
}

impl SessionConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partitions: PartitionSelection::All,
            start: StartPosition::Oldest,
            relative: 0,
            resolution: ResolutionPolicy::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            filter: MessageFilter::default(),
            format: FormatOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConsumeError> {
        if self.topic.is_empty() {
            return Err(ConsumeError::InvalidConfig("topic is required".to_owned()));
        }
        if self.buffer_size == 0 {
            return Err(ConsumeError::InvalidConfig(
                "buffer size must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub partitions: Vec<PartitionStats>,
    pub output: OutputStats,
}

/// Resolve the selection into a sorted set of partitions that exist.
pub async fn resolve_partitions<C>(
    client: &C,
    topic: &str,
    selection: &PartitionSelection,
) -> Result<Vec<Partition>, ConsumeError>
where
    C: BrokerClient + ?Sized,
{
    let mut available = client.partitions(topic).await?;
    available.sort_unstable();

    let mut partitions = match selection {
        PartitionSelection::All => available,
        PartitionSelection::Explicit(requested) => {
            for partition in requested {
                if available.binary_search(partition).is_err() {
                    return Err(ConsumeError::UnknownPartition {
                        topic: topic.to_owned(),
                        partition: *partition,
                    });
                }
            }
            requested.clone()
        }
    };
    partitions.sort_unstable();
    partitions.dedup();
    Ok(partitions)
}

/// Consume `config.topic` into `sink` until every partition reader drained.
///
/// Startup is fail-fast: an unknown topic or partition, unavailable offsets or
/// a subscription that cannot be opened abort the session before any message
/// is read. Once running, the session ends when `shutdown` is requested (or
/// every subscription ends on its own) and all in-flight messages were written.
pub async fn run_session<C, W>(
    client: &C,
    config: &SessionConfig,
    shutdown: &ShutdownCoordinator,
    sink: W,
) -> Result<SessionSummary, ConsumeError>
where
    C: BrokerClient + ?Sized,
    W: AsyncWrite + Unpin,
{
    config.validate()?;
    let topic = config.topic.as_str();

    if !client.topic_exists(topic).await? {
        return Err(ConsumeError::TopicNotFound(topic.to_owned()));
    }

    let partitions = resolve_partitions(client, topic, &config.partitions).await?;
    let offsets = OffsetResolver::new(client, config.resolution)
        .resolve(config.start, config.relative, topic, &partitions)
        .await?;

    let mut readers = Vec::with_capacity(offsets.len());
    for (partition, offset) in offsets {
        match PartitionReader::open(client, topic, partition, offset).await {
            Ok(reader) => readers.push(reader),
            Err(err) => {
                error!(topic, partition, "failed to start partition reader: {}", err);
                for reader in readers {
                    reader.close();
                }
                return Err(err);
            }
        }
    }

    info!(
        topic,
        partitions = readers.len(),
        start = %config.start,
        relative = config.relative,
        "consuming"
    );

    let (merged, completion) =
        FanInMerger::new(config.buffer_size).start(readers, shutdown.closing_token());

    let writer = OutputWriter::new(
        FilterFormatter::new(config.filter.clone(), config.format),
        shutdown.clone(),
    );
    let output = writer.drain(merged, sink).await;

    let partition_stats = completion.await.unwrap_or_else(|err| {
        warn!("failed to join partition readers: {:?}", err);
        vec![]
    });
    shutdown.mark_drained();
    info!(topic, "done consuming");

    Ok(SessionSummary {
        partitions: partition_stats,
        output: output?,
    })
}

/// Write every topic name on its own line.
pub async fn list_topics<C, W>(client: &C, mut sink: W) -> Result<usize, ConsumeError>
where
    C: BrokerClient + ?Sized,
    W: AsyncWrite + Unpin,
{
    let topics = client.list_topics().await?;
    for topic in &topics {
        sink.write_all(topic.as_bytes()).await?;
        sink.write_all(b"\n").await?;
    }
    sink.flush().await?;
    Ok(topics.len())
}
