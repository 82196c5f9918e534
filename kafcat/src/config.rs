use clap::Parser;
use envconfig::Envconfig;

use kafcat_common::merger::DEFAULT_BUFFER_SIZE;
use kafcat_common::offset::{ResolutionPolicy, StartMode, StartPosition};
use kafcat_common::output::{FormatOptions, MessageFilter};
use kafcat_common::session::{PartitionSelection, SessionConfig};

use crate::error::CliError;

/// Consume a Kafka topic, merging all partitions onto stdout.
#[derive(Parser, Debug)]
#[command(name = "kafcat", version, long_about = None)]
pub struct Args {
    /// Kafka peers [ comma-separated host:port ]
    #[arg(long, env = "KAFKA_PEERS", default_value = "", hide_default_value = true)]
    pub peers: String,

    /// Topic to consume
    #[arg(short, long)]
    pub topic: Option<String>,

    /// Starting position [ oldest | newest ]
    #[arg(short, long, default_value = "oldest")]
    pub start: String,

    /// Offset from the starting position, added to oldest or subtracted from newest
    #[arg(short, long, default_value_t = 0)]
    pub offset: u64,

    /// Start at absolute offset N, or at the end of the log if it has fewer messages
    #[arg(long, value_name = "N", conflicts_with = "tail")]
    pub head: Option<u64>,

    /// Start N messages before the end of the log
    #[arg(long, value_name = "N")]
    pub tail: Option<u64>,

    /// Partitions to consume [ all | comma-separated numbers ]
    #[arg(short, long, default_value = "all")]
    pub partitions: String,

    /// Resolve head/tail starting offsets of every partition independently
    #[arg(long)]
    pub per_partition_offsets: bool,

    /// Message channel buffer size
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// List topics and exit
    #[arg(short, long = "list")]
    pub list_topics: bool,

    /// Only show messages NOT containing this pattern
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Print a [ topic/partition/offset/key ] header before each message
    #[arg(short = 'H', long)]
    pub header: bool,

    /// Turn on underlying (librdkafka) logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn peers(&self) -> Result<Vec<String>, CliError> {
        let peers = parse_peers(&self.peers);
        if peers.is_empty() {
            return Err(CliError::Usage(
                "--peers or KAFKA_PEERS variable required".to_owned(),
            ));
        }
        Ok(peers)
    }

    pub fn start_position(&self) -> Result<StartPosition, CliError> {
        match (self.head, self.tail) {
            (Some(_), Some(_)) => Err(CliError::Usage(
                "--head and --tail cannot be used together".to_owned(),
            )),
            (Some(n), None) => Ok(StartPosition::Head(n)),
            (None, Some(n)) => Ok(StartPosition::Tail(n)),
            (None, None) => Ok(self.start.parse::<StartMode>()?.into()),
        }
    }

    /// Build the session configuration. Fails when consuming without a topic.
    pub fn session_config(&self) -> Result<SessionConfig, CliError> {
        let topic = match self.topic.as_deref().map(str::trim) {
            Some(topic) if !topic.is_empty() => topic.to_owned(),
            _ => return Err(CliError::Usage("--topic is required".to_owned())),
        };

        let config = SessionConfig {
            topic,
            partitions: self.partitions.parse::<PartitionSelection>()?,
            start: self.start_position()?,
            relative: self.offset,
            resolution: if self.per_partition_offsets {
                ResolutionPolicy::PerPartition
            } else {
                ResolutionPolicy::ReferencePartition
            },
            buffer_size: self.buffer_size,
            filter: MessageFilter::new(self.filter.as_ref().map(|f| f.as_bytes().to_vec())),
            format: FormatOptions {
                with_header: self.header,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Default tracing filter when RUST_LOG is not set.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug,librdkafka=debug,rdkafka=debug"
        } else {
            "info,librdkafka=warn,rdkafka=warn"
        }
    }
}

pub fn parse_peers(peer_list: &str) -> Vec<String> {
    peer_list
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Client tuning that rarely changes between runs, read from the environment.
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "10000")]
    pub kafka_metadata_timeout_ms: u64, // Metadata and watermark requests

    #[envconfig(default = "6000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "100")]
    pub kafka_fetch_wait_max_ms: u32,

    #[envconfig(default = "kafcat")]
    pub kafka_client_id: String,
}
