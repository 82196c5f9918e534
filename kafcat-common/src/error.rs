use thiserror::Error;

use crate::broker::{BrokerError, Partition};

/// Coarse classification of a [`ConsumeError`], used to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Broker,
    NotFound,
    Output,
}

/// Enumeration of errors that stop a consumption session.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("invalid starting position {0:?}, expected one of: oldest, newest")]
    InvalidPosition(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("topic {0} not found")]
    TopicNotFound(String),
    #[error("partition {partition} does not exist in topic {topic}")]
    UnknownPartition { topic: String, partition: Partition },
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[from] BrokerError),
    #[error("failed to start consumer for partition {partition}: {cause}")]
    SubscriptionFailed {
        partition: Partition,
        #[source]
        cause: BrokerError,
    },
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

impl ConsumeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumeError::InvalidPosition(_) | ConsumeError::InvalidConfig(_) => ErrorKind::Usage,
            ConsumeError::TopicNotFound(_) | ConsumeError::UnknownPartition { .. } => {
                ErrorKind::NotFound
            }
            ConsumeError::BrokerUnavailable(_) | ConsumeError::SubscriptionFailed { .. } => {
                ErrorKind::Broker
            }
            ConsumeError::Output(_) => ErrorKind::Output,
        }
    }
}
