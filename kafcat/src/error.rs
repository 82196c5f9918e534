use kafcat_common::error::{ConsumeError, ErrorKind};
use rdkafka::error::KafkaError;
use thiserror::Error;

pub const EXIT_USAGE: u8 = 64;
pub const EXIT_UNAVAILABLE: u8 = 69;
pub const EXIT_NOT_FOUND: u8 = 70;
pub const EXIT_IO: u8 = 74;

/// Enumeration of errors that end the process with a non-zero code.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("invalid kafka configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("failed to start consumer: {0}")]
    Client(#[from] KafkaError),
    #[error(transparent)]
    Consume(#[from] ConsumeError),
}

impl CliError {
    pub fn is_usage(&self) -> bool {
        match self {
            CliError::Usage(_) | CliError::Config(_) => true,
            CliError::Client(_) => false,
            CliError::Consume(err) => err.kind() == ErrorKind::Usage,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Usage(_) | CliError::Config(_) => EXIT_USAGE,
            CliError::Client(_) => EXIT_UNAVAILABLE,
            CliError::Consume(err) => match err.kind() {
                ErrorKind::Usage => EXIT_USAGE,
                ErrorKind::Broker => EXIT_UNAVAILABLE,
                ErrorKind::NotFound => EXIT_NOT_FOUND,
                ErrorKind::Output => EXIT_IO,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafcat_common::broker::BrokerError;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let usage = CliError::Usage("--topic is required".to_owned());
        let broker = CliError::from(ConsumeError::BrokerUnavailable(BrokerError::Timeout {
            operation: "fetch_metadata",
        }));
        let not_found = CliError::from(ConsumeError::TopicNotFound("events".to_owned()));

        assert_eq!(usage.exit_code(), EXIT_USAGE);
        assert_eq!(broker.exit_code(), EXIT_UNAVAILABLE);
        assert_eq!(not_found.exit_code(), EXIT_NOT_FOUND);
        assert!(usage.is_usage());
        assert!(!broker.is_usage());
    }

    #[test]
    fn invalid_position_is_usage() {
        let err = CliError::from(ConsumeError::InvalidPosition("latest".to_owned()));
        assert!(err.is_usage());
        assert_eq!(err.exit_code(), EXIT_USAGE);
    }
}
