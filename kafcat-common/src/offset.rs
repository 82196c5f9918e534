//! Resolution of user-facing starting positions into concrete offsets.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::broker::{BrokerClient, Offset, OffsetBound, Partition};
use crate::error::ConsumeError;

/// The `oldest` / `newest` mode given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Oldest,
    Newest,
}

impl FromStr for StartMode {
    type Err = ConsumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oldest" => Ok(StartMode::Oldest),
            "newest" => Ok(StartMode::Newest),
            _ => Err(ConsumeError::InvalidPosition(s.to_owned())),
        }
    }
}

/// Where a session starts reading.
///
/// `Oldest` and `Newest` are shifted by the `relative` amount passed to
/// [`OffsetResolver::resolve`]; `Head` and `Tail` carry their own amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Oldest,
    Newest,
    /// Start at absolute offset `n`, clamped to the end of the log.
    Head(u64),
    /// Start `n` messages before the end of the log, clamped to zero.
    Tail(u64),
}

impl From<StartMode> for StartPosition {
    fn from(mode: StartMode) -> Self {
        match mode {
            StartMode::Oldest => StartPosition::Oldest,
            StartMode::Newest => StartPosition::Newest,
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Oldest => write!(f, "oldest"),
            StartPosition::Newest => write!(f, "newest"),
            StartPosition::Head(n) => write!(f, "head({n})"),
            StartPosition::Tail(n) => write!(f, "tail({n})"),
        }
    }
}

impl StartPosition {
    /// The broker bound this position is computed from.
    pub fn bound(&self) -> OffsetBound {
        match self {
            StartPosition::Oldest => OffsetBound::Oldest,
            StartPosition::Newest | StartPosition::Head(_) | StartPosition::Tail(_) => {
                OffsetBound::Newest
            }
        }
    }

    /// Whether this position counts from a shared end-of-log offset.
    ///
    /// `Oldest` and `Newest` always follow each partition's own bound.
    pub fn counts_from_end(&self) -> bool {
        matches!(self, StartPosition::Head(_) | StartPosition::Tail(_))
    }

    /// Compute the starting offset from the broker-reported `bound_offset`.
    pub fn apply(&self, bound_offset: Offset, relative: u64) -> Offset {
        match *self {
            // Not clamped upwards; the broker decides what an overshoot reads.
            StartPosition::Oldest => bound_offset.saturating_add(as_offset(relative)),
            StartPosition::Newest => bound_offset.saturating_sub(as_offset(relative)).max(0),
            StartPosition::Head(n) => as_offset(n).min(bound_offset).max(0),
            StartPosition::Tail(n) => bound_offset.saturating_sub(as_offset(n)).max(0),
        }
    }
}

fn as_offset(amount: u64) -> Offset {
    Offset::try_from(amount).unwrap_or(Offset::MAX)
}

/// Which partitions' bounds are queried when resolving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolutionPolicy {
    /// For head and tail, query the lowest partition only and reuse its offset
    /// for every partition. Assumes all partitions have comparable offset
    /// ranges. Oldest and newest are still resolved per partition.
    #[default]
    ReferencePartition,
    /// Query every partition and resolve each one independently.
    PerPartition,
}

pub struct OffsetResolver<'a, C: ?Sized> {
    client: &'a C,
    policy: ResolutionPolicy,
}

impl<'a, C> OffsetResolver<'a, C>
where
    C: BrokerClient + ?Sized,
{
    pub fn new(client: &'a C, policy: ResolutionPolicy) -> Self {
        Self { client, policy }
    }

    pub async fn resolve(
        &self,
        position: StartPosition,
        relative: u64,
        topic: &str,
        partitions: &[Partition],
    ) -> Result<BTreeMap<Partition, Offset>, ConsumeError> {
        let bound = position.bound();
        let mut resolved = BTreeMap::new();

        if self.policy == ResolutionPolicy::ReferencePartition && position.counts_from_end() {
            let Some(reference) = partitions.iter().min().copied() else {
                return Ok(resolved);
            };
            let bound_offset = self.client.offset(topic, reference, bound).await?;
            let offset = position.apply(bound_offset, relative);
            debug!(
                topic,
                reference, %position, relative, bound_offset, offset, "resolved starting offset"
            );
            for partition in partitions {
                resolved.insert(*partition, offset);
            }
            return Ok(resolved);
        }

        for partition in partitions {
            let bound_offset = self.client.offset(topic, *partition, bound).await?;
            let offset = position.apply(bound_offset, relative);
            debug!(
                topic,
                partition, %position, relative, bound_offset, offset, "resolved starting offset"
            );
            resolved.insert(*partition, offset);
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryBroker;

    #[test]
    fn start_mode_parsing() {
        assert_eq!("oldest".parse::<StartMode>().unwrap(), StartMode::Oldest);
        assert_eq!(" Newest ".parse::<StartMode>().unwrap(), StartMode::Newest);
        match "latest".parse::<StartMode>() {
            Err(ConsumeError::InvalidPosition(mode)) => assert_eq!(mode, "latest"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn oldest_adds_relative_without_upper_clamp() {
        assert_eq!(StartPosition::Oldest.apply(5, 0), 5);
        assert_eq!(StartPosition::Oldest.apply(5, 1000), 1005);
        assert_eq!(StartPosition::Oldest.apply(5, u64::MAX), Offset::MAX);
    }

    #[test]
    fn newest_subtracts_relative_and_clamps_to_zero() {
        assert_eq!(StartPosition::Newest.apply(100, 0), 100);
        assert_eq!(StartPosition::Newest.apply(100, 30), 70);
        assert_eq!(StartPosition::Newest.apply(100, 300), 0);
        assert_eq!(StartPosition::Newest.apply(100, u64::MAX), 0);
    }

    #[test]
    fn head_clamps_to_end_of_log() {
        assert_eq!(StartPosition::Head(10).apply(100, 0), 10);
        assert_eq!(StartPosition::Head(100).apply(100, 0), 100);
        assert_eq!(StartPosition::Head(500).apply(100, 0), 100);
    }

    #[test]
    fn tail_clamps_to_zero() {
        assert_eq!(StartPosition::Tail(10).apply(100, 0), 90);
        assert_eq!(StartPosition::Tail(100).apply(100, 0), 0);
        assert_eq!(StartPosition::Tail(500).apply(100, 0), 0);
    }

    #[test]
    fn relative_is_ignored_by_head_and_tail() {
        assert_eq!(StartPosition::Tail(10).apply(100, 50), 90);
        assert_eq!(StartPosition::Head(10).apply(100, 50), 10);
    }

    fn events_broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 2);
        broker.fill("events", 0, 100);
        broker.fill("events", 1, 140);
        broker
    }

    #[tokio::test]
    async fn reference_partition_offset_is_shared() {
        let broker = events_broker();
        let resolver = OffsetResolver::new(&broker, ResolutionPolicy::ReferencePartition);

        let offsets = resolver
            .resolve(StartPosition::Tail(10), 0, "events", &[1, 0])
            .await
            .unwrap();

        assert_eq!(offsets.get(&0), Some(&90));
        assert_eq!(offsets.get(&1), Some(&90));
    }

    #[tokio::test]
    async fn per_partition_offsets_are_independent() {
        let broker = events_broker();
        let resolver = OffsetResolver::new(&broker, ResolutionPolicy::PerPartition);

        let offsets = resolver
            .resolve(StartPosition::Tail(10), 0, "events", &[0, 1])
            .await
            .unwrap();

        assert_eq!(offsets.get(&0), Some(&90));
        assert_eq!(offsets.get(&1), Some(&130));
    }

    #[tokio::test]
    async fn newest_follows_each_partition_by_default() {
        let broker = events_broker();
        let resolver = OffsetResolver::new(&broker, ResolutionPolicy::default());

        let offsets = resolver
            .resolve(StartPosition::Newest, 0, "events", &[0, 1])
            .await
            .unwrap();

        assert_eq!(offsets.get(&0), Some(&100));
        assert_eq!(offsets.get(&1), Some(&140));
    }

    #[tokio::test]
    async fn oldest_follows_each_partition_retention_by_default() {
        let broker = events_broker();
        broker.truncate("events", 1, 40);
        let resolver = OffsetResolver::new(&broker, ResolutionPolicy::default());

        let offsets = resolver
            .resolve(StartPosition::Oldest, 2, "events", &[0, 1])
            .await
            .unwrap();

        assert_eq!(offsets.get(&0), Some(&2));
        assert_eq!(offsets.get(&1), Some(&42));
    }

    #[tokio::test]
    async fn oldest_uses_low_watermark() {
        let broker = events_broker();
        broker.truncate("events", 0, 40);
        let resolver = OffsetResolver::new(&broker, ResolutionPolicy::ReferencePartition);

        let offsets = resolver
            .resolve(StartPosition::Oldest, 5, "events", &[0])
            .await
            .unwrap();

        assert_eq!(offsets.get(&0), Some(&45));
    }

    #[tokio::test]
    async fn empty_partition_set_resolves_nothing() {
        let broker = events_broker();
        let resolver = OffsetResolver::new(&broker, ResolutionPolicy::ReferencePartition);

        let offsets = resolver
            .resolve(StartPosition::Newest, 0, "events", &[])
            .await
            .unwrap();

        assert!(offsets.is_empty());
    }

    #[tokio::test]
    async fn unavailable_bounds_are_reported() {
        let broker = events_broker();
        broker.fail_offsets(true);
        let resolver = OffsetResolver::new(&broker, ResolutionPolicy::PerPartition);

        match resolver
            .resolve(StartPosition::Newest, 0, "events", &[0, 1])
            .await
        {
            Err(ConsumeError::BrokerUnavailable(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
