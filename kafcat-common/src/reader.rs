//! Per-partition reader pumping one subscription into the merge channel.

use futures::StreamExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{BrokerClient, Message, Offset, Partition, PartitionSubscription};
use crate::error::ConsumeError;

/// What a reader consumed before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStats {
    pub partition: Partition,
    pub messages: u64,
    pub last_offset: Option<Offset>,
}

pub struct PartitionReader {
    topic: String,
    partition: Partition,
    start_offset: Offset,
    subscription: PartitionSubscription,
}

impl PartitionReader {
    /// Open a subscription on `partition` starting at `start_offset`.
    pub async fn open<C>(
        client: &C,
        topic: &str,
        partition: Partition,
        start_offset: Offset,
    ) -> Result<Self, ConsumeError>
    where
        C: BrokerClient + ?Sized,
    {
        let subscription = client
            .subscribe(topic, partition, start_offset)
            .await
            .map_err(|cause| ConsumeError::SubscriptionFailed { partition, cause })?;

        debug!(topic, partition, start_offset, "opened partition subscription");

        Ok(Self {
            topic: topic.to_owned(),
            partition,
            start_offset,
            subscription,
        })
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Request a close without pumping, for readers that never get to run.
    pub fn close(self) {
        self.subscription.closer().async_close();
    }

    /// Forward every message into `sink` until the subscription ends.
    ///
    /// Once `closing` is cancelled the subscription is asked to close and the
    /// reader keeps forwarding what is still in flight until the stream
    /// terminates. Sending blocks while `sink` is full.
    pub async fn run(
        self,
        sink: mpsc::Sender<Message>,
        closing: CancellationToken,
    ) -> PartitionStats {
        let Self {
            topic,
            partition,
            start_offset,
            subscription,
        } = self;
        let (mut messages, closer) = subscription.into_parts();

        info!(topic = %topic, partition, start_offset, "starting partition reader");

        let mut stats = PartitionStats {
            partition,
            messages: 0,
            last_offset: None,
        };
        let mut close_requested = false;

        loop {
            tokio::select! {
                _ = closing.cancelled(), if !close_requested => {
                    debug!(topic = %topic, partition, "closing partition subscription");
                    closer.async_close();
                    close_requested = true;
                }
                next = messages.next() => {
                    let Some(message) = next else {
                        break;
                    };
                    let offset = message.offset;
                    if sink.send(message).await.is_err() {
                        // Nobody is reading the merged stream anymore.
                        debug!(topic = %topic, partition, "merge channel closed, stopping");
                        if !close_requested {
                            closer.async_close();
                        }
                        break;
                    }
                    stats.messages += 1;
                    stats.last_offset = Some(offset);
                    counter!("kafcat_messages_consumed_total", "partition" => partition.to_string())
                        .increment(1);
                }
            }
        }

        info!(
            topic = %topic,
            partition,
            messages = stats.messages,
            last_offset = ?stats.last_offset,
            "partition reader finished"
        );
        stats
    }
}
