//! Fan-in of every partition reader into one bounded channel.

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::Message;
use crate::reader::{PartitionReader, PartitionStats};

pub const DEFAULT_BUFFER_SIZE: usize = 256;

pub struct FanInMerger {
    buffer_size: usize,
}

impl Default for FanInMerger {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl FanInMerger {
    /// `buffer_size` is the capacity of the merged channel. Readers block once
    /// it is full.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Spawn one pump per reader and return the merged stream together with a
    /// handle resolving once every pump has exited.
    ///
    /// The merged channel only closes after the last pump drops its sender, so
    /// the receiver sees `None` strictly after all messages have been
    /// delivered. Messages of a partition arrive in the order its reader
    /// produced them; nothing is guaranteed across partitions.
    pub fn start(
        &self,
        readers: Vec<PartitionReader>,
        closing: CancellationToken,
    ) -> (mpsc::Receiver<Message>, JoinHandle<Vec<PartitionStats>>) {
        let (sender, receiver) = mpsc::channel(self.buffer_size);

        let mut pumps = JoinSet::new();
        for reader in readers {
            pumps.spawn(reader.run(sender.clone(), closing.clone()));
        }
        drop(sender);

        let completion = tokio::spawn(async move {
            let mut stats = Vec::with_capacity(pumps.len());
            while let Some(res) = pumps.join_next().await {
                match res {
                    Ok(partition_stats) => stats.push(partition_stats),
                    Err(err) => error!("partition reader task failed: {:?}", err),
                }
            }
            stats.sort_by_key(|s| s.partition);
            info!(readers = stats.len(), "all partition readers drained");
            stats
        });

        (receiver, completion)
    }
}
