//! In-memory broker for exercising the engine without Kafka.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::broker::{
    AsyncClose, BrokerClient, BrokerError, Message, Offset, OffsetBound, Partition,
    PartitionSubscription,
};

#[derive(Default)]
struct PartitionLog {
    low_watermark: Offset,
    messages: Vec<Message>,
}

impl PartitionLog {
    fn high_watermark(&self) -> Offset {
        self.messages
            .last()
            .map(|m| m.offset + 1)
            .unwrap_or(self.low_watermark)
    }
}

struct LiveSubscription {
    topic: String,
    partition: Partition,
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    closes: Arc<AtomicUsize>,
}

impl AsyncClose for LiveSubscription {
    fn async_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender ends the stream once buffered messages are read.
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

#[derive(Default)]
struct State {
    topics: BTreeMap<String, BTreeMap<Partition, PartitionLog>>,
    live: Vec<Arc<LiveSubscription>>,
    fail_offsets: bool,
    fail_subscribe: Vec<Partition>,
    stop_at_end: bool,
}

/// A broker keeping every topic in memory.
///
/// Subscriptions follow the log like a real consumer would: they yield the
/// retained messages from the start offset, then wait for [`MemoryBroker::produce`].
/// With [`MemoryBroker::stop_at_end`] they terminate after the retained
/// messages instead.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    subscribes: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.with_state(|state| {
            let logs = state.topics.entry(topic.to_owned()).or_default();
            for partition in 0..partitions {
                logs.entry(partition).or_default();
            }
        });
    }

    /// Append `count` messages valued `message-<offset>` to a partition.
    pub fn fill(&self, topic: &str, partition: Partition, count: usize) {
        for _ in 0..count {
            let offset = self.high_watermark(topic, partition);
            self.produce(
                topic,
                partition,
                None,
                format!("message-{}", offset).into_bytes(),
            );
        }
    }

    pub fn produce(
        &self,
        topic: &str,
        partition: Partition,
        key: Option<&[u8]>,
        value: impl Into<Bytes>,
    ) -> Offset {
        let value = value.into();
        self.with_state(|state| {
            let log = state
                .topics
                .entry(topic.to_owned())
                .or_default()
                .entry(partition)
                .or_default();
            let offset = log.high_watermark();
            let message = Message {
                topic: topic.to_owned(),
                partition,
                offset,
                key: key.map(Bytes::copy_from_slice),
                value,
            };
            log.messages.push(message.clone());

            for live in state
                .live
                .iter()
                .filter(|l| l.topic == topic && l.partition == partition)
            {
                if let Ok(sender) = live.sender.lock() {
                    if let Some(sender) = sender.as_ref() {
                        // Receivers of closed subscriptions may be gone already.
                        sender.send(message.clone()).ok();
                    }
                }
            }
            offset
        })
    }

    /// Drop retained messages below `low_watermark`.
    pub fn truncate(&self, topic: &str, partition: Partition, low_watermark: Offset) {
        self.with_state(|state| {
            if let Some(log) = state
                .topics
                .get_mut(topic)
                .and_then(|logs| logs.get_mut(&partition))
            {
                log.low_watermark = low_watermark;
                log.messages.retain(|m| m.offset >= low_watermark);
            }
        });
    }

    pub fn fail_offsets(&self, fail: bool) {
        self.with_state(|state| state.fail_offsets = fail);
    }

    pub fn fail_subscribe(&self, partition: Partition) {
        self.with_state(|state| state.fail_subscribe.push(partition));
    }

    pub fn stop_at_end(&self, stop: bool) {
        self.with_state(|state| state.stop_at_end = stop);
    }

    pub fn high_watermark(&self, topic: &str, partition: Partition) -> Offset {
        self.with_state(|state| {
            state
                .topics
                .get(topic)
                .and_then(|logs| logs.get(&partition))
                .map(PartitionLog::high_watermark)
                .unwrap_or(0)
        })
    }

    /// Number of successful `subscribe` calls.
    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Number of `async_close` calls across all subscriptions.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self.with_state(|state| state.topics.keys().cloned().collect()))
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, BrokerError> {
        Ok(self.with_state(|state| {
            state
                .topics
                .get(topic)
                .map(|logs| logs.keys().copied().collect())
                .unwrap_or_default()
        }))
    }

    async fn offset(
        &self,
        topic: &str,
        partition: Partition,
        bound: OffsetBound,
    ) -> Result<Offset, BrokerError> {
        self.with_state(|state| {
            if state.fail_offsets {
                return Err(BrokerError::Timeout {
                    operation: "fetch_watermarks",
                });
            }
            let log = state
                .topics
                .get(topic)
                .and_then(|logs| logs.get(&partition))
                .ok_or_else(|| BrokerError::PartitionUnavailable {
                    topic: topic.to_owned(),
                    partition,
                })?;
            Ok(match bound {
                OffsetBound::Oldest => log.low_watermark,
                OffsetBound::Newest => log.high_watermark(),
            })
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: Partition,
        start_offset: Offset,
    ) -> Result<PartitionSubscription, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let live = self.with_state(|state| {
            let unavailable = || BrokerError::PartitionUnavailable {
                topic: topic.to_owned(),
                partition,
            };
            if state.fail_subscribe.contains(&partition) {
                return Err(unavailable());
            }
            let log = state
                .topics
                .get(topic)
                .and_then(|logs| logs.get(&partition))
                .ok_or_else(unavailable)?;
            if start_offset < log.low_watermark {
                return Err(BrokerError::OffsetOutOfRange {
                    partition,
                    offset: start_offset,
                    oldest: log.low_watermark,
                });
            }

            for message in log.messages.iter().filter(|m| m.offset >= start_offset) {
                if sender.send(message.clone()).is_err() {
                    break;
                }
            }

            let live = Arc::new(LiveSubscription {
                topic: topic.to_owned(),
                partition,
                sender: Mutex::new(if state.stop_at_end {
                    None
                } else {
                    Some(sender)
                }),
                closes: self.closes.clone(),
            });
            state.live.push(live.clone());
            Ok(live)
        })?;

        self.subscribes.fetch_add(1, Ordering::SeqCst);

        let messages = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|message| (message, receiver))
        })
        .boxed();

        Ok(PartitionSubscription::new(messages, live))
    }
}
