//! Filtering and rendering of the merged stream onto the output sink.

use std::io;

use metrics::counter;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error};

use crate::broker::Message;
use crate::shutdown::ShutdownCoordinator;

/// Drop every message whose value contains `pattern`.
///
/// This is an exclusion filter: only messages NOT containing the pattern are
/// shown. An empty pattern is treated as no filter at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pattern: Option<Vec<u8>>,
}

impl MessageFilter {
    pub fn new(pattern: Option<Vec<u8>>) -> Self {
        Self {
            pattern: pattern.filter(|p| !p.is_empty()),
        }
    }

    pub fn passes(&self, value: &[u8]) -> bool {
        match &self.pattern {
            None => true,
            Some(pattern) => !contains(value, pattern),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOptions {
    pub with_header: bool,
}

/// Decides whether a message is emitted and renders it.
#[derive(Debug, Clone, Default)]
pub struct FilterFormatter {
    filter: MessageFilter,
    options: FormatOptions,
}

impl FilterFormatter {
    pub fn new(filter: MessageFilter, options: FormatOptions) -> Self {
        Self { filter, options }
    }

    /// Render `message`, or `None` when the filter drops it.
    ///
    /// With a header the output is `[ topic/partition/offset/key ] value`.
    /// Exactly one trailing newline is guaranteed: it is appended unless the
    /// value already ends with one.
    pub fn process(&self, message: &Message) -> Option<Vec<u8>> {
        if !self.filter.passes(&message.value) {
            return None;
        }

        let mut rendered = Vec::with_capacity(message.value.len() + 64);
        if self.options.with_header {
            rendered.extend_from_slice(
                format!(
                    "[ {}/{}/{}/",
                    message.topic, message.partition, message.offset
                )
                .as_bytes(),
            );
            if let Some(key) = &message.key {
                rendered.extend_from_slice(key);
            }
            rendered.extend_from_slice(b" ] ");
        }
        rendered.extend_from_slice(&message.value);
        if message.value.last() != Some(&b'\n') {
            rendered.push(b'\n');
        }

        Some(rendered)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub written: u64,
    pub filtered: u64,
    /// Messages received after the sink failed.
    pub discarded: u64,
}

/// Drains the merged stream into a byte sink.
pub struct OutputWriter {
    formatter: FilterFormatter,
    shutdown: ShutdownCoordinator,
}

impl OutputWriter {
    pub fn new(formatter: FilterFormatter, shutdown: ShutdownCoordinator) -> Self {
        Self {
            formatter,
            shutdown,
        }
    }

    /// Write every message until the merged channel closes.
    ///
    /// The sink is flushed whenever the channel is momentarily empty. If the
    /// sink fails, shutdown is requested and the remaining messages are
    /// discarded so readers can drain; the error is returned at the end.
    pub async fn drain<W>(
        &self,
        mut merged: mpsc::Receiver<Message>,
        sink: W,
    ) -> Result<OutputStats, io::Error>
    where
        W: AsyncWrite + Unpin,
    {
        let mut sink = BufWriter::new(sink);
        let mut stats = OutputStats::default();
        let mut failure: Option<io::Error> = None;

        let mut next = merged.recv().await;
        while let Some(message) = next {
            if failure.is_some() {
                stats.discarded += 1;
            } else if let Some(rendered) = self.formatter.process(&message) {
                match sink.write_all(&rendered).await {
                    Ok(()) => {
                        stats.written += 1;
                        counter!("kafcat_messages_written_total").increment(1);
                    }
                    Err(err) => failure = Some(self.fail(err)),
                }
            } else {
                stats.filtered += 1;
                counter!("kafcat_messages_filtered_total").increment(1);
            }

            next = match merged.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Empty) => {
                    if failure.is_none() {
                        if let Err(err) = sink.flush().await {
                            failure = Some(self.fail(err));
                        }
                    }
                    merged.recv().await
                }
                Err(TryRecvError::Disconnected) => None,
            };
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if let Err(err) = sink.flush().await {
            return Err(self.fail(err));
        }

        debug!(
            written = stats.written,
            filtered = stats.filtered,
            "merged stream drained"
        );
        Ok(stats)
    }

    fn fail(&self, err: io::Error) -> io::Error {
        error!("failed to write output: {}", err);
        self.shutdown.request_shutdown("output sink failed");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn message(offset: i64, key: Option<&str>, value: &str) -> Message {
        Message {
            topic: "events".to_string(),
            partition: 1,
            offset,
            key: key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    fn formatter(pattern: Option<&str>, with_header: bool) -> FilterFormatter {
        FilterFormatter::new(
            MessageFilter::new(pattern.map(|p| p.as_bytes().to_vec())),
            FormatOptions { with_header },
        )
    }

    #[test]
    fn filter_excludes_matching_values() {
        let filter = MessageFilter::new(Some(b"skip".to_vec()));
        assert!(!filter.passes(b"skip-me"));
        assert!(!filter.passes(b"please skip"));
        assert!(filter.passes(b"keep-me"));
        assert!(filter.passes(b"ski"));
        assert!(filter.passes(b""));
    }

    #[test]
    fn absent_or_empty_filter_passes_everything() {
        assert!(MessageFilter::new(None).passes(b"anything"));
        assert!(MessageFilter::new(Some(vec![])).passes(b"anything"));
        assert!(MessageFilter::default().passes(b""));
    }

    #[test]
    fn raw_values_get_exactly_one_newline() {
        let formatter = formatter(None, false);
        assert_eq!(
            formatter.process(&message(0, None, "keep-me")),
            Some(b"keep-me\n".to_vec())
        );
        assert_eq!(
            formatter.process(&message(0, None, "keep-me\n")),
            Some(b"keep-me\n".to_vec())
        );
        assert_eq!(
            formatter.process(&message(0, None, "")),
            Some(b"\n".to_vec())
        );
    }

    #[test]
    fn header_includes_topic_partition_offset_and_key() {
        let formatter = formatter(None, true);
        assert_eq!(
            formatter.process(&message(42, Some("user-1"), "hello")),
            Some(b"[ events/1/42/user-1 ] hello\n".to_vec())
        );
        assert_eq!(
            formatter.process(&message(43, None, "hello\n")),
            Some(b"[ events/1/43/ ] hello\n".to_vec())
        );
        assert_eq!(
            formatter.process(&message(44, None, "")),
            Some(b"[ events/1/44/ ] \n".to_vec())
        );
    }

    #[test]
    fn skip_keep_scenario() {
        let formatter = formatter(Some("skip"), false);
        assert_eq!(formatter.process(&message(0, None, "skip-me\n")), None);
        assert_eq!(
            formatter.process(&message(1, None, "keep-me")),
            Some(b"keep-me\n".to_vec())
        );
    }

    #[tokio::test]
    async fn drain_writes_passing_messages() {
        let (tx, rx) = mpsc::channel(8);
        for (offset, value) in ["a", "skip-b", "c\n"].iter().enumerate() {
            tx.send(message(offset as i64, None, value)).await.unwrap();
        }
        drop(tx);

        let writer = OutputWriter::new(
            formatter(Some("skip"), false),
            ShutdownCoordinator::new(),
        );
        let mut out = Vec::new();
        let stats = writer.drain(rx, &mut out).await.unwrap();

        assert_eq!(out, b"a\nc\n".to_vec());
        assert_eq!(stats.written, 2);
        assert_eq!(stats.filtered, 1);
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn sink_failure_requests_shutdown_and_keeps_draining() {
        let (tx, rx) = mpsc::channel(8);
        for offset in 0..5 {
            tx.send(message(offset, None, "value")).await.unwrap();
        }
        drop(tx);

        let shutdown = ShutdownCoordinator::new();
        let writer = OutputWriter::new(formatter(None, false), shutdown.clone());

        match writer.drain(rx, BrokenPipe).await {
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::BrokenPipe),
            Ok(stats) => panic!("should have errored, got {:?}", stats),
        }
        assert!(shutdown.closing_token().is_cancelled());
    }
}
