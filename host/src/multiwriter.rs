//! Concurrent-safe fan-out of the pty output stream.
//!
//! A `MultiWriter` owns the set of sinks that observe the session: the
//! host's own stdout plus one sink per attached remote session.  It
//! keeps a bounded ring of the most recent write records and replays it
//! to every newly appended sink, so a late joiner sees the last few
//! frames of output (usually including the current prompt) instead of a
//! blank screen.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Default number of write records retained for replay.
pub const DEFAULT_RING_SIZE: usize = 5;

/// Where fanned-out bytes go.  Implementations wrap the host stdout,
/// remote SSH session channels, and test buffers.
#[async_trait]
pub trait OutputSink: Send {
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Identity of an appended sink, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

struct SinkEntry {
    id: SinkId,
    /// A required sink failing fails the write (and thus the session);
    /// a best-effort sink failing is logged and dropped.
    required: bool,
    sink: Box<dyn OutputSink>,
}

struct Inner {
    sinks: Vec<SinkEntry>,
    ring: VecDeque<Vec<u8>>,
    ring_size: usize,
}

pub struct MultiWriter {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl MultiWriter {
    pub fn new(ring_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sinks: Vec::new(),
                ring: VecDeque::new(),
                ring_size: ring_size.max(1),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a sink.  The current ring contents are replayed to it before
    /// it becomes visible to `write`; a replay error fails the append
    /// and the sink is not added.
    pub async fn append(&self, mut sink: Box<dyn OutputSink>, required: bool) -> io::Result<SinkId> {
        let mut inner = self.inner.lock().await;
        for record in &inner.ring {
            sink.send(record).await?;
        }
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        inner.sinks.push(SinkEntry {
            id,
            required,
            sink,
        });
        Ok(id)
    }

    /// Remove a sink by identity.  Unknown ids are ignored.
    pub async fn remove(&self, id: SinkId) {
        let mut inner = self.inner.lock().await;
        inner.sinks.retain(|entry| entry.id != id);
    }

    pub async fn sink_count(&self) -> usize {
        self.inner.lock().await.sinks.len()
    }

    /// Record `data` in the ring and deliver it to every sink, in the
    /// order they were appended.  Serialized: concurrent writers take
    /// turns, so every sink observes the same byte order.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.ring.len() == inner.ring_size {
            inner.ring.pop_front();
        }
        inner.ring.push_back(data.to_vec());

        let mut failed: Vec<SinkId> = Vec::new();
        let mut fatal: Option<io::Error> = None;
        for entry in inner.sinks.iter_mut() {
            match entry.sink.send(data).await {
                Ok(()) => {}
                Err(err) if entry.required => {
                    fatal = Some(err);
                    break;
                }
                Err(err) => {
                    log::warn!("dropping output sink {:?}: {err}", entry.id);
                    failed.push(entry.id);
                }
            }
        }
        inner.sinks.retain(|entry| !failed.contains(&entry.id));
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// An in-memory sink; used by tests and as the force-command stub.
#[derive(Default)]
pub struct BufferSink {
    buf: std::sync::Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl BufferSink {
    pub fn new() -> (Self, std::sync::Arc<parking_lot::Mutex<Vec<u8>>>) {
        let sink = Self::default();
        let buf = sink.buf.clone();
        (sink, buf)
    }
}

#[async_trait]
impl OutputSink for BufferSink {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.buf.lock().extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl OutputSink for FailingSink {
        async fn send(&mut self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
    }

    #[tokio::test]
    async fn sinks_observe_writes_in_order() {
        let mw = MultiWriter::new(DEFAULT_RING_SIZE);
        let (a, a_buf) = BufferSink::new();
        let (b, b_buf) = BufferSink::new();
        mw.append(Box::new(a), false).await.unwrap();
        mw.append(Box::new(b), false).await.unwrap();

        mw.write(b"one ").await.unwrap();
        mw.write(b"two").await.unwrap();

        k9::assert_equal!(a_buf.lock().as_slice(), b"one two");
        k9::assert_equal!(b_buf.lock().as_slice(), b"one two");
    }

    #[tokio::test]
    async fn late_joiner_receives_ring_replay() {
        let mw = MultiWriter::new(2);
        mw.write(b"a").await.unwrap();
        mw.write(b"b").await.unwrap();
        mw.write(b"c").await.unwrap();

        let (sink, buf) = BufferSink::new();
        mw.append(Box::new(sink), false).await.unwrap();
        // Only the two most recent records survive in the ring.
        k9::assert_equal!(buf.lock().as_slice(), b"bc");

        mw.write(b"d").await.unwrap();
        k9::assert_equal!(buf.lock().as_slice(), b"bcd");
    }

    #[tokio::test]
    async fn removed_sink_sees_no_further_writes() {
        let mw = MultiWriter::new(DEFAULT_RING_SIZE);
        let (sink, buf) = BufferSink::new();
        let id = mw.append(Box::new(sink), false).await.unwrap();
        mw.write(b"before").await.unwrap();
        mw.remove(id).await;
        mw.write(b"after").await.unwrap();
        k9::assert_equal!(buf.lock().as_slice(), b"before");
    }

    #[tokio::test]
    async fn append_then_remove_leaves_no_sink() {
        let mw = MultiWriter::new(DEFAULT_RING_SIZE);
        let (sink, _buf) = BufferSink::new();
        let id = mw.append(Box::new(sink), false).await.unwrap();
        mw.remove(id).await;
        k9::assert_equal!(mw.sink_count().await, 0);
    }

    #[tokio::test]
    async fn best_effort_sink_failure_drops_only_that_sink() {
        let mw = MultiWriter::new(DEFAULT_RING_SIZE);
        let (good, buf) = BufferSink::new();
        mw.append(Box::new(FailingSink), false).await.unwrap();
        mw.append(Box::new(good), false).await.unwrap();

        mw.write(b"data").await.unwrap();
        k9::assert_equal!(buf.lock().as_slice(), b"data");
        k9::assert_equal!(mw.sink_count().await, 1);
    }

    #[tokio::test]
    async fn required_sink_failure_fails_the_write() {
        let mw = MultiWriter::new(DEFAULT_RING_SIZE);
        mw.append(Box::new(FailingSink), true).await.unwrap();
        assert!(mw.write(b"data").await.is_err());
    }

    #[tokio::test]
    async fn replay_failure_does_not_add_the_sink() {
        let mw = MultiWriter::new(DEFAULT_RING_SIZE);
        mw.write(b"seed").await.unwrap();
        assert!(mw.append(Box::new(FailingSink), false).await.is_err());
        k9::assert_equal!(mw.sink_count().await, 0);
    }
}
