//! Shared harness for sync-flow tests: an in-memory relay transport and a
//! canned snapshot source.

use async_trait::async_trait;
use concern_client::{
    framed_pair, ChannelSink, ChannelStream, ChannelTransport, Result, SnapshotSource, SyncConfig,
    SyncError,
};
use concern_protocol::{ChannelEvent, ConcernRecord};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const MAX_TEST_FRAME_BYTES: usize = 64 * 1024;

/// Transport whose "relay" is the test itself: every successful `connect`
/// hands the server half of a fresh duplex pipe back through a channel.
pub struct MemoryTransport {
    server_tx: mpsc::UnboundedSender<DuplexStream>,
    fail_next: AtomicU32,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                server_tx,
                fail_next: AtomicU32::new(0),
            }),
            server_rx,
        )
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    async fn connect(&self) -> Result<(Box<dyn ChannelSink>, Box<dyn ChannelStream>)> {
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(SyncError::Other("simulated connect failure".to_string()));
        }
        let (client_end, server_end) = tokio::io::duplex(MAX_TEST_FRAME_BYTES);
        self.server_tx
            .send(server_end)
            .map_err(|_| SyncError::Other("test relay gone".to_string()))?;
        Ok(framed_pair(client_end, MAX_TEST_FRAME_BYTES))
    }
}

/// One accepted relay-side connection.
pub struct RelayConnection {
    pub sink: Box<dyn ChannelSink>,
    pub stream: Box<dyn ChannelStream>,
}

impl RelayConnection {
    pub async fn next_event(&mut self) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), self.stream.next())
            .await
            .expect("timed out waiting for a relay event")
            .expect("relay stream failed")
            .expect("client closed the connection")
    }
}

/// Accept the next connection the client opened.
pub async fn accept(server_rx: &mut mpsc::UnboundedReceiver<DuplexStream>) -> RelayConnection {
    let raw = tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
        .await
        .expect("timed out waiting for a client connection")
        .expect("transport dropped");
    let (sink, stream) = framed_pair(raw, MAX_TEST_FRAME_BYTES);
    RelayConnection { sink, stream }
}

/// Snapshot source serving whatever the test put in it.
pub struct StaticSource {
    records: Vec<ConcernRecord>,
}

impl StaticSource {
    pub fn new(records: Vec<ConcernRecord>) -> Arc<Self> {
        Arc::new(Self { records })
    }
}

#[async_trait]
impl SnapshotSource for StaticSource {
    async fn fetch_all(&self) -> Result<Vec<ConcernRecord>> {
        Ok(self.records.clone())
    }
}

pub fn record(id: &str, title: &str) -> ConcernRecord {
    ConcernRecord {
        id: Some(id.to_string()),
        title: Some(title.to_string()),
        ..ConcernRecord::default()
    }
}

/// Test session config: one startup snapshot, fast retries.
pub fn test_config(user_id: &str) -> SyncConfig {
    SyncConfig {
        user_id: user_id.to_string(),
        snapshot_interval_secs: 3600,
        reconnect_attempts: 5,
        reconnect_delay_ms: 20,
        ..SyncConfig::default()
    }
}

/// Poll `probe` until it reports true, panicking after five seconds.
pub async fn wait_until<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
