//! Live-channel client: a persistent connection to the message relay.
//!
//! The public surface is a cheap cloneable [`ChannelClient`] handle in front
//! of one spawned loop that owns the connection. Commands (join, leave,
//! send, shutdown) go in through an mpsc; inbound `receive_message` events
//! come out through the mpsc handed to [`ChannelClient::start`]; connection
//! health is published on a watch channel.
//!
//! Join, leave, and send are fire-and-forget: the snapshot backstop covers
//! anything the relay missed, so no acknowledgment is required for
//! correctness. Reconnection is bounded per cycle and always re-joins the
//! active room before resuming normal traffic.

use async_trait::async_trait;
use concern_protocol::{
    decode_frame, encode_frame, ChannelEvent, InboundMessage, OutboundMessage, RoomMembership,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Seam for the relay connection. `connect` is called once per connection
/// cycle; each call must yield a fresh sink/stream pair.
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<(Box<dyn ChannelSink>, Box<dyn ChannelStream>)>;
}

/// Outbound half of one relay connection.
#[async_trait]
pub trait ChannelSink: Send {
    async fn send(&mut self, event: &ChannelEvent) -> Result<()>;
}

/// Inbound half of one relay connection.
#[async_trait]
pub trait ChannelStream: Send {
    /// Next decoded event, or `None` when the peer closed the connection.
    async fn next(&mut self) -> Result<Option<ChannelEvent>>;
}

/// Wrap any byte stream in the newline-delimited JSON framing and split it
/// into the sink/stream halves the channel loop selects over.
pub fn framed_pair<S>(
    stream: S,
    max_frame_bytes: usize,
) -> (Box<dyn ChannelSink>, Box<dyn ChannelStream>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        Box::new(FrameSink { writer }),
        Box::new(FrameStream {
            reader,
            buf: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }),
    )
}

struct FrameSink<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChannelSink for FrameSink<W> {
    async fn send(&mut self, event: &ChannelEvent) -> Result<()> {
        let frame = encode_frame(event)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

struct FrameStream<R> {
    reader: R,
    buf: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> FrameStream<R> {
    /// Next newline-terminated line, or `None` at EOF. Oversized lines are
    /// skipped, not fatal; a trailing partial line is treated as EOF.
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if self.discarding {
                    // Tail of a frame that blew the cap.
                    self.discarding = false;
                    continue;
                }
                if line.len() > self.max_frame_bytes {
                    warn!("skipping channel frame over {} bytes", self.max_frame_bytes);
                    continue;
                }
                return Ok(Some(line));
            }
            if !self.discarding && self.buf.len() > self.max_frame_bytes {
                warn!(
                    "skipping channel frame over {} bytes",
                    self.max_frame_bytes
                );
                self.discarding = true;
            }
            if self.discarding {
                self.buf.clear();
            }
            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ChannelStream for FrameStream<R> {
    async fn next(&mut self) -> Result<Option<ChannelEvent>> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            match decode_frame(&line) {
                Ok(event) => return Ok(Some(event)),
                Err(err) => debug!("skipping undecodable channel frame: {err}"),
            }
        }
    }
}

/// Production transport: TCP to the relay address.
pub struct TcpTransport {
    addr: String,
    max_frame_bytes: usize,
}

impl TcpTransport {
    #[must_use]
    pub fn new(addr: impl Into<String>, max_frame_bytes: usize) -> Self {
        Self {
            addr: addr.into(),
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl ChannelTransport for TcpTransport {
    async fn connect(&self) -> Result<(Box<dyn ChannelSink>, Box<dyn ChannelStream>)> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(framed_pair(stream, self.max_frame_bytes))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl From<&SyncConfig> for ChannelConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// Connection health, published on every transition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelHealth {
    pub connected: bool,
    pub connect_attempts: u32,
    pub last_error: Option<String>,
    /// Set once a reconnect cycle exhausts its attempt budget. The channel
    /// stays down; the snapshot backstop keeps the client usable.
    pub gave_up: bool,
}

enum ChannelCommand {
    Join(RoomMembership),
    Leave(RoomMembership),
    Send(OutboundMessage),
    Shutdown,
}

#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ChannelClientInner>,
}

struct ChannelClientInner {
    command_tx: mpsc::Sender<ChannelCommand>,
    health_tx: watch::Sender<ChannelHealth>,
}

impl ChannelClient {
    /// Spawn the channel loop and return its handle. Inbound
    /// `receive_message` payloads are delivered to `inbound_tx` in arrival
    /// order.
    #[must_use]
    pub fn start(
        transport: Arc<dyn ChannelTransport>,
        config: ChannelConfig,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (health_tx, _health_rx) = watch::channel(ChannelHealth::default());
        spawn_channel_loop(transport, config, command_rx, inbound_tx, health_tx.clone());
        Self {
            inner: Arc::new(ChannelClientInner {
                command_tx,
                health_tx,
            }),
        }
    }

    pub async fn join(&self, concern_id: &str, user_id: &str) -> Result<()> {
        self.command(ChannelCommand::Join(RoomMembership {
            concern_id: concern_id.to_string(),
            user_id: user_id.to_string(),
        }))
        .await
    }

    pub async fn leave(&self, concern_id: &str, user_id: &str) -> Result<()> {
        self.command(ChannelCommand::Leave(RoomMembership {
            concern_id: concern_id.to_string(),
            user_id: user_id.to_string(),
        }))
        .await
    }

    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.command(ChannelCommand::Send(message)).await
    }

    /// Stop the channel loop. Idempotent: shutting down an already-stopped
    /// channel is a no-op.
    pub async fn shutdown(&self) {
        let _ = self.inner.command_tx.send(ChannelCommand::Shutdown).await;
    }

    #[must_use]
    pub fn health_snapshot(&self) -> ChannelHealth {
        self.inner.health_tx.subscribe().borrow().clone()
    }

    #[must_use]
    pub fn health_stream(&self) -> watch::Receiver<ChannelHealth> {
        self.inner.health_tx.subscribe()
    }

    async fn command(&self, command: ChannelCommand) -> Result<()> {
        self.inner
            .command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.command_tx.try_send(ChannelCommand::Shutdown);
        }
    }
}

fn spawn_channel_loop(
    transport: Arc<dyn ChannelTransport>,
    config: ChannelConfig,
    mut command_rx: mpsc::Receiver<ChannelCommand>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    health_tx: watch::Sender<ChannelHealth>,
) {
    tokio::spawn(async move {
        let mut health = ChannelHealth::default();
        let mut active_room: Option<RoomMembership> = None;

        'session: loop {
            let Some((mut sink, mut stream)) =
                connect_with_retry(transport.as_ref(), &config, &mut health, &health_tx).await
            else {
                // Budget exhausted: the channel stays down and the snapshot
                // backstop carries delivery. Membership bookkeeping continues
                // so a later inspection of the loop state stays coherent.
                loop {
                    match command_rx.recv().await {
                        Some(ChannelCommand::Join(room)) => active_room = Some(room),
                        Some(ChannelCommand::Leave(room)) => {
                            if active_room
                                .as_ref()
                                .is_some_and(|r| r.concern_id == room.concern_id)
                            {
                                active_room = None;
                            }
                        }
                        Some(ChannelCommand::Send(message)) => {
                            warn!("dropping outbound message {}: channel unavailable", message.id);
                        }
                        Some(ChannelCommand::Shutdown) | None => break 'session,
                    }
                }
            };

            // Re-establish membership for the active room. This is an
            // explicit step of the reconnect path: without it, live delivery
            // for the selected concern stops until the next snapshot.
            if let Some(room) = active_room.clone() {
                if let Err(err) = sink.send(&ChannelEvent::JoinRoom(room)).await {
                    warn!("rejoin after reconnect failed: {err}");
                    mark_disconnected(&mut health, &health_tx, err.to_string());
                    continue 'session;
                }
            }

            loop {
                tokio::select! {
                    maybe_command = command_rx.recv() => {
                        let event = match maybe_command {
                            Some(ChannelCommand::Join(room)) => {
                                active_room = Some(room.clone());
                                ChannelEvent::JoinRoom(room)
                            }
                            Some(ChannelCommand::Leave(room)) => {
                                if active_room
                                    .as_ref()
                                    .is_some_and(|r| r.concern_id == room.concern_id)
                                {
                                    active_room = None;
                                }
                                ChannelEvent::LeaveRoom(room)
                            }
                            Some(ChannelCommand::Send(message)) => ChannelEvent::SendMessage(message),
                            Some(ChannelCommand::Shutdown) | None => break 'session,
                        };
                        if let Err(err) = sink.send(&event).await {
                            warn!("channel send failed: {err}");
                            mark_disconnected(&mut health, &health_tx, err.to_string());
                            continue 'session;
                        }
                    }
                    inbound = stream.next() => match inbound {
                        Ok(Some(ChannelEvent::ReceiveMessage(message))) => {
                            if inbound_tx.send(message).await.is_err() {
                                break 'session;
                            }
                        }
                        Ok(Some(other)) => {
                            debug!("ignoring unexpected {} event from relay", other.kind());
                        }
                        Ok(None) => {
                            info!("channel closed by peer, reconnecting");
                            mark_disconnected(&mut health, &health_tx, "closed by peer".to_string());
                            continue 'session;
                        }
                        Err(err) => {
                            warn!("channel receive failed: {err}");
                            mark_disconnected(&mut health, &health_tx, err.to_string());
                            continue 'session;
                        }
                    },
                }
            }
        }

        health.connected = false;
        let _ = health_tx.send(health);
    });
}

/// One bounded connection cycle: up to `reconnect_attempts` tries with a
/// fixed delay between them. `None` means the budget ran out; the failure
/// is surfaced through the health channel, never as a hard error.
async fn connect_with_retry(
    transport: &dyn ChannelTransport,
    config: &ChannelConfig,
    health: &mut ChannelHealth,
    health_tx: &watch::Sender<ChannelHealth>,
) -> Option<(Box<dyn ChannelSink>, Box<dyn ChannelStream>)> {
    for attempt in 1..=config.reconnect_attempts {
        health.connect_attempts = attempt;
        let _ = health_tx.send(health.clone());
        match transport.connect().await {
            Ok(connection) => {
                if attempt > 1 {
                    info!("channel connected after {attempt} attempts");
                }
                health.connected = true;
                health.last_error = None;
                health.gave_up = false;
                let _ = health_tx.send(health.clone());
                return Some(connection);
            }
            Err(err) => {
                warn!(
                    "channel connect attempt {attempt}/{} failed: {err}",
                    config.reconnect_attempts
                );
                health.connected = false;
                health.last_error = Some(err.to_string());
                let _ = health_tx.send(health.clone());
                if attempt < config.reconnect_attempts {
                    tokio::time::sleep(config.reconnect_delay).await;
                }
            }
        }
    }
    health.gave_up = true;
    let _ = health_tx.send(health.clone());
    None
}

fn mark_disconnected(
    health: &mut ChannelHealth,
    health_tx: &watch::Sender<ChannelHealth>,
    error: String,
) {
    health.connected = false;
    health.last_error = Some(error);
    let _ = health_tx.send(health.clone());
}
