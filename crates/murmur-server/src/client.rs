//! Per-connection reader and writer pumps.
//!
//! Each socket gets two loops. The writer owns the sink half and the
//! receiving end of the connection's bounded outbound queue; the reader owns
//! the stream half and feeds decoded envelopes into the hub. The routing
//! table holds the only sender of the queue, so removing the connection from
//! the table is what stops the writer. The reader stops on end of stream,
//! transport error, read deadline, or when the writer has finished.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{Message as Frame, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use murmur_shared::protocol::ClientEnvelope;
use murmur_shared::{ConnectionId, ProtocolError, Username};

use crate::config::ServerConfig;
use crate::error::{DeliveryError, PumpError};
use crate::hub::Hub;

// ---------------------------------------------------------------------------
// Handle held by the routing table
// ---------------------------------------------------------------------------

/// The routing table's reference to a live connection.
#[derive(Debug)]
pub struct ClientHandle {
    id: ConnectionId,
    username: Username,
    queue: mpsc::Sender<String>,
}

impl ClientHandle {
    pub fn new(username: Username, queue: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            username,
            queue,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn username(&self) -> &Username {
        &self.username
    }

    /// Queue a serialized envelope without waiting.
    pub fn try_push(&self, frame: String) -> Result<(), DeliveryError> {
        self.queue.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::QueueClosed,
        })
    }
}

// ---------------------------------------------------------------------------
// Pump settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&ServerConfig> for PumpSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            queue_capacity: config.send_queue_capacity,
            ping_interval: config.ping_interval,
            pong_timeout: config.pong_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Run an upgraded socket for `username` until either pump stops.
pub async fn serve(socket: WebSocket, hub: Hub, username: Username, settings: PumpSettings) {
    let (sink, stream) = socket.split();
    run_connection(sink, stream, hub, username, settings).await;
}

pub(crate) async fn run_connection<W, R, E>(
    sink: W,
    stream: R,
    hub: Hub,
    username: Username,
    settings: PumpSettings,
) where
    W: Sink<Frame> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    let (tx, rx) = mpsc::channel(settings.queue_capacity);
    let client = ClientHandle::new(username.clone(), tx);
    let connection = client.id();

    if !hub.register(client).await {
        warn!(user = %username, "Hub is not running, dropping connection");
        return;
    }

    let writer_user = username.clone();
    let mut writer = tokio::spawn(async move {
        if let Err(e) = write_pump(sink, rx, settings).await {
            warn!(user = %writer_user, error = %e, "Write pump failed");
        }
    });

    let writer_result = tokio::select! {
        result = read_pump(stream, &hub, &username, settings.pong_timeout) => {
            if let Err(e) = result {
                info!(user = %username, error = %e, "Read pump failed");
            }
            None
        }
        joined = &mut writer => {
            debug!(user = %username, "Writer finished, stopping reader");
            Some(joined)
        }
    };

    hub.unregister(username.clone(), connection).await;

    // Unregistering closed the queue, so the writer winds down by itself.
    let joined = match writer_result {
        Some(joined) => joined,
        None => writer.await,
    };
    if let Err(e) = joined {
        warn!(user = %username, error = %e, "Writer task panicked");
    }
    debug!(user = %username, connection = %connection, "Connection closed");
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Decode inbound frames and route them until the stream ends.
///
/// Returns `Ok(())` on a clean close or end of stream.
pub(crate) async fn read_pump<R, E>(
    mut stream: R,
    hub: &Hub,
    username: &Username,
    pong_timeout: Duration,
) -> Result<(), PumpError>
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = match timeout(pong_timeout, stream.next()).await {
            Err(_) => return Err(PumpError::ReadTimeout(pong_timeout)),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(PumpError::Transport(e.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };

        let decoded = match frame {
            Frame::Text(text) => ClientEnvelope::decode(text.as_str()),
            Frame::Binary(data) => ClientEnvelope::decode_bytes(&data),
            // Pings are answered by the transport; any frame refreshes the deadline.
            Frame::Ping(_) | Frame::Pong(_) => continue,
            Frame::Close(_) => {
                debug!(user = %username, "Peer closed the connection");
                return Ok(());
            }
        };

        match decoded {
            Ok(envelope) => handle_envelope(hub, username, envelope).await,
            Err(ProtocolError::UnknownKind(kind)) => {
                debug!(user = %username, kind = %kind, "Ignoring unknown envelope kind");
            }
            Err(e) => {
                warn!(user = %username, error = %e, "Skipping malformed envelope");
            }
        }
    }
}

async fn handle_envelope(hub: &Hub, username: &Username, envelope: ClientEnvelope) {
    match envelope {
        ClientEnvelope::Message(inbound) => {
            let to = match Username::parse(&inbound.to) {
                Ok(to) => to,
                Err(e) => {
                    warn!(user = %username, to = %inbound.to, error = %e, "Invalid message recipient");
                    return;
                }
            };
            let message = hub.route_message(username, &to, inbound.content).await;
            debug!(
                from = %username,
                to = %to,
                id = %message.id,
                temp_id = ?inbound.temp_id,
                status = ?message.status,
                "Message routed"
            );
        }
        ClientEnvelope::Typing(typing) => match Username::parse(&typing.to) {
            Ok(to) => hub.route_typing(username.clone(), to, typing.is_typing).await,
            Err(e) => {
                warn!(user = %username, to = %typing.to, error = %e, "Invalid typing recipient");
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Flush the outbound queue onto the sink and ping on a fixed period.
///
/// Returns `Ok(())` once the queue is closed and a close frame was sent.
pub(crate) async fn write_pump<W>(
    mut sink: W,
    mut queue: mpsc::Receiver<String>,
    settings: PumpSettings,
) -> Result<(), PumpError>
where
    W: Sink<Frame> + Unpin,
    W::Error: Display,
{
    let mut ticker = interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(first) = next else {
                    // Queue closed by the hub; best-effort close frame.
                    let _ = timeout(settings.write_timeout, sink.send(Frame::Close(None))).await;
                    return Ok(());
                };

                // Whatever is already queued goes out too, one frame each.
                let backlog = queue.len();
                let mut batch = Vec::with_capacity(backlog + 1);
                batch.push(first);
                for _ in 0..backlog {
                    match queue.try_recv() {
                        Ok(frame) => batch.push(frame),
                        Err(_) => break,
                    }
                }

                send_batch(&mut sink, batch, settings.write_timeout).await?;
            }
            _ = ticker.tick() => {
                send_with_deadline(&mut sink, Frame::Ping(Default::default()), settings.write_timeout)
                    .await?;
            }
        }
    }
}

async fn send_batch<W>(sink: &mut W, batch: Vec<String>, deadline: Duration) -> Result<(), PumpError>
where
    W: Sink<Frame> + Unpin,
    W::Error: Display,
{
    let write = async {
        for text in batch {
            sink.feed(Frame::Text(text.into())).await?;
        }
        sink.flush().await
    };

    match timeout(deadline, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PumpError::Transport(e.to_string())),
        Err(_) => Err(PumpError::WriteTimeout(deadline)),
    }
}

async fn send_with_deadline<W>(sink: &mut W, frame: Frame, deadline: Duration) -> Result<(), PumpError>
where
    W: Sink<Frame> + Unpin,
    W::Error: Display,
{
    match timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PumpError::Transport(e.to_string())),
        Err(_) => Err(PumpError::WriteTimeout(deadline)),
    }
}
