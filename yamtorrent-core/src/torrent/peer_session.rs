//! Socket task driving one `PeerConnection`.
//!
//! Each peer runs in its own tokio task. The task owns the socket and the
//! connection state machine; the coordinator talks to it only through a
//! command channel and receives `SessionEvent`s on a shared event channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{PeerAddress, PeerConnection, PeerEvent, PeerId, PieceIndex, TorrentError, TorrentMetadata};
use crate::config::YamConfig;

const READ_BUFFER_SIZE: usize = 32 * 1024;
const COMMAND_CHANNEL_CAPACITY: usize = 16;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Per-session limits taken from `YamConfig`.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// Longest silence from the peer, and longest stalled write
    pub idle_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub block_size: u32,
}

impl SessionConfig {
    pub fn from_config(config: &YamConfig) -> Self {
        Self {
            connect_timeout: config.network.connect_timeout,
            idle_timeout: config.network.peer_idle_timeout,
            keep_alive_interval: config.network.keep_alive_interval,
            block_size: config.torrent.block_size,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&YamConfig::default())
    }
}

/// Instructions from the coordinator to a peer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Begin fetching a piece
    StartDownload { piece: PieceIndex, tick: u64 },
    /// Abandon the in-flight piece
    Cancel,
    /// Close the socket and end the task
    Shutdown,
}

/// Event emitted by a peer task.
#[derive(Debug)]
pub struct SessionEvent {
    pub address: PeerAddress,
    pub kind: SessionEventKind,
}

#[derive(Debug)]
pub enum SessionEventKind {
    /// Forwarded from the connection state machine
    Peer(PeerEvent),
    /// A start command arrived while the peer was choking us
    DownloadRefused { piece: PieceIndex },
    /// The task ended; no further events follow
    Disconnected { reason: String },
}

/// Coordinator-side handle to a running peer task.
#[derive(Debug)]
pub struct PeerSessionHandle {
    address: PeerAddress,
    commands: mpsc::Sender<PeerCommand>,
    task: JoinHandle<()>,
}

impl PeerSessionHandle {
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// Queues a command without waiting.
    ///
    /// # Errors
    /// - `TrySendError::Full` - The task is not draining its commands
    /// - `TrySendError::Closed` - The task has ended and reported `Disconnected`
    pub fn try_send(&self, command: PeerCommand) -> Result<(), TrySendError<PeerCommand>> {
        self.commands.try_send(command)
    }

    /// Stops the task without waiting.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Asks the task to stop and waits briefly for it before aborting.
    pub async fn shutdown(mut self) {
        if self.commands.try_send(PeerCommand::Shutdown).is_ok()
            && let Ok(joined) = tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await
        {
            if let Err(e) = joined {
                tracing::warn!("Peer {}: task ended abnormally: {e}", self.address);
            }
            return;
        }

        self.task.abort();
        if let Err(e) = self.task.await
            && !e.is_cancelled()
        {
            tracing::warn!("Peer {}: task ended abnormally: {e}", self.address);
        }
    }

    /// Handle wired to a caller-held command receiver and an idle task.
    #[cfg(test)]
    pub(crate) fn detached(address: PeerAddress, capacity: usize) -> (Self, mpsc::Receiver<PeerCommand>) {
        let (commands, receiver) = mpsc::channel(capacity);
        let task = tokio::spawn(std::future::pending::<()>());
        (
            Self {
                address,
                commands,
                task,
            },
            receiver,
        )
    }
}

/// Opens a TCP connection to a peer within `timeout`.
///
/// # Errors
/// - `TorrentError::PeerConnectionError` - Connect failed or timed out
pub async fn connect_peer(address: PeerAddress, timeout: Duration) -> Result<TcpStream, TorrentError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TorrentError::PeerConnectionError {
            reason: format!("connect to {address} failed: {e}"),
        }),
        Err(_) => Err(TorrentError::PeerConnectionError {
            reason: format!("connect to {address} timed out after {timeout:?}"),
        }),
    }
}

/// Spawns a task that connects to `address` and runs the peer session.
///
/// The task always finishes by emitting `SessionEventKind::Disconnected`.
pub fn spawn_peer_session(
    address: PeerAddress,
    metadata: Arc<TorrentMetadata>,
    local_peer_id: PeerId,
    session_config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
) -> PeerSessionHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

    let task = tokio::spawn(async move {
        let result = async {
            let connection = PeerConnection::new(address, metadata, local_peer_id)?
                .with_block_size(session_config.block_size);
            let stream = connect_peer(address, session_config.connect_timeout).await?;
            tracing::debug!("Peer {address}: connected");
            run_peer_session(stream, connection, command_rx, events.clone(), session_config).await
        }
        .await;

        let reason = match result {
            Ok(()) => "session closed".to_string(),
            Err(e) => e.to_string(),
        };
        tracing::debug!("Peer {address}: disconnected ({reason})");
        let _ = events
            .send(SessionEvent {
                address,
                kind: SessionEventKind::Disconnected { reason },
            })
            .await;
    });

    PeerSessionHandle {
        address,
        commands: command_tx,
        task,
    }
}

/// Drives `connection` over an already open stream until the peer closes
/// it, goes silent for `idle_timeout`, a fatal protocol error occurs, or
/// `Shutdown` is received. A keep-alive goes out every
/// `keep_alive_interval`.
///
/// # Errors
/// - `TorrentError::HandshakeRejected` - Remote handshake did not match
/// - `TorrentError::ProtocolError` - Malformed frame from the peer
/// - `TorrentError::PeerConnectionError` - Peer closed the stream, sent
///   nothing within the idle timeout, or stopped accepting writes
/// - `TorrentError::Io` - Socket read or write failed
pub async fn run_peer_session<S>(
    mut stream: S,
    mut connection: PeerConnection,
    mut commands: mpsc::Receiver<PeerCommand>,
    events: mpsc::Sender<SessionEvent>,
    session_config: SessionConfig,
) -> Result<(), TorrentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address = connection.address();
    let idle_timeout = session_config.idle_timeout;
    connection.on_connected();
    flush_outgoing(&mut stream, &mut connection, idle_timeout).await?;

    let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);
    let keep_alive_every = session_config.keep_alive_interval;
    let mut keep_alive =
        tokio::time::interval_at(Instant::now() + keep_alive_every, keep_alive_every);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            read = stream.read_buf(&mut read_buf) => {
                if read? == 0 {
                    return Err(TorrentError::PeerConnectionError {
                        reason: format!("{address} closed the connection"),
                    });
                }
                idle.as_mut().reset(Instant::now() + idle_timeout);

                let peer_events = connection.receive(&read_buf)?;
                read_buf.clear();
                flush_outgoing(&mut stream, &mut connection, idle_timeout).await?;

                for event in peer_events {
                    let event = SessionEvent { address, kind: SessionEventKind::Peer(event) };
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(PeerCommand::StartDownload { piece, tick }) => {
                        if !connection.start_piece_download(piece, tick) {
                            let event = SessionEvent {
                                address,
                                kind: SessionEventKind::DownloadRefused { piece },
                            };
                            if events.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(PeerCommand::Cancel) => connection.cancel_current_download(),
                    Some(PeerCommand::Shutdown) | None => return Ok(()),
                }
                flush_outgoing(&mut stream, &mut connection, idle_timeout).await?;
            }
            _ = keep_alive.tick() => {
                connection.queue_keep_alive();
                flush_outgoing(&mut stream, &mut connection, idle_timeout).await?;
            }
            () = &mut idle => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("{address} sent nothing for {idle_timeout:?}"),
                });
            }
        }
    }
}

/// Writes queued bytes; a peer that accepts nothing for `limit` is an error.
async fn flush_outgoing<S>(
    stream: &mut S,
    connection: &mut PeerConnection,
    limit: Duration,
) -> Result<(), TorrentError>
where
    S: AsyncWrite + Unpin,
{
    if !connection.has_outgoing() {
        return Ok(());
    }

    let bytes = connection.take_outgoing();
    let write = async {
        stream.write_all(&bytes).await?;
        stream.flush().await
    };
    match tokio::time::timeout(limit, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TorrentError::PeerConnectionError {
            reason: format!("{} stopped reading for {limit:?}", connection.address()),
        }),
    }
}
