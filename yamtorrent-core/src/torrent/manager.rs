//! Download coordinator for a single torrent.
//!
//! One task owns the scheduler, the output file and the peer session
//! handles. Peer tasks report through one event channel and the periodic
//! tick drives (re)assignment, so only this loop ever mutates piece state.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;

use super::peer_session::{SessionConfig, spawn_peer_session};
use super::tracker::{AnnounceEvent, AnnounceRequest, TrackerClient};
use super::{
    PeerAddress, PeerCommand, PeerEvent, PeerId, PeerSessionHandle, PieceClaim, PieceIndex,
    PieceLayout, PieceScheduler, SchedulerCommand, SessionEvent, SessionEventKind, TorrentError,
    TorrentMetadata,
};
use crate::config::YamConfig;
use crate::storage::OutputFile;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created, `run` not called yet
    Idle,
    /// Preparing the output file
    Initial,
    /// Waiting for the tracker announce
    TrackerQuery,
    /// Peers spawned, no bitfield received yet
    Connecting,
    /// At least one peer announced its pieces
    Downloading,
    /// Every piece verified and written
    Seeding,
    /// Output finalized
    Done,
}

/// Result of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    /// Where the data ended up
    pub output_path: PathBuf,
    pub total_length: u64,
    pub num_pieces: u32,
    /// Peers returned by the tracker that a session was started for
    pub peers_contacted: usize,
    pub elapsed: Duration,
}

/// Drives one torrent from tracker announce to a finalized output file.
pub struct TorrentManager {
    metadata: Arc<TorrentMetadata>,
    tracker: Box<dyn TrackerClient>,
    config: YamConfig,
    output_dir: PathBuf,
    local_peer_id: PeerId,
    state: ManagerState,
}

/// Mutable state of a running download.
struct ActiveDownload {
    layout: PieceLayout,
    scheduler: PieceScheduler,
    sessions: HashMap<PeerAddress, PeerSessionHandle>,
    output: OutputFile,
    bytes_written: u64,
}

impl TorrentManager {
    /// Creates a manager in `ManagerState::Idle`.
    pub fn new(
        metadata: TorrentMetadata,
        tracker: Box<dyn TrackerClient>,
        config: YamConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            metadata: Arc::new(metadata),
            tracker,
            local_peer_id: PeerId::with_prefix(config.torrent.client_id),
            config,
            output_dir: output_dir.into(),
            state: ManagerState::Idle,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    /// Downloads the whole torrent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - If the output file could not be created or finalized
    /// - Any tracker error from the initial announce
    /// - `TorrentError::NoPeersAvailable` - If the tracker returned no peers
    ///   or every peer disconnected before completion
    pub async fn run(&mut self) -> Result<DownloadSummary, TorrentError> {
        let started = Instant::now();
        self.transition(ManagerState::Initial);

        let layout = self.metadata.layout()?;
        let output = OutputFile::create(
            &self.output_dir,
            self.metadata.output_name(),
            self.config.storage.in_progress_suffix,
            layout.total_length(),
        )
        .await?;

        self.transition(ManagerState::TrackerQuery);
        let peers = self.announce_started(layout.total_length()).await?;
        if peers.is_empty() {
            tracing::error!("Tracker {} returned no peers", self.tracker.tracker_url());
            return Err(TorrentError::NoPeersAvailable);
        }

        self.transition(ManagerState::Connecting);
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session_config = SessionConfig::from_config(&self.config);
        let sessions: HashMap<PeerAddress, PeerSessionHandle> = peers
            .iter()
            .map(|&address| {
                let handle = spawn_peer_session(
                    address,
                    Arc::clone(&self.metadata),
                    self.local_peer_id,
                    session_config,
                    events_tx.clone(),
                );
                (address, handle)
            })
            .collect();
        drop(events_tx);

        let peers_contacted = sessions.len();
        let mut download = ActiveDownload {
            scheduler: PieceScheduler::new(layout.num_pieces(), self.config.torrent.piece_timeout_ticks),
            layout,
            sessions,
            output,
            bytes_written: 0,
        };

        let mut ticker = tokio::time::interval(self.config.torrent.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else {
                        break Err(TorrentError::NoPeersAvailable);
                    };
                    self.handle_event(&mut download, event).await;
                }
                _ = ticker.tick() => {
                    let commands = download.scheduler.on_tick();
                    dispatch_commands(&mut download, commands);
                }
            }

            if download.scheduler.is_complete() {
                break Ok(());
            }
            if download.sessions.is_empty() {
                tracing::error!(
                    "All peers disconnected with {}/{} pieces verified",
                    download.scheduler.bitfield().count_set(),
                    download.layout.num_pieces()
                );
                break Err(TorrentError::NoPeersAvailable);
            }
        };

        // Closing the event channel first lets blocked peer tasks exit
        drop(events_rx);
        let ActiveDownload {
            sessions,
            output,
            bytes_written,
            layout,
            ..
        } = download;
        join_all(sessions.into_values().map(PeerSessionHandle::shutdown)).await;
        outcome?;

        self.transition(ManagerState::Seeding);
        let output_path = output.finalize().await?;
        self.announce_completed().await;
        self.transition(ManagerState::Done);

        tracing::info!(
            "Download of {} complete: {} bytes in {:.1?}",
            output_path.display(),
            bytes_written,
            started.elapsed()
        );

        Ok(DownloadSummary {
            output_path,
            total_length: layout.total_length(),
            num_pieces: layout.num_pieces(),
            peers_contacted,
            elapsed: started.elapsed(),
        })
    }

    fn transition(&mut self, next: ManagerState) {
        tracing::debug!("Manager state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn announce_request(&self, event: AnnounceEvent, downloaded: u64, left: u64) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.metadata.info_hash,
            peer_id: *self.local_peer_id.as_bytes(),
            port: self.config.torrent.listen_port,
            uploaded: 0,
            downloaded,
            left,
            event,
        }
    }

    /// Announces `Started` and returns the deduplicated, capped peer list.
    async fn announce_started(&self, total_length: u64) -> Result<Vec<PeerAddress>, TorrentError> {
        let request = self.announce_request(AnnounceEvent::Started, 0, total_length);
        let response = self.tracker.announce(request).await.inspect_err(|e| {
            tracing::error!("Announce to {} failed: {e}", self.tracker.tracker_url());
        })?;

        let mut seen = HashSet::new();
        let peers: Vec<PeerAddress> = response
            .peers
            .into_iter()
            .filter(|peer| seen.insert(*peer))
            .take(self.config.network.max_peer_connections)
            .collect();

        tracing::info!(
            "Tracker {} returned {} peers ({} seeders, {} leechers)",
            self.tracker.tracker_url(),
            peers.len(),
            response.complete,
            response.incomplete
        );
        Ok(peers)
    }

    /// Best effort; a failure only logs.
    async fn announce_completed(&self) {
        let request =
            self.announce_request(AnnounceEvent::Completed, self.metadata.total_length, 0);
        if let Err(e) = self.tracker.announce(request).await {
            tracing::warn!(
                "Completed announce to {} failed: {e}",
                self.tracker.tracker_url()
            );
        }
    }

    async fn handle_event(&mut self, download: &mut ActiveDownload, event: SessionEvent) {
        let SessionEvent { address, kind } = event;

        match kind {
            SessionEventKind::Peer(PeerEvent::HandshakeCompleted { peer_id }) => {
                tracing::debug!("Peer {address}: handshake complete ({peer_id:?})");
                download.scheduler.on_peer_connected(address);
            }
            SessionEventKind::Peer(PeerEvent::BitfieldReady(bitfield)) => {
                download.scheduler.on_peer_bitfield(address, bitfield);
                if self.state == ManagerState::Connecting {
                    tracing::info!("First peer bitfield from {address}, downloading");
                    self.transition(ManagerState::Downloading);
                }
            }
            SessionEventKind::Peer(PeerEvent::InvalidBitfield) => {
                tracing::warn!("Peer {address}: invalid bitfield, dropping peer");
                download.scheduler.on_peer_disconnected(address);
                send_command(download, address, PeerCommand::Shutdown);
            }
            SessionEventKind::Peer(PeerEvent::Have(piece)) => {
                download.scheduler.on_peer_have(address, piece);
            }
            SessionEventKind::Peer(PeerEvent::ChokeChanged { choking }) => {
                tracing::debug!("Peer {address}: choking = {choking}");
                download.scheduler.on_peer_choke_changed(address, choking);
            }
            SessionEventKind::Peer(PeerEvent::PieceDownloaded { piece, data }) => {
                store_piece(download, address, piece, &data).await;
            }
            SessionEventKind::Peer(PeerEvent::PieceFailed { piece, error }) => {
                tracing::warn!("Peer {address}: piece {piece} failed: {error}");
                download.scheduler.on_piece_error(address, piece, &error);
            }
            SessionEventKind::DownloadRefused { piece } => {
                let error = TorrentError::PeerChoking { index: piece };
                download.scheduler.on_piece_error(address, piece, &error);
            }
            SessionEventKind::Disconnected { reason } => {
                download.sessions.remove(&address);
                if let Some(piece) = download.scheduler.on_peer_disconnected(address) {
                    tracing::warn!("Peer {address} lost with piece {piece} in flight: {reason}");
                } else {
                    tracing::debug!("Peer {address} disconnected: {reason}");
                }
            }
        }
    }
}

/// Writes a verified piece and marks it owned, or returns it to the desire
/// set when the write fails.
async fn store_piece(
    download: &mut ActiveDownload,
    address: PeerAddress,
    piece: PieceIndex,
    data: &[u8],
) {
    let cancel_peer = match download.scheduler.on_piece_downloaded(address, piece) {
        PieceClaim::AlreadyOwned => {
            tracing::debug!("Peer {address}: piece {piece} already owned, dropping");
            return;
        }
        PieceClaim::Store { cancel_peer } => cancel_peer,
    };

    if let Some(other) = cancel_peer {
        send_command(download, other, PeerCommand::Cancel);
    }

    let offset = download.layout.piece_offset(piece);
    if let Err(e) = download.output.write_piece(offset, data).await {
        tracing::warn!("Failed to write piece {piece}: {e}");
        download.scheduler.release_piece(piece);
        return;
    }

    download.bytes_written += data.len() as u64;
    download.scheduler.mark_piece_owned(piece);

    let verified = download.scheduler.bitfield().count_set();
    let total = download.layout.num_pieces();
    tracing::info!(
        "piece {verified}/{total} verified, {:.0}%",
        verified as f64 * 100.0 / f64::from(total)
    );
}

fn dispatch_commands(download: &mut ActiveDownload, commands: Vec<SchedulerCommand>) {
    for command in commands {
        match command {
            SchedulerCommand::Start { peer, piece, tick } => {
                if !download.sessions.contains_key(&peer) {
                    let error = TorrentError::PeerConnectionError {
                        reason: format!("no session for {peer}"),
                    };
                    download.scheduler.on_piece_error(peer, piece, &error);
                    continue;
                }
                send_command(download, peer, PeerCommand::StartDownload { piece, tick });
            }
            SchedulerCommand::Cancel { peer, piece } => {
                tracing::debug!("Peer {peer}: piece {piece} timed out, cancelling");
                send_command(download, peer, PeerCommand::Cancel);
            }
        }
    }
}

/// Queues `command` for `peer` without blocking the coordinator.
///
/// A peer whose command queue is full is not draining it and is dropped:
/// its task is aborted and its in-flight piece returns to the desire set.
fn send_command(download: &mut ActiveDownload, peer: PeerAddress, command: PeerCommand) {
    let Some(handle) = download.sessions.get(&peer) else {
        return;
    };

    match handle.try_send(command) {
        Ok(()) => {}
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("Peer {peer}: command dropped, task has ended");
        }
        Err(TrySendError::Full(_)) => {
            tracing::warn!("Peer {peer}: command queue full, dropping peer");
            if let Some(handle) = download.sessions.remove(&peer) {
                handle.abort();
            }
            download.scheduler.on_peer_disconnected(peer);
        }
    }
}
