//! Piece scheduling: which peer downloads which piece, and when to give up.
//!
//! Every piece index is in exactly one of three places: the desire set
//! (wanted, unassigned), the request map (assigned to a peer or being
//! written), or the local bitfield (verified and on disk). All mutation
//! happens through the methods below, called from the single task that
//! owns the scheduler.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::{Bitfield, PeerAddress, PieceIndex, TorrentError};

/// Instruction for a peer task produced by a scheduling tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Begin downloading `piece` from `peer`
    Start {
        peer: PeerAddress,
        piece: PieceIndex,
        tick: u64,
    },
    /// Abandon the download `peer` is running for `piece`
    Cancel { peer: PeerAddress, piece: PieceIndex },
}

/// Outcome of a verified piece arriving from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceClaim {
    /// Write the piece, then call `mark_piece_owned` (or `release_piece` on
    /// failure). `cancel_peer` is another peer still assigned the same piece.
    Store { cancel_peer: Option<PeerAddress> },
    /// The piece is already on disk; drop the data
    AlreadyOwned,
}

#[derive(Debug, Clone, Copy)]
struct Assignment {
    peer: PeerAddress,
    started_at: u64,
}

#[derive(Debug, Default)]
struct PeerView {
    bitfield: Option<Bitfield>,
    peer_choking: bool,
    assigned: Option<PieceIndex>,
    failed_pieces: HashSet<PieceIndex>,
}

/// Global piece desire, assignment and completion state for one torrent.
#[derive(Debug)]
pub struct PieceScheduler {
    bitfield: Bitfield,
    desired: BTreeSet<PieceIndex>,
    requests: HashMap<PieceIndex, Assignment>,
    peers: BTreeMap<PeerAddress, PeerView>,
    tick: u64,
    timeout_ticks: u64,
}

impl PieceScheduler {
    /// Creates a scheduler wanting every piece in `0..num_pieces`.
    ///
    /// An assignment older than `timeout_ticks` ticks is cancelled.
    pub fn new(num_pieces: u32, timeout_ticks: u64) -> Self {
        Self {
            bitfield: Bitfield::new(num_pieces as usize),
            desired: (0..num_pieces).map(PieceIndex::new).collect(),
            requests: HashMap::new(),
            peers: BTreeMap::new(),
            tick: 0,
            timeout_ticks,
        }
    }

    /// Registers a peer whose handshake completed. It is schedulable once
    /// its bitfield arrives and it unchokes us.
    pub fn on_peer_connected(&mut self, peer: PeerAddress) {
        self.peers.entry(peer).or_insert_with(|| PeerView {
            peer_choking: true,
            ..PeerView::default()
        });
    }

    /// Installs the availability a peer announced.
    pub fn on_peer_bitfield(&mut self, peer: PeerAddress, bitfield: Bitfield) {
        self.on_peer_connected(peer);
        if let Some(view) = self.peers.get_mut(&peer) {
            view.bitfield = Some(bitfield);
        }
    }

    /// Records a single newly announced piece.
    pub fn on_peer_have(&mut self, peer: PeerAddress, piece: PieceIndex) {
        if let Some(bitfield) = self
            .peers
            .get_mut(&peer)
            .and_then(|view| view.bitfield.as_mut())
        {
            bitfield.set(piece);
        }
    }

    /// Tracks whether `peer` is choking us; consulted before every start.
    pub fn on_peer_choke_changed(&mut self, peer: PeerAddress, choking: bool) {
        if let Some(view) = self.peers.get_mut(&peer) {
            view.peer_choking = choking;
        }
    }

    /// Forgets a peer and returns its in-flight piece to the desire set.
    pub fn on_peer_disconnected(&mut self, peer: PeerAddress) -> Option<PieceIndex> {
        let view = self.peers.remove(&peer)?;
        let piece = view.assigned?;
        self.release_assignment(peer, piece);
        Some(piece)
    }

    /// Advances the clock, cancels stalled assignments and hands desired
    /// pieces to idle, unchoking peers.
    pub fn on_tick(&mut self) -> Vec<SchedulerCommand> {
        self.tick += 1;
        let mut commands = Vec::new();

        let expired: Vec<(PieceIndex, PeerAddress)> = self
            .requests
            .iter()
            .filter(|(_, assignment)| self.tick - assignment.started_at > self.timeout_ticks)
            .map(|(piece, assignment)| (*piece, assignment.peer))
            .collect();

        let mut timed_out_peers = HashSet::new();
        for (piece, peer) in expired {
            tracing::debug!("Piece {piece} timed out on peer {peer}, reassigning");
            self.release_assignment(peer, piece);
            timed_out_peers.insert(peer);
            commands.push(SchedulerCommand::Cancel { peer, piece });
        }

        for (peer, view) in &mut self.peers {
            if view.assigned.is_some() || view.peer_choking || timed_out_peers.contains(peer) {
                continue;
            }
            let Some(bitfield) = view.bitfield.as_ref() else {
                continue;
            };

            let candidate = self
                .desired
                .iter()
                .copied()
                .find(|piece| bitfield.has(*piece) && !view.failed_pieces.contains(piece));

            if let Some(piece) = candidate {
                self.desired.remove(&piece);
                self.requests.insert(
                    piece,
                    Assignment {
                        peer: *peer,
                        started_at: self.tick,
                    },
                );
                view.assigned = Some(piece);
                commands.push(SchedulerCommand::Start {
                    peer: *peer,
                    piece,
                    tick: self.tick,
                });
            }
        }

        commands
    }

    /// Claims a verified piece for writing.
    ///
    /// A late delivery for a piece that timed out is still accepted; any
    /// peer it was reassigned to is returned for cancellation.
    pub fn on_piece_downloaded(&mut self, peer: PeerAddress, piece: PieceIndex) -> PieceClaim {
        if let Some(view) = self.peers.get_mut(&peer)
            && view.assigned == Some(piece)
        {
            view.assigned = None;
        }

        if self.bitfield.has(piece) {
            return PieceClaim::AlreadyOwned;
        }

        let mut cancel_peer = None;
        if let Some(assignment) = self.requests.get(&piece)
            && assignment.peer != peer
        {
            cancel_peer = Some(assignment.peer);
            if let Some(view) = self.peers.get_mut(&assignment.peer)
                && view.assigned == Some(piece)
            {
                view.assigned = None;
            }
        }

        self.desired.remove(&piece);
        self.requests.insert(
            piece,
            Assignment {
                peer,
                started_at: self.tick,
            },
        );

        PieceClaim::Store { cancel_peer }
    }

    /// Marks a written piece as owned. Returns true when every piece is owned.
    pub fn mark_piece_owned(&mut self, piece: PieceIndex) -> bool {
        self.requests.remove(&piece);
        self.desired.remove(&piece);
        self.bitfield.set(piece);
        self.bitfield.is_complete()
    }

    /// Returns a claimed piece to the desire set after a failed write.
    pub fn release_piece(&mut self, piece: PieceIndex) {
        self.requests.remove(&piece);
        if !self.bitfield.has(piece) {
            self.desired.insert(piece);
        }
    }

    /// Handles a failed or refused download from `peer`.
    ///
    /// The piece goes back into the desire set. After a hash mismatch it is
    /// never assigned to the same peer again.
    pub fn on_piece_error(&mut self, peer: PeerAddress, piece: PieceIndex, error: &TorrentError) {
        tracing::debug!("Piece {piece} failed on peer {peer}: {error}");

        match error {
            TorrentError::PieceHashMismatch { .. } => {
                if let Some(view) = self.peers.get_mut(&peer) {
                    view.failed_pieces.insert(piece);
                }
            }
            TorrentError::PeerChoking { .. } => self.on_peer_choke_changed(peer, true),
            _ => {}
        }

        self.release_assignment(peer, piece);
    }

    fn release_assignment(&mut self, peer: PeerAddress, piece: PieceIndex) {
        if let Some(view) = self.peers.get_mut(&peer)
            && view.assigned == Some(piece)
        {
            view.assigned = None;
        }

        if self
            .requests
            .get(&piece)
            .is_some_and(|assignment| assignment.peer == peer)
        {
            self.requests.remove(&piece);
            if !self.bitfield.has(piece) {
                self.desired.insert(piece);
            }
        }
    }

    /// Local completion bitfield.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.is_complete()
    }

    /// Desired pieces in ascending order.
    pub fn desired_pieces(&self) -> Vec<PieceIndex> {
        self.desired.iter().copied().collect()
    }

    /// Number of pieces currently assigned or being written.
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Piece currently assigned to `peer`.
    pub fn assignment_of(&self, peer: PeerAddress) -> Option<PieceIndex> {
        self.peers.get(&peer).and_then(|view| view.assigned)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Checks that desire, requests and bitfield partition `0..num_pieces`.
    pub fn check_invariant(&self) -> bool {
        (0..self.bitfield.len() as u32).map(PieceIndex::new).all(|piece| {
            let places = [
                self.desired.contains(&piece),
                self.requests.contains_key(&piece),
                self.bitfield.has(piece),
            ];
            places.iter().filter(|present| **present).count() == 1
        }) && self
            .desired
            .iter()
            .chain(self.requests.keys())
            .all(|piece| piece.as_usize() < self.bitfield.len())
    }
}
