//! Centralized configuration for YamTorrent.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all YamTorrent components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct YamConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// BitTorrent protocol-specific configuration.
///
/// Controls piece scheduling cadence, timeouts, and protocol parameters.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// BitTorrent client identifier placed at the start of the peer id
    pub client_id: &'static [u8; 8],
    /// Block request size in bytes
    pub block_size: u32,
    /// Interval between scheduling ticks
    pub tick_interval: Duration,
    /// Ticks an assignment may run before it is cancelled and reassigned
    pub piece_timeout_ticks: u64,
    /// Port reported to the tracker
    pub listen_port: u16,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: crate::torrent::protocol::CLIENT_PREFIX,
            block_size: crate::torrent::BLOCK_SIZE,
            tick_interval: Duration::from_secs(1),
            piece_timeout_ticks: 30,
            listen_port: 6881,
        }
    }
}

/// Network communication and tracker configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Timeout for one tracker announce exchange
    pub tracker_timeout: Duration,
    /// Timeout for opening a peer TCP connection
    pub connect_timeout: Duration,
    /// A peer that sends nothing for this long is dropped
    pub peer_idle_timeout: Duration,
    /// Interval between keep-alives sent to each peer
    pub keep_alive_interval: Duration,
    /// Maximum concurrent peer connections
    pub max_peer_connections: usize,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            peer_idle_timeout: Duration::from_secs(120),
            keep_alive_interval: Duration::from_secs(60),
            max_peer_connections: 30,
            user_agent: "yamtorrent/0.1.0",
        }
    }
}

/// Output file configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Suffix carried by the output file until the download completes
    pub in_progress_suffix: &'static str,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            in_progress_suffix: ".part",
        }
    }
}

impl YamConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse_u64 = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());

        if let Some(millis) = parse_u64("YAM_TICK_MS").filter(|millis| *millis > 0) {
            self.torrent.tick_interval = Duration::from_millis(millis);
        }

        if let Some(ticks) = parse_u64("YAM_PIECE_TIMEOUT_TICKS") {
            self.torrent.piece_timeout_ticks = ticks;
        }

        if let Some(port) = parse_u64("YAM_PORT").and_then(|port| u16::try_from(port).ok()) {
            self.torrent.listen_port = port;
        }

        if let Some(seconds) = parse_u64("YAM_TRACKER_TIMEOUT") {
            self.network.tracker_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = parse_u64("YAM_PEER_IDLE_TIMEOUT").filter(|seconds| *seconds > 0) {
            self.network.peer_idle_timeout = Duration::from_secs(seconds);
        }

        if let Some(count) = parse_u64("YAM_MAX_PEERS").filter(|count| *count > 0) {
            self.network.max_peer_connections = count as usize;
        }
    }
}
