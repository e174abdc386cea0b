//! YamTorrent Core - BitTorrent peer wire protocol and piece scheduling
//!
//! This crate provides the download engine behind the `yamtorrent` binary:
//! torrent metadata parsing, tracker announces, per-peer wire protocol state
//! machines, the piece scheduler and the output file.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

pub use config::YamConfig;
pub use storage::{OutputFile, StorageError};
pub use torrent::{DownloadSummary, TorrentError, TorrentManager};

/// Errors that can bubble up from any YamTorrent subsystem.
#[derive(Debug, thiserror::Error)]
pub enum YamError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl YamError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            YamError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TrackerConnectionFailed { url }
                | TorrentError::TrackerTimeout { url } => {
                    format!("Could not reach tracker: {url}")
                }
                TorrentError::TrackerFailure { reason } => {
                    format!("Tracker refused the torrent: {reason}")
                }
                TorrentError::UnsupportedTracker { url } => {
                    format!("Unsupported tracker: {url}")
                }
                TorrentError::NoPeersAvailable => "No peers available for download".to_string(),
                TorrentError::Storage(_) => "Could not write the output file".to_string(),
                _ => "Download error occurred".to_string(),
            },
            YamError::Storage(_) => "Could not write the output file".to_string(),
            YamError::Configuration { reason } => format!("Configuration error: {reason}"),
            YamError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            YamError::Configuration { .. }
                | YamError::Torrent(TorrentError::InvalidTorrentFile { .. })
                | YamError::Torrent(TorrentError::UnsupportedTracker { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, YamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let error = YamError::from(TorrentError::NoPeersAvailable);
        assert_eq!(error.user_message(), "No peers available for download");
        assert!(!error.is_user_error());

        let error = YamError::from(TorrentError::InvalidTorrentFile {
            reason: "missing info".to_string(),
        });
        assert_eq!(error.user_message(), "Invalid torrent file: missing info");
        assert!(error.is_user_error());

        let error = YamError::Configuration {
            reason: "no torrent file".to_string(),
        };
        assert!(error.is_user_error());
    }
}
