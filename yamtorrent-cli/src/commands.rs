//! Download command implementation

use std::path::{Path, PathBuf};

use anyhow::Context;
use yamtorrent_core::torrent::{BencodeTorrentParser, TorrentParser, tracker_for_url};
use yamtorrent_core::{TorrentManager, YamConfig, YamError};

use crate::Cli;

/// Runs a full download for the torrent named on the command line.
///
/// # Errors
/// - No torrent file given and none (or several) found in the current directory
/// - Torrent parsing, tracker or download failures from the core
pub async fn download(cli: Cli) -> anyhow::Result<()> {
    let torrent_path = match cli.torrent {
        Some(path) => path,
        None => find_single_torrent(Path::new(".")).map_err(report)?,
    };

    let mut config = YamConfig::from_env();
    if let Some(port) = cli.port {
        config.torrent.listen_port = port;
    }

    let parser = BencodeTorrentParser::new();
    let metadata = parser
        .parse_torrent_file(&torrent_path)
        .await
        .map_err(|e| report(e.into()))
        .with_context(|| format!("loading {}", torrent_path.display()))?;

    tracing::info!(
        "Loaded {} ({} bytes, {} pieces, info hash {})",
        metadata.name,
        metadata.total_length,
        metadata.num_pieces(),
        metadata.info_hash
    );

    let announce = metadata
        .announce()
        .ok_or_else(|| {
            report(YamError::Configuration {
                reason: "torrent has no announce URL".to_string(),
            })
        })?
        .to_string();
    let tracker = tracker_for_url(&announce, &config.network).map_err(|e| report(e.into()))?;

    let mut manager = TorrentManager::new(metadata, tracker, config, cli.output_dir);
    let summary = manager.run().await.map_err(|e| report(e.into()))?;

    tracing::info!(
        "Saved {} ({} pieces from {} peers) in {:.1?}",
        summary.output_path.display(),
        summary.num_pieces,
        summary.peers_contacted,
        summary.elapsed
    );
    Ok(())
}

/// Logs the error and converts it into a user-facing report.
fn report(error: YamError) -> anyhow::Error {
    tracing::error!("{error}");
    anyhow::anyhow!(error.user_message())
}

/// Returns the only `*.torrent` file in `dir`.
fn find_single_torrent(dir: &Path) -> Result<PathBuf, YamError> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "torrent") {
            found.push(path);
        }
    }

    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(YamError::Configuration {
            reason: format!("no .torrent file in {}", dir.display()),
        }),
        n => Err(YamError::Configuration {
            reason: format!("{n} .torrent files in {}, name one explicitly", dir.display()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_single_torrent() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();
        assert!(find_single_torrent(temp_dir.path()).is_err());

        std::fs::write(temp_dir.path().join("a.torrent"), b"d").unwrap();
        assert_eq!(
            find_single_torrent(temp_dir.path()).unwrap(),
            temp_dir.path().join("a.torrent")
        );

        std::fs::write(temp_dir.path().join("b.torrent"), b"d").unwrap();
        let error = find_single_torrent(temp_dir.path()).unwrap_err();
        assert!(error.is_user_error());
    }
}
