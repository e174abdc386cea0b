//! HTTP tracker client with URL building and response parsing

use async_trait::async_trait;

use super::types::{
    AnnounceRequest, AnnounceResponse, TrackerClient, parse_compact_peers,
};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// HTTP tracker client
pub struct HttpTrackerClient {
    pub(super) announce_url: String,
    pub(super) client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates HTTP tracker client using network timeout and user agent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Http` - If the HTTP client could not be built
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            client,
        })
    }

    /// Build announce URL with query parameters
    pub(super) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        // Binary parameters are encoded by hand so they are not re-encoded as UTF-8
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&event={}",
            Self::url_encode_bytes(request.info_hash.as_bytes()),
            Self::url_encode_bytes(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.event.as_query_value()
        );

        let separator = if self.announce_url.contains('?') { '&' } else { '?' };
        format!("{}{separator}{query}", self.announce_url)
    }

    /// Percent-encodes every byte.
    pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
        bytes.iter().map(|&b| format!("%{b:02X}")).collect()
    }

    /// Parse tracker response from bencode data
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerFailure` - If the response carries a `failure reason`
    /// - `TorrentError::MalformedTrackerResponse` - If decoding failed or `interval` is missing
    pub(super) fn parse_announce_response(
        response_bytes: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let parsed = bencode_rs::Value::parse(response_bytes).map_err(|e| {
            TorrentError::MalformedTrackerResponse {
                reason: format!("bencode decoding failed: {e:?}"),
            }
        })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::MalformedTrackerResponse {
                reason: "response is not a dictionary".to_string(),
            });
        };

        if let Some(bencode_rs::Value::Bytes(failure_reason)) =
            dict.get(b"failure reason".as_slice())
        {
            return Err(TorrentError::TrackerFailure {
                reason: String::from_utf8_lossy(failure_reason).to_string(),
            });
        }

        let integer = |key: &[u8]| match dict.get(key) {
            Some(bencode_rs::Value::Integer(val)) => u32::try_from(*val).ok(),
            _ => None,
        };

        let interval =
            integer(b"interval".as_slice()).ok_or_else(|| TorrentError::MalformedTrackerResponse {
                reason: "missing interval".to_string(),
            })?;

        let tracker_id = match dict.get(b"tracker id".as_slice()) {
            Some(bencode_rs::Value::Bytes(id_bytes)) => {
                Some(String::from_utf8_lossy(id_bytes).to_string())
            }
            _ => None,
        };

        let peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(peer_data)) => parse_compact_peers(peer_data)?,
            Some(bencode_rs::Value::List(entries)) => Self::parse_dictionary_peers(entries),
            _ => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval,
            min_interval: integer(b"min interval".as_slice()),
            tracker_id,
            complete: integer(b"complete".as_slice()).unwrap_or(0),
            incomplete: integer(b"incomplete".as_slice()).unwrap_or(0),
            peers,
        })
    }

    /// Non-compact peer list; entries without a parseable `ip`/`port` are skipped.
    fn parse_dictionary_peers(entries: &[bencode_rs::Value]) -> Vec<crate::torrent::PeerAddress> {
        entries
            .iter()
            .filter_map(|entry| {
                let bencode_rs::Value::Dictionary(peer) = entry else {
                    return None;
                };
                let ip = match peer.get(b"ip".as_slice()) {
                    Some(bencode_rs::Value::Bytes(ip)) => {
                        std::str::from_utf8(ip).ok()?.parse::<std::net::IpAddr>().ok()?
                    }
                    _ => return None,
                };
                let port = match peer.get(b"port".as_slice()) {
                    Some(bencode_rs::Value::Integer(port)) => u16::try_from(*port).ok()?,
                    _ => return None,
                };
                Some(crate::torrent::PeerAddress::new(ip, port))
            })
            .collect()
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(&request);
        tracing::debug!("Announcing to tracker: {}", self.announce_url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", self.announce_url, e);
            if e.is_timeout() {
                TorrentError::TrackerTimeout {
                    url: self.announce_url.clone(),
                }
            } else {
                TorrentError::TrackerConnectionFailed {
                    url: self.announce_url.clone(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                "Tracker {} returned error status: {}",
                self.announce_url,
                status
            );
            return Err(match status.as_u16() {
                500..=599 => TorrentError::TrackerServerError {
                    url: self.announce_url.clone(),
                    status: status.as_u16(),
                },
                _ => TorrentError::TrackerConnectionFailed {
                    url: self.announce_url.clone(),
                },
            });
        }

        let response_bytes = response.bytes().await.map_err(|e| {
            tracing::warn!(
                "Failed to read response body from {}: {}",
                self.announce_url,
                e
            );
            TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            }
        })?;

        let announce = Self::parse_announce_response(&response_bytes).inspect_err(|e| {
            tracing::warn!("Failed to parse response from {}: {}", self.announce_url, e);
        })?;

        tracing::debug!(
            "Announced to {}, received {} peers",
            self.announce_url,
            announce.peers.len()
        );
        Ok(announce)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}
