//! UDP tracker client (BEP 15).
//!
//! Every announce performs a fresh connect exchange followed by the
//! announce exchange. Each request is retried with a doubling timeout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient, parse_compact_peers};
use crate::config::NetworkConfig;
use crate::torrent::{PeerAddress, TorrentError};

const PROTOCOL_ID: u64 = 0x0417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const MAX_RETRIES: u32 = 3;
const MAX_PACKET_SIZE: usize = 2048;

/// UDP tracker client
pub struct UdpTrackerClient {
    announce_url: String,
    host: String,
    attempt_timeout: Duration,
}

impl UdpTrackerClient {
    /// Creates a client for a `udp://host:port[/path]` URL.
    ///
    /// The per-attempt timeout starts at a third of the tracker timeout.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UrlParsing` - If the URL is not valid
    /// - `TorrentError::UnsupportedTracker` - If the scheme is not `udp` or host/port are missing
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let parsed = url::Url::parse(&announce_url)?;
        let unsupported = || TorrentError::UnsupportedTracker {
            url: announce_url.clone(),
        };
        if parsed.scheme() != "udp" {
            return Err(unsupported());
        }
        let host = parsed.host_str().ok_or_else(unsupported)?;
        let port = parsed.port().ok_or_else(unsupported)?;
        let host = format!("{host}:{port}");

        Ok(Self {
            host,
            announce_url,
            attempt_timeout: (config.tracker_timeout / MAX_RETRIES).max(Duration::from_millis(100)),
        })
    }

    async fn resolve(&self) -> Result<PeerAddress, TorrentError> {
        let mut addresses = lookup_host(&self.host).await.map_err(|e| {
            tracing::warn!("Failed to resolve {}: {}", self.announce_url, e);
            self.connection_failed()
        })?;
        addresses.next().ok_or_else(|| self.connection_failed())
    }

    fn connection_failed(&self) -> TorrentError {
        TorrentError::TrackerConnectionFailed {
            url: self.announce_url.clone(),
        }
    }

    fn malformed(reason: impl Into<String>) -> TorrentError {
        TorrentError::MalformedTrackerResponse {
            reason: reason.into(),
        }
    }

    /// Sends `request` and waits for a reply carrying `transaction_id`.
    ///
    /// Replies with other transaction ids are ignored. Each retry doubles
    /// the wait.
    async fn exchange(
        &self,
        socket: &UdpSocket,
        request: &[u8],
        transaction_id: u32,
    ) -> Result<Vec<u8>, TorrentError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        for attempt in 0..MAX_RETRIES {
            socket.send(request).await.map_err(|e| {
                tracing::warn!("UDP send to {} failed: {}", self.announce_url, e);
                self.connection_failed()
            })?;

            let wait = self.attempt_timeout * (1 << attempt);
            let deadline = tokio::time::Instant::now() + wait;

            loop {
                let received = timeout(
                    deadline.saturating_duration_since(tokio::time::Instant::now()),
                    socket.recv(&mut buf),
                )
                .await;

                let n = match received {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        tracing::warn!("UDP receive from {} failed: {}", self.announce_url, e);
                        return Err(self.connection_failed());
                    }
                    Err(_) => break,
                };

                let reply = &buf[..n];
                if reply.len() < 8 {
                    return Err(Self::malformed(format!("packet of {n} bytes")));
                }
                if read_u32(reply, 4) != transaction_id {
                    tracing::debug!("Ignoring UDP reply with foreign transaction id");
                    continue;
                }
                if read_u32(reply, 0) == ACTION_ERROR {
                    return Err(TorrentError::TrackerFailure {
                        reason: String::from_utf8_lossy(&reply[8..]).to_string(),
                    });
                }
                return Ok(reply.to_vec());
            }

            tracing::debug!(
                "UDP tracker {} attempt {} timed out after {:?}",
                self.announce_url,
                attempt + 1,
                wait
            );
        }

        Err(TorrentError::TrackerTimeout {
            url: self.announce_url.clone(),
        })
    }

    async fn connect(&self, socket: &UdpSocket) -> Result<u64, TorrentError> {
        let transaction_id: u32 = rand::random();
        let request = build_connect_request(transaction_id);

        let reply = self.exchange(socket, &request, transaction_id).await?;
        if reply.len() < 16 || read_u32(&reply, 0) != ACTION_CONNECT {
            return Err(Self::malformed("invalid connect response"));
        }

        Ok(read_u64(&reply, 8))
    }
}

#[async_trait]
impl TrackerClient for UdpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let address = self.resolve().await?;
        let bind_address = if address.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };

        let socket = UdpSocket::bind(bind_address).await?;
        socket.connect(address).await?;
        tracing::debug!("Announcing to UDP tracker {} ({})", self.announce_url, address);

        let connection_id = self.connect(&socket).await?;

        let transaction_id: u32 = rand::random();
        let key: u32 = rand::random();
        let packet = build_announce_request(connection_id, transaction_id, key, &request);

        let reply = self.exchange(&socket, &packet, transaction_id).await?;
        let response = parse_announce_reply(&reply)?;

        tracing::debug!(
            "Announced to {}, received {} peers",
            self.announce_url,
            response.peers.len()
        );
        Ok(response)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(word)
}

fn build_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    packet.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet
}

fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &AnnounceRequest,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(request.info_hash.as_bytes());
    packet.extend_from_slice(&request.peer_id);
    packet.extend_from_slice(&request.downloaded.to_be_bytes());
    packet.extend_from_slice(&request.left.to_be_bytes());
    packet.extend_from_slice(&request.uploaded.to_be_bytes());
    packet.extend_from_slice(&request.event.as_udp_code().to_be_bytes());
    // IP address 0 lets the tracker use the packet source
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&key.to_be_bytes());
    // num_want -1 is the tracker default
    packet.extend_from_slice(&(-1i32).to_be_bytes());
    packet.extend_from_slice(&request.port.to_be_bytes());
    packet
}

fn parse_announce_reply(reply: &[u8]) -> Result<AnnounceResponse, TorrentError> {
    if reply.len() < 20 || read_u32(reply, 0) != ACTION_ANNOUNCE {
        return Err(UdpTrackerClient::malformed("invalid announce response"));
    }

    Ok(AnnounceResponse {
        interval: read_u32(reply, 8),
        min_interval: None,
        tracker_id: None,
        incomplete: read_u32(reply, 12),
        complete: read_u32(reply, 16),
        peers: parse_compact_peers(&reply[20..])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;
    use crate::torrent::tracker::AnnounceEvent;

    fn create_test_network_config() -> NetworkConfig {
        NetworkConfig {
            tracker_timeout: Duration::from_millis(900),
            connect_timeout: Duration::from_secs(1),
            max_peer_connections: 4,
            user_agent: "yamtorrent/test",
            ..NetworkConfig::default()
        }
    }

    fn create_test_request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0x33; 20]),
            peer_id: [0x44; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: AnnounceEvent::Started,
        }
    }

    /// Answers one connect and one announce with the given peers.
    async fn spawn_fake_tracker(peers: Vec<u8>, error: Option<&'static str>) -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];

            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 16);
            assert_eq!(read_u64(&buf, 0), PROTOCOL_ID);
            let tid = read_u32(&buf, 12);

            // A stray reply with a different transaction id must be ignored
            let mut stray = Vec::new();
            stray.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            stray.extend_from_slice(&tid.wrapping_add(1).to_be_bytes());
            stray.extend_from_slice(&1u64.to_be_bytes());
            socket.send_to(&stray, from).await.unwrap();

            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            reply.extend_from_slice(&tid.to_be_bytes());
            reply.extend_from_slice(&0xABCDu64.to_be_bytes());
            socket.send_to(&reply, from).await.unwrap();

            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 98);
            assert_eq!(read_u64(&buf, 0), 0xABCD);
            assert_eq!(read_u32(&buf, 8), ACTION_ANNOUNCE);
            assert_eq!(&buf[16..36], &[0x33; 20]);
            assert_eq!(read_u32(&buf, 80), 2);
            let tid = read_u32(&buf, 12);

            let mut reply = Vec::new();
            match error {
                Some(message) => {
                    reply.extend_from_slice(&ACTION_ERROR.to_be_bytes());
                    reply.extend_from_slice(&tid.to_be_bytes());
                    reply.extend_from_slice(message.as_bytes());
                }
                None => {
                    reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
                    reply.extend_from_slice(&tid.to_be_bytes());
                    reply.extend_from_slice(&1800u32.to_be_bytes());
                    reply.extend_from_slice(&3u32.to_be_bytes());
                    reply.extend_from_slice(&7u32.to_be_bytes());
                    reply.extend_from_slice(&peers);
                }
            }
            socket.send_to(&reply, from).await.unwrap();
        });

        format!("udp://{address}/announce")
    }

    #[test]
    fn test_new_requires_port_and_scheme() {
        let config = create_test_network_config();
        assert!(UdpTrackerClient::new("udp://tracker.example.com:6969".into(), &config).is_ok());
        assert!(matches!(
            UdpTrackerClient::new("udp://tracker.example.com".into(), &config),
            Err(TorrentError::UnsupportedTracker { .. })
        ));
        assert!(matches!(
            UdpTrackerClient::new("http://tracker.example.com:80".into(), &config),
            Err(TorrentError::UnsupportedTracker { .. })
        ));
    }

    #[test]
    fn test_announce_packet_layout() {
        let packet = build_announce_request(7, 9, 11, &create_test_request());
        assert_eq!(packet.len(), 98);
        assert_eq!(read_u64(&packet, 0), 7);
        assert_eq!(read_u32(&packet, 8), ACTION_ANNOUNCE);
        assert_eq!(read_u32(&packet, 12), 9);
        assert_eq!(&packet[36..56], &[0x44; 20]);
        assert_eq!(read_u64(&packet, 64), 1000);
        assert_eq!(read_u32(&packet, 88), 11);
        assert_eq!(&packet[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_short_announce_reply_is_malformed() {
        let result = parse_announce_reply(&[0, 0, 0, 1, 0, 0, 0, 0]);
        assert!(matches!(
            result,
            Err(TorrentError::MalformedTrackerResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_announce_round_trip() {
        let url = spawn_fake_tracker(vec![127, 0, 0, 1, 0x1A, 0xE1], None).await;
        let client = UdpTrackerClient::new(url, &create_test_network_config()).unwrap();

        let response = client.announce(create_test_request()).await.unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.incomplete, 3);
        assert_eq!(response.complete, 7);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_announce_error_action() {
        let url = spawn_fake_tracker(Vec::new(), Some("banned")).await;
        let client = UdpTrackerClient::new(url, &create_test_network_config()).unwrap();

        let result = client.announce(create_test_request()).await;
        assert!(matches!(
            result,
            Err(TorrentError::TrackerFailure { reason }) if reason == "banned"
        ));
    }

    #[tokio::test]
    async fn test_announce_times_out_without_reply() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}", silent.local_addr().unwrap());
        let client = UdpTrackerClient::new(url, &create_test_network_config()).unwrap();

        let result = client.announce(create_test_request()).await;
        assert!(matches!(result, Err(TorrentError::TrackerTimeout { .. })));
    }
}
