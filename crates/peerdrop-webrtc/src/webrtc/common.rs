//! WebRTC peer connection management
//!
//! Wraps a webrtc-rs peer connection configured for non-trickle ("vanilla")
//! ICE: a descriptor is only produced after gathering has finished, so it
//! carries every candidate and one paste in each direction is enough.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use peerdrop_common::signaling::codec::IceCandidatePayload;

/// Google STUN server for NAT traversal
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Timeout for ICE gathering
pub const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ICE gathering
// ============================================================================

/// Candidate and gathering-state streams of one peer connection, consumed
/// once to collect the full candidate list.
pub struct IceGathering {
    candidate_rx: mpsc::Receiver<RTCIceCandidate>,
    state_rx: watch::Receiver<RTCIceGathererState>,
}

impl IceGathering {
    /// Wait for gathering to complete and return every candidate seen.
    /// On timeout whatever was collected so far is returned.
    pub async fn wait(mut self, timeout: Duration) -> Vec<RTCIceCandidate> {
        let mut candidates = Vec::new();

        let collect = async {
            loop {
                tokio::select! {
                    candidate = self.candidate_rx.recv() => {
                        if let Some(candidate) = candidate {
                            candidates.push(candidate);
                        }
                    }
                    result = self.state_rx.changed() => {
                        if result.is_err() {
                            break;
                        }
                        let state = *self.state_rx.borrow();
                        if state == RTCIceGathererState::Complete {
                            // Late candidates can still be queued behind the state change
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            while let Ok(candidate) = self.candidate_rx.try_recv() {
                                candidates.push(candidate);
                            }
                            break;
                        }
                    }
                }
            }
        };

        if tokio::time::timeout(timeout, collect).await.is_err() {
            log::warn!(
                "ICE gathering timeout, collected {} candidates",
                candidates.len()
            );
        }

        candidates
    }
}

/// Convert gathered candidates into their serializable form
pub fn ice_candidates_to_payloads(candidates: Vec<RTCIceCandidate>) -> Vec<IceCandidatePayload> {
    candidates
        .into_iter()
        .filter_map(|c| {
            let json = c.to_json().ok()?;
            Some(IceCandidatePayload {
                candidate: json.candidate,
                sdp_m_line_index: json.sdp_mline_index,
                sdp_mid: json.sdp_mid,
            })
        })
        .collect()
}

fn payload_to_candidate_init(payload: &IceCandidatePayload) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: payload.candidate.clone(),
        sdp_mid: payload.sdp_mid.clone(),
        sdp_mline_index: payload.sdp_m_line_index,
        username_fragment: None,
    }
}

// ============================================================================
// WebRTC Peer Connection
// ============================================================================

/// WebRTC peer connection wrapper
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
}

/// Receivers handed out once when the peer is created.
pub struct PeerStreams {
    pub gathering: IceGathering,
    /// Data channels opened by the remote side.
    pub data_channels: mpsc::Receiver<Arc<RTCDataChannel>>,
    pub state: watch::Receiver<RTCPeerConnectionState>,
}

impl WebRtcPeer {
    /// Create a new WebRTC peer connection with STUN server for NAT traversal
    pub async fn new() -> Result<(Self, PeerStreams)> {
        let ice_servers = vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_owned()],
            ..Default::default()
        }];

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        let (ice_candidate_tx, ice_candidate_rx) = mpsc::channel(50);
        let (data_channel_tx, data_channel_rx) = mpsc::channel(1);
        let (ice_gathering_tx, ice_gathering_rx) = watch::channel(RTCIceGathererState::New);
        let (state_tx, state_rx) = watch::channel(RTCPeerConnectionState::New);

        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let ice_tx = ice_candidate_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if ice_tx.send(candidate).await.is_err() {
                        log::debug!("ICE candidate arrived after gathering finished");
                    }
                }
            })
        }));

        peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
            let _ = ice_gathering_tx.send(state);
            Box::pin(async {})
        }));

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            log::debug!("Peer connection state: {}", state);
            let _ = state_tx.send(state);
            Box::pin(async {})
        }));

        peer_connection.on_data_channel(Box::new(move |dc| {
            let dc_tx = data_channel_tx.clone();
            let label = dc.label().to_string();
            Box::pin(async move {
                if dc_tx.send(dc).await.is_err() {
                    log::warn!(
                        "Failed to forward data channel '{}' - receiver dropped",
                        label
                    );
                }
            })
        }));

        let streams = PeerStreams {
            gathering: IceGathering {
                candidate_rx: ice_candidate_rx,
                state_rx: ice_gathering_rx,
            },
            data_channels: data_channel_rx,
            state: state_rx,
        };

        Ok((Self { peer_connection }, streams))
    }

    /// Create a data channel with the given label
    pub async fn create_data_channel(&self, label: &str) -> Result<Arc<RTCDataChannel>> {
        let dc = self
            .peer_connection
            .create_data_channel(label, None)
            .await
            .context("Failed to create data channel")?;
        log::debug!("Created data channel: {}", label);
        Ok(dc)
    }

    /// Create an SDP offer and install it as the local description
    pub async fn create_local_offer(&self) -> Result<RTCSessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        self.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Create an SDP answer and install it as the local description
    pub async fn create_local_answer(&self) -> Result<RTCSessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(sdp)
            .await
            .context("Failed to set local description")
    }

    /// Set the remote description
    pub async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(sdp)
            .await
            .context("Failed to set remote description")
    }

    /// Add the candidates that came with the remote descriptor
    pub async fn add_remote_candidates(&self, candidates: &[IceCandidatePayload]) -> Result<()> {
        for candidate in candidates {
            self.peer_connection
                .add_ice_candidate(payload_to_candidate_init(candidate))
                .await
                .context("Failed to add ICE candidate")?;
        }
        log::debug!("Added {} remote ICE candidates", candidates.len());
        Ok(())
    }

    /// Get connection info (candidate type, addresses, etc.)
    pub async fn get_connection_info(&self) -> WebRtcConnectionInfo {
        let stats = self.peer_connection.get_stats().await;

        let mut nominated_pair = None;
        for report in stats.reports.values() {
            if let StatsReportType::CandidatePair(pair) = report {
                if pair.nominated {
                    nominated_pair = Some((
                        pair.local_candidate_id.clone(),
                        pair.remote_candidate_id.clone(),
                    ));
                    break;
                }
            }
        }

        let mut local = None;
        let mut remote = None;
        if let Some((local_id, remote_id)) = &nominated_pair {
            for (id, report) in &stats.reports {
                match report {
                    StatsReportType::LocalCandidate(c) if id == local_id => {
                        local = Some((
                            format!("{:?}", c.candidate_type),
                            format!("{}:{}", c.ip, c.port),
                        ));
                    }
                    StatsReportType::RemoteCandidate(c) if id == remote_id => {
                        remote = Some((
                            format!("{:?}", c.candidate_type),
                            format!("{}:{}", c.ip, c.port),
                        ));
                    }
                    _ => {}
                }
            }
        }

        let connection_type = match (&local, &remote) {
            (Some((local_type, _)), Some((remote_type, _))) => {
                classify_connection(local_type, remote_type)
            }
            _ => "Unknown".to_string(),
        };

        WebRtcConnectionInfo {
            connection_type,
            local_address: local.map(|(_, addr)| addr),
            remote_address: remote.map(|(_, addr)| addr),
        }
    }

    /// Close the peer connection
    pub async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

/// Describe the nominated pair by its candidate types.
fn classify_connection(local: &str, remote: &str) -> String {
    let local_lower = local.to_lowercase();
    let remote_lower = remote.to_lowercase();
    if local_lower.contains("relay") || remote_lower.contains("relay") {
        "Relay (TURN)".to_string()
    } else if local_lower.contains("host") && remote_lower.contains("host") {
        "Direct (Host)".to_string()
    } else if local_lower.contains("srflx") || remote_lower.contains("srflx") {
        "Direct (STUN)".to_string()
    } else if local_lower.contains("prflx") || remote_lower.contains("prflx") {
        "Direct (Peer Reflexive)".to_string()
    } else {
        format!("Unknown ({}/{})", local, remote)
    }
}

/// WebRTC connection information
#[derive(Debug, Clone)]
pub struct WebRtcConnectionInfo {
    pub connection_type: String,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_connection() {
        assert_eq!(classify_connection("Host", "Host"), "Direct (Host)");
        assert_eq!(classify_connection("Host", "Srflx"), "Direct (STUN)");
        assert_eq!(classify_connection("Relay", "Host"), "Relay (TURN)");
        assert_eq!(classify_connection("Prflx", "Host"), "Direct (Peer Reflexive)");
        assert_eq!(classify_connection("a", "b"), "Unknown (a/b)");
    }

    #[test]
    fn test_payload_to_candidate_init_keeps_fields() {
        let payload = IceCandidatePayload {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host".to_string(),
            sdp_m_line_index: Some(0),
            sdp_mid: Some("0".to_string()),
        };
        let init = payload_to_candidate_init(&payload);
        assert_eq!(init.candidate, payload.candidate);
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert!(init.username_fragment.is_none());
    }
}
