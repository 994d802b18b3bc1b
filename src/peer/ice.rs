use std::collections::VecDeque;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;

/// Remote candidates that arrived before a remote description was set.
///
/// Drained strictly in arrival order. Once the cap is hit, later arrivals
/// are refused; the earliest candidates are usually the host ones.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
    refused: usize,
}

impl PendingCandidates {
    pub const CAPACITY: usize = 256;

    /// Queues `candidate`; false when the buffer is full and it was refused.
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.queue.len() >= Self::CAPACITY {
            self.refused += 1;
            log::warn!(
                "Pending candidate buffer full, refusing {} ({} refused so far)",
                candidate.candidate,
                self.refused
            );
            return false;
        }
        self.queue.push_back(candidate);
        true
    }

    pub fn extend(&mut self, candidates: impl IntoIterator<Item = IceCandidate>) {
        for c in candidates {
            self.push(c);
        }
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Per-connection tally of gathered local candidates by type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateSummary {
    pub fn record(&mut self, candidate: &IceCandidate) {
        match candidate.candidate_type() {
            Some("host") => self.host += 1,
            Some("srflx") => self.srflx += 1,
            Some("relay") => self.relay += 1,
            _ => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log(&self, peer_id: &str) {
        log::info!(
            "Candidate analysis for {}: {} host, {} srflx, {} relay",
            peer_id,
            self.host,
            self.srflx,
            self.relay
        );
        if self.relay == 0 {
            log::debug!("No relay candidates (STUN only); peers behind symmetric NAT may not connect");
        }
    }
}

/// Engine ICE server list from configuration.
pub fn rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}
