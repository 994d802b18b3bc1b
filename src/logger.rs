use once_cell::sync::OnceCell;
use std::io::Write;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the `env_logger` backend once, with timestamped lines.
///
/// `RUST_LOG` wins when set; otherwise debug builds log at `debug` and
/// release builds stay silent.
pub fn init() {
    INIT.get_or_init(|| {
        let default_level = if crate::config::LOGGING_ENABLED {
            "debug"
        } else {
            "off"
        };
        let env = env_logger::Env::default().default_filter_or(default_level);
        let _ = env_logger::Builder::from_env(env)
            .format(|buf, record| {
                let now = chrono::Local::now();
                writeln!(
                    buf,
                    "RUST: [{}] {:<5} {}",
                    now.format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.args()
                )
            })
            .try_init();
    });
}

/// Trickle-ICE trace for a freshly gathered local candidate.
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        log::debug!(
            "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
            init.candidate,
            init.sdp_mid,
            init.sdp_mline_index,
            init.username_fragment
        );
    }
}

/// Snapshot of the nominated candidate pair, for post-mortems on degraded links.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                log::info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
