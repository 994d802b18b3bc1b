//! webrtc-rs backed transports.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{CallError, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::ice::rtc_ice_servers;
use crate::peer::transport::{
    LinkState, PeerTransport, SenderId, TransportEvent, TransportEventSender, TransportFactory,
};
use crate::peer::types::{IceCandidate, ServerConfig, SessionDescription};

pub struct RtcTransportFactory {
    api: API,
    ice_servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    /// Default codecs and interceptors, STUN servers from config.
    pub fn new(ice_servers: Vec<ServerConfig>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: rtc_ice_servers(&self.ice_servers),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config()).await?);
        log::debug!("Created peer connection for {} (generation {})", peer_id, generation);

        let tx = events.clone();
        let label = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => {
                    dump_candidate(&label, &c);
                    if let Ok(init) = c.to_json() {
                        let _ = tx.send(TransportEvent::LocalCandidate {
                            generation,
                            candidate: IceCandidate::from(init),
                        });
                    }
                }
                None => {
                    log::debug!("ICE gathering completed for {}", label);
                    let _ = tx.send(TransportEvent::GatheringComplete { generation });
                }
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        let label = peer_id.to_string();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            log::info!("Remote {:?} track from {} (ssrc {})", kind, label, track.ssrc());
            let _ = tx.send(TransportEvent::RemoteTrack {
                generation,
                track: RemoteTrack {
                    peer_id: label.clone(),
                    kind,
                    ssrc: track.ssrc(),
                    track: Some(track),
                },
            });
            Box::pin(async {})
        }));

        let tx = events;
        let label = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            log::debug!("Peer connection {} state changed to: {:?}", label, st);
            let state = match st {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
                RTCPeerConnectionState::Connecting => LinkState::Connecting,
                RTCPeerConnectionState::Connected => LinkState::Connected,
                RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                RTCPeerConnectionState::Failed => LinkState::Failed,
                RTCPeerConnectionState::Closed => LinkState::Closed,
            };
            let _ = tx.send(TransportEvent::StateChanged { generation, state });
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcTransport {
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(CallError::Engine(format!("unexpected description type {:?}", other))),
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId> {
        let sender = self.pc.add_track(track.rtc_track()).await?;

        // RTCP has to be drained for interceptors (NACK, reports) to run.
        let reader = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while reader.read(&mut buf).await.is_ok() {}
        });

        let mut senders = self.senders.lock().await;
        senders.push(sender);
        Ok(SenderId(senders.len() - 1))
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<()> {
        let sender = self
            .senders
            .lock()
            .await
            .get(sender.0)
            .cloned()
            .ok_or_else(|| CallError::Engine(format!("no sender {}", sender.0)))?;
        sender.replace_track(Some(track.rtc_track())).await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(desc.try_into()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc.try_into()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) -> Result<()> {
        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            return Ok(());
        }
        self.pc.close().await?;
        Ok(())
    }

    async fn log_selected_pair(&self, moment: &str) {
        dump_selected_pair(&self.pc, moment).await;
    }
}
