use crate::config::CallConfig;
use crate::error::TransportError;
use crate::logger::dump_selected_pair;
use crate::peer::transport::{
    RemoteTrackHandler, SdpKind, SessionDescription, SessionTransport, TransportFactory,
};
use crate::peer::types::{MediaKind, RemoteTrack, ServerConfig};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Builds a [`WebRtcTransport`] per call session.
#[derive(Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
    gathering_timeout: Duration,
    local_tracks: Vec<LocalTrack>,
}

impl WebRtcTransportFactory {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            gathering_timeout: config.ice_gathering_timeout,
            local_tracks: Vec::new(),
        }
    }

    /// Sends `track` on every session created from now on. Without local
    /// tracks the transport only receives audio and video.
    pub fn with_local_track(mut self, track: LocalTrack) -> Self {
        self.local_tracks.push(track);
        self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self) -> Result<Arc<dyn SessionTransport>, TransportError> {
        let transport = WebRtcTransport::new(
            &self.ice_servers,
            &self.local_tracks,
            self.gathering_timeout,
        )
        .await?;
        Ok(Arc::new(transport))
    }
}

/// webrtc-rs peer connection behind the [`SessionTransport`] seam.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    gathering_timeout: Duration,
    track_handler: Arc<Mutex<Option<RemoteTrackHandler>>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    pub async fn new(
        servers: &[ServerConfig],
        local_tracks: &[LocalTrack],
        gathering_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(rejected)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(rejected)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(servers))
                .await
                .map_err(rejected)?,
        );

        if local_tracks.is_empty() {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                pc.add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(rejected)?;
            }
        } else {
            for track in local_tracks {
                pc.add_track(track.clone()).await.map_err(rejected)?;
            }
        }

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {:?}", st);
            let pc_stats = pc_stats.clone();
            Box::pin(async move {
                if let (RTCPeerConnectionState::Connected | RTCPeerConnectionState::Failed, Some(pc)) =
                    (st, pc_stats.upgrade())
                {
                    dump_selected_pair(&pc, &format!("{st:?}")).await;
                }
            })
        }));

        let track_handler: Arc<Mutex<Option<RemoteTrackHandler>>> = Arc::new(Mutex::new(None));
        let handler = track_handler.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let remote = RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind: match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => MediaKind::Unknown,
                },
            };
            info!("Remote track {} ({:?}) started", remote.id, remote.kind);
            if let Some(h) = handler.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
                h(remote);
            }
            Box::pin(async {})
        }));

        Ok(Self {
            pc,
            gathering_timeout,
            track_handler,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(rejected)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(rejected)?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(rejected)?;

        // the mailbox carries no trickle candidates, so publish after gathering
        if timeout(self.gathering_timeout, gathered.recv()).await.is_err() {
            warn!(
                "ICE gathering not complete after {:?}, publishing partial description",
                self.gathering_timeout
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Rejected("no local description after apply".into()))?;
        from_rtc(local)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(rejected)
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        *self.track_handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    /// Idempotent. Every other operation fails with [`TransportError::Closed`] afterwards.
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pc.close().await.map_err(rejected)
    }
}

fn rejected(e: webrtc::Error) -> TransportError {
    TransportError::Rejected(e.to_string())
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::InvalidDescription(format!(
            "unsupported description type {other}"
        ))),
    }
}

/// Peer connection configuration for the given ICE servers
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
