//! WebRTC peer connection to the SFU

use async_trait::async_trait;
use bytes::Bytes;
use rtp::packet::Packet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::config::{audio_capability, register_codecs, rtc_configuration, video_capability};
use super::signaling::{IceCandidate, SignalingCommand, TrackKind};
use super::transport::{
    InboundPacket, LocalSsrcs, MediaKind, MediaTransport, TransportContext, TransportFactory,
    TransportState,
};
use crate::codec::G711Variant;
use crate::config::{ConfigStore, WebRtcSettings};
use crate::error::{AppError, Result};
use crate::session::StreamKind;
use crate::utils::LogThrottler;

/// Stream id shared by all local tracks
const LOCAL_STREAM_ID: &str = "vcall-local";

/// Peer connection with one camera, one screen and one audio track
pub struct WebRtcTransport {
    channel_id: String,
    pc: Arc<RTCPeerConnection>,
    camera_track: Arc<TrackLocalStaticRTP>,
    screen_track: Arc<TrackLocalStaticRTP>,
    audio_track: Arc<TrackLocalStaticSample>,
    ssrcs: Arc<LocalSsrcs>,
    state: Arc<watch::Sender<TransportState>>,
    state_rx: watch::Receiver<TransportState>,
    ice_gather_wait: Duration,
    throttler: LogThrottler,
}

impl WebRtcTransport {
    pub async fn new(
        settings: &WebRtcSettings,
        audio_codec: G711Variant,
        ctx: TransportContext,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        register_codecs(&mut media_engine)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(rtc_configuration(settings))
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        let camera_track = Arc::new(TrackLocalStaticRTP::new(
            video_capability(StreamKind::Camera),
            "camera".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        let screen_track = Arc::new(TrackLocalStaticRTP::new(
            video_capability(StreamKind::Screen),
            "screen".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            audio_capability(audio_codec),
            "audio".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));

        let mut senders = Vec::new();
        let tracks: [(TrackKind, Arc<dyn TrackLocal + Send + Sync>); 3] = [
            (TrackKind::Audio, audio_track.clone()),
            (TrackKind::Camera, camera_track.clone()),
            (TrackKind::Screen, screen_track.clone()),
        ];
        for (kind, track) in tracks {
            let sender = pc.add_track(track).await.map_err(|e| {
                AppError::WebRtcError(format!("Failed to add {:?} track: {}", kind, e))
            })?;
            spawn_rtcp_drain(sender.clone());
            senders.push((kind, sender));
        }

        let (state_tx, state_rx) = watch::channel(TransportState::New);

        let transport = Self {
            channel_id: ctx.channel_id.clone(),
            pc,
            camera_track,
            screen_track,
            audio_track,
            ssrcs: Arc::new(LocalSsrcs::new()),
            state: Arc::new(state_tx),
            state_rx,
            ice_gather_wait: Duration::from_millis(settings.ice_gather_wait_ms),
            throttler: LogThrottler::with_secs(5),
        };

        transport.setup_event_handlers(ctx, senders);
        info!(
            "Transport for channel {} created ({} audio)",
            transport.channel_id,
            audio_codec.mime_type()
        );

        Ok(transport)
    }

    fn setup_event_handlers(&self, ctx: TransportContext, senders: Vec<(TrackKind, Arc<RTCRtpSender>)>) {
        let state = self.state.clone();
        let ssrcs = self.ssrcs.clone();
        let channel_id = self.channel_id.clone();
        let senders = Arc::new(senders);

        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                let ssrcs = ssrcs.clone();
                let senders = senders.clone();
                let channel_id = channel_id.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => TransportState::New,
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => return,
                    };

                    info!("Channel {} transport state: {}", channel_id, new_state);
                    if new_state == TransportState::Connected {
                        capture_ssrcs(&ssrcs, &senders).await;
                    }
                    let _ = state.send(new_state);
                })
            }));

        let signaling = ctx.signaling.clone();
        let channel_id = self.channel_id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let signaling = signaling.clone();
                let channel_id = channel_id.clone();

                Box::pin(async move {
                    let Some(c) = candidate else { return };
                    let json = match c.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            debug!("Failed to serialize ICE candidate: {}", e);
                            return;
                        }
                    };
                    debug!("Local ICE candidate: {}", json.candidate);
                    let candidate = IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    };
                    let _ = signaling
                        .send(SignalingCommand::IceCandidateGenerated {
                            channel_id,
                            candidate,
                        })
                        .await;
                })
            }));

        let inbound = ctx.inbound;
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let inbound = inbound.clone();
                Box::pin(async move {
                    let media = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    info!(
                        "Remote {:?} track {} (ssrc {}, pt {})",
                        media,
                        track.id(),
                        track.ssrc(),
                        track.payload_type()
                    );
                    tokio::spawn(read_remote_track(track, media, inbound));
                })
            },
        ));
    }

    fn video_track(&self, kind: StreamKind) -> &Arc<TrackLocalStaticRTP> {
        match kind {
            StreamKind::Camera => &self.camera_track,
            StreamKind::Screen => &self.screen_track,
        }
    }
}

async fn capture_ssrcs(ssrcs: &LocalSsrcs, senders: &[(TrackKind, Arc<RTCRtpSender>)]) {
    if ssrcs.is_captured() {
        return;
    }
    let mut reported = Vec::with_capacity(senders.len());
    for (kind, sender) in senders {
        let params = sender.get_parameters().await;
        let ssrc = params.encodings.first().map(|e| e.ssrc).unwrap_or(0);
        reported.push((*kind, ssrc));
    }
    if ssrcs.capture(&reported) {
        for (kind, _) in senders {
            debug!("Local {:?} track SSRC {:?}", kind, ssrcs.get(*kind));
        }
    }
}

/// Interceptors only run when RTCP is read
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
}

async fn read_remote_track(track: Arc<TrackRemote>, media: MediaKind, inbound: mpsc::Sender<InboundPacket>) {
    let mut count = 0u64;
    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                count += 1;
                trace!(
                    "RTP {:?} ssrc={} pt={} seq={} len={}",
                    media,
                    packet.header.ssrc,
                    packet.header.payload_type,
                    packet.header.sequence_number,
                    packet.payload.len()
                );
                if inbound.send(InboundPacket { media, packet }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Remote track {} ended after {} packets: {}", track.id(), count, e);
                break;
            }
        }
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn handle_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP offer: {}", e)))?;

        self.pc.set_remote_description(offer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        // Let host candidates land in the local description
        tokio::time::sleep(self.ice_gather_wait).await;

        let sdp = self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or(answer.sdp);
        Ok(sdp)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn send_video(&self, kind: StreamKind, packets: Vec<Packet>) -> Result<()> {
        let track = self.video_track(kind);
        for packet in &packets {
            if let Err(e) = track.write_rtp(packet).await {
                if let Some(suppressed) = self.throttler.check(kind.as_str()) {
                    debug!(suppressed, "{} RTP write failed: {}", kind, e);
                }
                return Err(AppError::WebRtcError(format!("{} RTP write failed: {}", kind, e)));
            }
        }
        Ok(())
    }

    async fn send_audio(&self, payload: Bytes, duration: Duration) -> Result<()> {
        let sample = Sample {
            data: payload,
            duration,
            ..Default::default()
        };
        self.audio_track
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::AudioError(format!("Audio write failed: {}", e)))
    }

    fn local_ssrc(&self, kind: TrackKind) -> Option<u32> {
        self.ssrcs.get(kind)
    }

    fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))?;
        self.ssrcs.reset();
        let _ = self.state.send(TransportState::Closed);
        info!("Transport for channel {} closed", self.channel_id);
        Ok(())
    }
}

/// Builds [`WebRtcTransport`]s from the current configuration
pub struct WebRtcTransportFactory {
    config: ConfigStore,
}

impl WebRtcTransportFactory {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, ctx: TransportContext) -> Result<Arc<dyn MediaTransport>> {
        let config = self.config.get();
        let transport = WebRtcTransport::new(&config.webrtc, config.audio.codec, ctx).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn offline_store() -> ConfigStore {
        let mut config = AppConfig::default();
        config.webrtc.stun_servers.clear();
        ConfigStore::in_memory(config)
    }

    #[tokio::test]
    async fn test_create_and_close() {
        let (inbound, _inbound_rx) = mpsc::channel(16);
        let (signaling, _signaling_rx) = mpsc::channel(16);
        let factory = WebRtcTransportFactory::new(offline_store());

        let transport = factory
            .create(TransportContext {
                channel_id: "c1".to_string(),
                inbound,
                signaling,
            })
            .await
            .unwrap();

        assert_eq!(transport.state(), TransportState::New);
        assert_eq!(transport.local_ssrc(TrackKind::Camera), None);

        // Nothing is bound before negotiation; writes go nowhere
        let packets = vec![Packet::default()];
        assert!(transport.send_video(StreamKind::Camera, packets).await.is_ok());

        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_rejects_garbage_offer() {
        let (inbound, _inbound_rx) = mpsc::channel(16);
        let (signaling, _signaling_rx) = mpsc::channel(16);
        let transport = WebRtcTransport::new(
            &offline_store().get().webrtc,
            G711Variant::Pcmu,
            TransportContext {
                channel_id: "c1".to_string(),
                inbound,
                signaling,
            },
        )
        .await
        .unwrap();

        assert!(transport.handle_offer("not sdp".to_string()).await.is_err());
        transport.close().await.unwrap();
    }
}
