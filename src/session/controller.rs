//! Call session controller
//!
//! Owns the one active call: its media transport, inbound router, outbound
//! pipelines and timers. All call lifecycle operations and signaling events
//! go through [`CallController`], which serializes them on a single lock.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::participant::{ParticipantInfo, StreamKind, UserId};
use super::router::{RouterHandle, SsrcTable, StreamRouter};
use super::state::{CallPhase, CallSession, LocalMedia, VoiceConnectionStatus};
use crate::audio::{
    AudioMixer, AudioSink, MicrophonePipeline, MicrophonePipelineConfig, SpeakingMonitor,
    VoiceActivityDetector,
};
use crate::codec::G711Codec;
use crate::config::{AppConfig, ConfigStore};
use crate::devices::CaptureDevices;
use crate::error::{AppError, Result};
use crate::events::{CallEvent, EventBus};
use crate::video::decoder::SoftwareDecoderConfig;
use crate::video::{
    DecoderContext, H264EncoderConfig, HardwareDecoderBackend, OutboundVideoPipeline,
    VideoCaptureSettings, VideoInput,
};
use crate::webrtc::{
    IceCandidate, MediaTransport, SignalingCommand, SignalingEvent, SsrcMapping,
    TransportContext, TransportFactory, VoiceStatePatch,
};

/// Inbound RTP queued between the transport and the router
const INBOUND_QUEUE: usize = 512;

/// External collaborators of the controller
pub struct CallServices {
    pub transports: Arc<dyn TransportFactory>,
    pub devices: Arc<dyn CaptureDevices>,
    pub hardware: Arc<dyn HardwareDecoderBackend>,
    pub audio_sink: Arc<dyn AudioSink>,
    pub events: Arc<EventBus>,
}

/// Connection indicator; publishes only actual changes
struct StatusCell {
    status: Mutex<VoiceConnectionStatus>,
    events: Arc<EventBus>,
}

impl StatusCell {
    fn get(&self) -> VoiceConnectionStatus {
        *self.status.lock()
    }

    fn set(&self, channel_id: &str, status: VoiceConnectionStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        info!("Voice connection {}: {:?}", channel_id, status);
        self.events.publish(CallEvent::ConnectionStatusChanged {
            channel_id: channel_id.to_string(),
            status,
        });
    }
}

struct PendingOffer {
    channel_id: String,
    sdp: String,
}

struct ActiveCall {
    call_id: String,
    channel_id: String,
    transport: Arc<dyn MediaTransport>,
    router: RouterHandle,
    ssrcs: Arc<SsrcTable>,
    participants: BTreeSet<UserId>,
    microphone: Option<MicrophonePipeline>,
    camera: Option<OutboundVideoPipeline>,
    screen: Option<OutboundVideoPipeline>,
    /// Transport watcher, VAD timer and playout
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveCall {
    fn video_mut(&mut self, kind: StreamKind) -> &mut Option<OutboundVideoPipeline> {
        match kind {
            StreamKind::Camera => &mut self.camera,
            StreamKind::Screen => &mut self.screen,
        }
    }
}

struct ControllerState {
    phase: CallPhase,
    media: LocalMedia,
    call: Option<ActiveCall>,
}

pub struct CallController {
    local_user: UserId,
    config: ConfigStore,
    services: CallServices,
    signaling: mpsc::Sender<SignalingCommand>,
    speaking: Arc<SpeakingMonitor>,
    mixer: Arc<AudioMixer>,
    status: Arc<StatusCell>,
    /// Latest offer that arrived before its call was joined
    pending_offer: Mutex<Option<PendingOffer>>,
    state: tokio::sync::Mutex<ControllerState>,
}

impl CallController {
    pub fn new(
        local_user: impl Into<UserId>,
        config: ConfigStore,
        services: CallServices,
        signaling: mpsc::Sender<SignalingCommand>,
    ) -> Arc<Self> {
        let settings = config.get();
        let speaking = Arc::new(SpeakingMonitor::new(settings.session.speaking_hold()));
        let mixer = Arc::new(AudioMixer::new(
            services.audio_sink.clone(),
            speaking.clone(),
            settings.audio.speaking_threshold,
        ));
        let status = Arc::new(StatusCell {
            status: Mutex::new(VoiceConnectionStatus::Disconnected),
            events: services.events.clone(),
        });

        Arc::new(Self {
            local_user: local_user.into(),
            config,
            services,
            signaling,
            speaking,
            mixer,
            status,
            pending_offer: Mutex::new(None),
            state: tokio::sync::Mutex::new(ControllerState {
                phase: CallPhase::Idle,
                media: LocalMedia::default(),
                call: None,
            }),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.services.events
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn status(&self) -> VoiceConnectionStatus {
        self.status.get()
    }

    pub async fn phase(&self) -> CallPhase {
        self.state.lock().await.phase
    }

    pub async fn local_media(&self) -> LocalMedia {
        self.state.lock().await.media
    }

    /// Snapshot of the active call, if any
    pub async fn session(&self) -> Option<CallSession> {
        let state = self.state.lock().await;
        let call = state.call.as_ref()?;
        Some(CallSession {
            call_id: call.call_id.clone(),
            channel_id: call.channel_id.clone(),
            local_user_id: self.local_user.clone(),
            phase: state.phase,
            status: self.status.get(),
            media: state.media,
            participants: call.participants.iter().cloned().collect(),
        })
    }

    /// Remote decoder slots of the active call
    pub async fn decoder_slots(&self) -> Vec<(UserId, StreamKind)> {
        let state = self.state.lock().await;
        match &state.call {
            Some(call) => call.router.slots().await,
            None => Vec::new(),
        }
    }

    /// SSRCs attributed without a signaling mapping during this call
    pub async fn inferred_ssrcs(&self) -> u64 {
        let state = self.state.lock().await;
        state
            .call
            .as_ref()
            .map(|c| c.ssrcs.inferred_count())
            .unwrap_or(0)
    }

    fn set_phase(&self, state: &mut ControllerState, phase: CallPhase) {
        if state.phase == phase {
            return;
        }
        debug!("Call phase {:?} -> {:?}", state.phase, phase);
        state.phase = phase;
        self.services
            .events
            .publish(CallEvent::SessionPhaseChanged { phase });
    }

    /// Join `channel_id`, leaving any current call first
    ///
    /// `participants` are the channel members already present; decoder slots
    /// are created for the streams they are sending.
    pub async fn join(&self, channel_id: &str, participants: Vec<ParticipantInfo>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.leave_locked(&mut state).await;

        let call_id = uuid::Uuid::new_v4().to_string();
        info!("Joining voice channel {} (call {})", channel_id, call_id);
        self.set_phase(&mut state, CallPhase::Joining);
        self.status.set(channel_id, VoiceConnectionStatus::Connecting);

        let config = self.config.get();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let ctx = TransportContext {
            channel_id: channel_id.to_string(),
            inbound: inbound_tx,
            signaling: self.signaling.clone(),
        };
        let transport = match self.services.transports.create(ctx).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Media transport for {} failed: {}", channel_id, e);
                self.status.set(channel_id, VoiceConnectionStatus::Disconnected);
                self.set_phase(&mut state, CallPhase::Idle);
                return Err(e);
            }
        };

        let ssrcs = Arc::new(SsrcTable::new());
        let mut router = StreamRouter::new(
            ssrcs.clone(),
            self.decoder_context(&config),
            config.session.ssrc_grace(),
        );
        let mut members = BTreeSet::new();
        for info in participants {
            if info.user_id == self.local_user {
                continue;
            }
            if members.insert(info.user_id.clone()) {
                self.services.events.publish(CallEvent::ParticipantAdded {
                    user_id: info.user_id.clone(),
                });
            }
            router.add_participant(info);
        }
        let router = RouterHandle::spawn(
            router,
            inbound_rx,
            self.mixer.clone(),
            config.session.stop_timeout(),
        );

        let cancel = CancellationToken::new();
        let tasks = vec![
            self.spawn_transport_watch(channel_id, &transport, cancel.clone()),
            self.spawn_speaking_timer(config.session.vad_poll(), cancel.clone()),
            self.mixer.spawn_playout(
                Duration::from_millis(config.audio.packet_ms.max(1) as u64),
                cancel.clone(),
            ),
        ];

        self.mixer.set_deafened(state.media.deafened);
        let microphone = self
            .start_microphone(&config, &transport, state.media.muted)
            .await;

        state.media.camera = false;
        state.media.screen_sharing = false;
        state.call = Some(ActiveCall {
            call_id,
            channel_id: channel_id.to_string(),
            transport,
            router,
            ssrcs,
            participants: members,
            microphone,
            camera: None,
            screen: None,
            cancel,
            tasks,
        });
        self.set_phase(&mut state, CallPhase::Active);
        self.announce_local_media(&state).await;
        drop(state);

        let pending = self.pending_offer.lock().take();
        match pending {
            Some(offer) if offer.channel_id == channel_id => {
                debug!("Applying offer received before join");
                self.handle_offer(offer.channel_id, offer.sdp).await;
            }
            Some(offer) => debug!("Discarding stale offer for {}", offer.channel_id),
            None => {}
        }
        Ok(())
    }

    fn decoder_context(&self, config: &AppConfig) -> DecoderContext {
        DecoderContext {
            hardware: self.services.hardware.clone(),
            software: SoftwareDecoderConfig {
                program: config.decoder.program.clone(),
                args: None,
                output_format: config.decoder.output_format,
                queue_frames: config.decoder.queue_frames,
                stall_timeout: config.decoder.stall_timeout(),
                stop_timeout: config.decoder.stop_timeout(),
            },
            fallback_resolution: config.decoder.fallback_resolution(),
            events: self.services.events.clone(),
        }
    }

    async fn start_microphone(
        &self,
        config: &AppConfig,
        transport: &Arc<dyn MediaTransport>,
        muted: bool,
    ) -> Option<MicrophonePipeline> {
        let source = match self.services.devices.open_microphone().await {
            Ok(source) => source,
            Err(e) => {
                warn!("Microphone unavailable, joining without it: {}", e);
                self.services.events.publish(CallEvent::PipelineFailed {
                    pipeline: "microphone".to_string(),
                    reason: e.to_string(),
                });
                return None;
            }
        };
        let pipeline = MicrophonePipeline::start(
            source,
            MicrophonePipelineConfig {
                local_user: self.local_user.clone(),
                codec: G711Codec::new(config.audio.codec),
                packet_ms: config.audio.packet_ms,
                vad: VoiceActivityDetector::new(
                    config.audio.gate_enabled,
                    config.audio.gate_threshold,
                    config.audio.speaking_threshold,
                ),
                stop_timeout: config.session.stop_timeout(),
            },
            transport.clone(),
            self.speaking.clone(),
            self.services.events.clone(),
        );
        if muted {
            pipeline.set_paused(true).await;
        }
        Some(pipeline)
    }

    fn spawn_transport_watch(
        &self,
        channel_id: &str,
        transport: &Arc<dyn MediaTransport>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut states = transport.subscribe_state();
        let status = self.status.clone();
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        debug!("Transport for {} is {}", channel_id, state);
                        status.set(&channel_id, state.into());
                    }
                }
            }
        })
    }

    fn spawn_speaking_timer(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let speaking = self.speaking.clone();
        let events = self.services.events.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for (user_id, speaking) in speaking.poll(Instant::now()) {
                            events.publish(CallEvent::SpeakingChanged { user_id, speaking });
                        }
                    }
                }
            }
        })
    }

    /// Leave the current call; a no-op while idle
    pub async fn leave(&self) {
        let mut state = self.state.lock().await;
        self.leave_locked(&mut state).await;
    }

    async fn leave_locked(&self, state: &mut ControllerState) {
        let Some(call) = state.call.take() else {
            return;
        };
        info!("Leaving voice channel {} (call {})", call.channel_id, call.call_id);
        self.set_phase(state, CallPhase::Leaving);
        let stop_timeout = self.config.get().session.stop_timeout();

        call.cancel.cancel();
        if let Some(microphone) = &call.microphone {
            microphone.stop().await;
        }
        for pipeline in [&call.camera, &call.screen].into_iter().flatten() {
            pipeline.stop().await;
        }
        call.router.stop().await;
        for mut task in call.tasks {
            if tokio::time::timeout(stop_timeout, &mut task).await.is_err() {
                task.abort();
            }
        }
        if let Err(e) = call.transport.close().await {
            warn!("Closing media transport failed: {}", e);
        }

        call.ssrcs.clear();
        self.mixer.clear();
        for user_id in self.speaking.clear() {
            self.services.events.publish(CallEvent::SpeakingChanged {
                user_id,
                speaking: false,
            });
        }
        state.media.camera = false;
        state.media.screen_sharing = false;

        self.status.set(&call.channel_id, VoiceConnectionStatus::Disconnected);
        self.set_phase(state, CallPhase::Idle);
    }

    async fn handle_offer(&self, channel_id: String, sdp: String) {
        let transport = {
            let state = self.state.lock().await;
            match &state.call {
                Some(call) if call.channel_id == channel_id => call.transport.clone(),
                _ => {
                    debug!("Holding offer for {} until joined", channel_id);
                    *self.pending_offer.lock() = Some(PendingOffer { channel_id, sdp });
                    return;
                }
            }
        };

        match transport.handle_offer(sdp).await {
            Ok(answer) => {
                let command = SignalingCommand::AnswerReady {
                    channel_id,
                    sdp: answer,
                };
                if self.signaling.send(command).await.is_err() {
                    warn!("Signaling closed, answer not delivered");
                }
            }
            Err(e) => {
                warn!("Negotiation for {} failed: {}", channel_id, e);
                self.status.set(&channel_id, VoiceConnectionStatus::Disconnected);
            }
        }
    }

    async fn handle_candidate(&self, channel_id: &str, candidate: IceCandidate) {
        let transport = {
            let state = self.state.lock().await;
            match &state.call {
                Some(call) if call.channel_id == channel_id => call.transport.clone(),
                _ => {
                    debug!("Ignoring ICE candidate for inactive channel {}", channel_id);
                    return;
                }
            }
        };
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("Rejected remote ICE candidate: {}", e);
        }
    }

    /// Apply one event from the signaling server
    pub async fn handle_signaling(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::OfferReceived { channel_id, sdp } => {
                self.handle_offer(channel_id, sdp).await;
            }
            SignalingEvent::IceCandidateReceived {
                channel_id,
                candidate,
            } => self.handle_candidate(&channel_id, candidate).await,
            SignalingEvent::ParticipantJoined { participant } => {
                self.participant_joined(participant).await;
            }
            SignalingEvent::ParticipantLeft { user_id } => self.participant_left(&user_id).await,
            SignalingEvent::VoiceStateChanged { user_id, state } => {
                self.voice_state_changed(&user_id, state).await;
            }
            SignalingEvent::SsrcMapped(mapping) => self.apply_mappings(vec![mapping]).await,
            SignalingEvent::SsrcMappingsBatch { mappings } => self.apply_mappings(mappings).await,
        }
    }

    /// Feed signaling events to the controller until the channel closes
    pub fn run_signaling(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<SignalingEvent>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                controller.handle_signaling(event).await;
            }
            debug!("Signaling event stream ended");
        })
    }

    async fn participant_joined(&self, info: ParticipantInfo) {
        if info.user_id == self.local_user {
            return;
        }
        let mut state = self.state.lock().await;
        let Some(call) = state.call.as_mut() else {
            debug!("Participant {} joined while idle", info.user_id);
            return;
        };
        if call.participants.insert(info.user_id.clone()) {
            self.services.events.publish(CallEvent::ParticipantAdded {
                user_id: info.user_id.clone(),
            });
        }
        call.router.add_participant(info).await;
    }

    async fn participant_left(&self, user_id: &str) {
        let mut state = self.state.lock().await;
        let Some(call) = state.call.as_mut() else {
            return;
        };
        if !call.participants.remove(user_id) {
            debug!("Unknown participant {} left", user_id);
            return;
        }
        call.router.remove_participant(user_id).await;
        call.ssrcs.remove_user(user_id);
        self.mixer.remove_participant(user_id);
        if self.speaking.remove(user_id) {
            self.services.events.publish(CallEvent::SpeakingChanged {
                user_id: user_id.to_string(),
                speaking: false,
            });
        }
        self.services.events.publish(CallEvent::ParticipantRemoved {
            user_id: user_id.to_string(),
        });
        info!("Participant {} left", user_id);
    }

    async fn voice_state_changed(&self, user_id: &str, patch: VoiceStatePatch) {
        if user_id == self.local_user {
            return;
        }
        let mut state = self.state.lock().await;
        let Some(call) = state.call.as_mut() else {
            return;
        };
        if call.participants.insert(user_id.to_string()) {
            self.services.events.publish(CallEvent::ParticipantAdded {
                user_id: user_id.to_string(),
            });
        }
        call.router.apply_voice_state(user_id, patch).await;
    }

    async fn apply_mappings(&self, mappings: Vec<SsrcMapping>) {
        let mut state = self.state.lock().await;
        let Some(call) = state.call.as_mut() else {
            debug!("Ignoring {} SSRC mappings while idle", mappings.len());
            return;
        };
        for mapping in mappings {
            if mapping.user_id == self.local_user {
                continue;
            }
            call.ssrcs.map(&mapping);
            if call.participants.insert(mapping.user_id.clone()) {
                self.services.events.publish(CallEvent::ParticipantAdded {
                    user_id: mapping.user_id.clone(),
                });
                call.router
                    .add_participant(ParticipantInfo::new(mapping.user_id))
                    .await;
            }
        }
    }

    /// Publish local media flags and tell the other participants
    async fn announce_local_media(&self, state: &ControllerState) {
        self.services.events.publish(state.media.event());
        let Some(call) = &state.call else {
            return;
        };
        let command = SignalingCommand::UpdateVoiceState {
            channel_id: call.channel_id.clone(),
            state: state.media.voice_state(),
        };
        if self.signaling.send(command).await.is_err() {
            warn!("Signaling closed, voice state not delivered");
        }
    }

    /// Mute or unmute the microphone; mute stops the capture device
    pub async fn set_muted(&self, muted: bool) {
        let mut state = self.state.lock().await;
        if state.media.muted == muted {
            return;
        }
        state.media.muted = muted;
        if let Some(microphone) = state.call.as_ref().and_then(|c| c.microphone.as_ref()) {
            microphone.set_paused(muted).await;
        }
        info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        self.announce_local_media(&state).await;
    }

    /// Deafen suppresses playback only; the microphone is unaffected
    pub async fn set_deafened(&self, deafened: bool) {
        let mut state = self.state.lock().await;
        if state.media.deafened == deafened {
            return;
        }
        state.media.deafened = deafened;
        self.mixer.set_deafened(deafened);
        info!("Playback {}", if deafened { "deafened" } else { "undeafened" });
        self.announce_local_media(&state).await;
    }

    pub async fn set_camera(&self, enabled: bool) -> Result<()> {
        let settings = self.config.get().video.camera.capture_settings();
        self.set_video(StreamKind::Camera, enabled, settings).await
    }

    /// Start or stop screen sharing; `settings` overrides the configured capture
    pub async fn set_screen_sharing(
        &self,
        enabled: bool,
        settings: Option<VideoCaptureSettings>,
    ) -> Result<()> {
        let settings =
            settings.unwrap_or_else(|| self.config.get().video.screen.capture_settings());
        self.set_video(StreamKind::Screen, enabled, settings).await
    }

    async fn set_video(
        &self,
        kind: StreamKind,
        enabled: bool,
        settings: VideoCaptureSettings,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(call) = state.call.as_mut() else {
            return Err(AppError::InvalidState(format!("{} requires an active call", kind)));
        };
        let slot = call.video_mut(kind);
        if slot.is_some() == enabled {
            return Ok(());
        }

        if enabled {
            let transport = call.transport.clone();
            let pipeline = self.start_video(kind, &settings, transport).await?;
            *call.video_mut(kind) = Some(pipeline);
        } else if let Some(pipeline) = slot.take() {
            pipeline.stop().await;
        }

        match kind {
            StreamKind::Camera => state.media.camera = enabled,
            StreamKind::Screen => state.media.screen_sharing = enabled,
        }
        info!("{} {}", kind, if enabled { "started" } else { "stopped" });
        self.announce_local_media(&state).await;
        Ok(())
    }

    async fn start_video(
        &self,
        kind: StreamKind,
        settings: &VideoCaptureSettings,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<OutboundVideoPipeline> {
        let config = self.config.get();
        let input = match kind {
            StreamKind::Camera => self.services.devices.open_camera(settings).await?,
            StreamKind::Screen => self.services.devices.open_screen(settings).await?,
        };
        let source = match input {
            VideoInput::Raw(source) => source,
            VideoInput::Encoded(source) => {
                return Ok(OutboundVideoPipeline::start_encoded(
                    kind,
                    source,
                    settings.fps,
                    transport,
                    config.webrtc.max_rtp_payload,
                    self.services.events.clone(),
                    config.session.stop_timeout(),
                ));
            }
        };

        let mut encoder = H264EncoderConfig::new(
            settings.resolution,
            settings.format,
            settings.fps,
            settings.bitrate_kbps,
        );
        encoder.program = config.video.encoder_program.clone();
        encoder.args = config.video.encoder_args.clone();
        encoder.extra_args = config.video.encoder_extra_args.clone();
        encoder.stop_timeout = config.session.stop_timeout();

        OutboundVideoPipeline::start(
            kind,
            source,
            &encoder,
            transport,
            config.webrtc.max_rtp_payload,
            self.services.events.clone(),
            config.session.stop_timeout(),
        )
    }

    /// Per-participant playback volume (0.0 - 2.0)
    pub fn set_participant_volume(&self, user_id: &str, volume: f32) {
        self.mixer.set_volume(user_id, volume);
    }

    pub fn participant_volume(&self, user_id: &str) -> f32 {
        self.mixer.volume(user_id)
    }

    pub fn is_speaking(&self, user_id: &str) -> bool {
        self.speaking.is_speaking(user_id)
    }
}
