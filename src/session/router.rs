//! Inbound media routing
//!
//! Every received RTP packet carries only an SSRC. Signaling tells us which
//! participant and track an SSRC belongs to, usually but not always before the
//! first packet. Video packets are routed to a per (participant, kind)
//! [`StreamPipeline`]: depacketizer, frame assembler, decoder. Audio goes to
//! the mixer keyed by participant.
//!
//! A screen SSRC still unmapped after the grace period is attributed to the
//! participant sharing their screen, if there is exactly one. Once an SSRC
//! is resolved it keeps routing to the same stream.

use dashmap::DashMap;
use parking_lot::Mutex;
use rtp::packet::Packet;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::participant::{ParticipantInfo, StreamKind, UserId, SCREEN_PAYLOAD_TYPE};
use crate::audio::AudioMixer;
use crate::events::CallEvent;
use crate::utils::LogThrottler;
use crate::video::{DecoderContext, DecoderState, FrameAssembler};
use crate::webrtc::{
    H264Depacketizer, InboundPacket, MediaKind, SsrcMapping, TrackKind, VoiceStatePatch,
};

/// Who an SSRC belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcEntry {
    pub user_id: UserId,
    /// `None` when signaling did not say; the payload type decides
    pub kind: Option<TrackKind>,
    /// Attributed by the single-sharer heuristic rather than signaling
    pub inferred: bool,
}

/// SSRC -> participant map shared by the controller and the dispatch task
#[derive(Debug, Default)]
pub struct SsrcTable {
    entries: DashMap<u32, SsrcEntry>,
    payload_types: DashMap<u32, u8>,
    inferred: AtomicU64,
}

impl SsrcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a mapping from signaling; returns whether the table changed
    ///
    /// A mapping without a kind keeps a kind already known for the same user.
    pub fn map(&self, mapping: &SsrcMapping) -> bool {
        let previous = self.entries.get(&mapping.ssrc).map(|e| e.clone());
        let kind = match &previous {
            Some(prev) if prev.user_id == mapping.user_id => mapping.kind.or(prev.kind),
            _ => mapping.kind,
        };
        let entry = SsrcEntry {
            user_id: mapping.user_id.clone(),
            kind,
            inferred: false,
        };
        if previous.as_ref() == Some(&entry) {
            return false;
        }
        if let Some(prev) = previous.filter(|p| p.user_id != entry.user_id) {
            warn!(
                "SSRC {} remapped from {} to {}{}",
                mapping.ssrc,
                prev.user_id,
                entry.user_id,
                if prev.inferred { " (was inferred)" } else { "" }
            );
        }
        debug!("SSRC {} -> {} ({:?})", mapping.ssrc, entry.user_id, entry.kind);
        self.entries.insert(mapping.ssrc, entry);
        true
    }

    /// Record a heuristic attribution unless the SSRC is already known
    pub fn map_inferred(&self, ssrc: u32, user_id: &str, kind: TrackKind) -> bool {
        match self.entries.entry(ssrc) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SsrcEntry {
                    user_id: user_id.to_string(),
                    kind: Some(kind),
                    inferred: true,
                });
                self.inferred.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    pub fn resolve(&self, ssrc: u32) -> Option<SsrcEntry> {
        self.entries.get(&ssrc).map(|e| e.clone())
    }

    pub fn user_for(&self, ssrc: u32) -> Option<UserId> {
        self.entries.get(&ssrc).map(|e| e.user_id.clone())
    }

    /// Remember the latest payload type seen on an SSRC
    pub fn record_payload_type(&self, ssrc: u32, payload_type: u8) {
        self.payload_types.insert(ssrc, payload_type);
    }

    pub fn payload_type(&self, ssrc: u32) -> Option<u8> {
        self.payload_types.get(&ssrc).map(|pt| *pt)
    }

    /// Forget every SSRC of a participant; returns how many were removed
    pub fn remove_user(&self, user_id: &str) -> usize {
        let ssrcs: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| *e.key())
            .collect();
        for ssrc in &ssrcs {
            self.entries.remove(ssrc);
            self.payload_types.remove(ssrc);
        }
        ssrcs.len()
    }

    /// Whether any SSRC is already assigned to the user's screen track
    ///
    /// A kind-less entry counts when its packets carry the screen payload type.
    pub fn has_screen_ssrc(&self, user_id: &str) -> bool {
        self.entries.iter().any(|e| {
            e.user_id == user_id
                && match e.kind {
                    Some(kind) => kind == TrackKind::Screen,
                    None => self.payload_type(*e.key()) == Some(SCREEN_PAYLOAD_TYPE),
                }
        })
    }

    /// SSRCs attributed by the heuristic so far
    pub fn inferred_count(&self) -> u64 {
        self.inferred.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.payload_types.clear();
    }
}

/// Depacketize, assemble and decode one remote video stream
pub struct StreamPipeline {
    depacketizer: H264Depacketizer,
    assembler: FrameAssembler,
    decoder: DecoderState,
    packets: u64,
    access_units: u64,
}

impl StreamPipeline {
    fn new(user_id: UserId, kind: StreamKind) -> Self {
        Self {
            depacketizer: H264Depacketizer::new(),
            assembler: FrameAssembler::new(),
            decoder: DecoderState::new(user_id, kind),
            packets: 0,
            access_units: 0,
        }
    }

    async fn push(&mut self, packet: &Packet, ctx: &DecoderContext) {
        self.packets += 1;
        let annexb = self.depacketizer.depacketize(&packet.payload);
        if let Some(access_unit) =
            self.assembler
                .process_packet(&annexb, packet.header.timestamp, packet.header.marker)
        {
            self.access_units += 1;
            self.decoder.decode_access_unit(access_unit, ctx).await;
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn access_units(&self) -> u64 {
        self.access_units
    }

    async fn dispose(&mut self) {
        self.assembler.reset();
        self.depacketizer.reset();
        self.decoder.dispose().await;
    }
}

struct RemoteParticipant {
    info: ParticipantInfo,
    streams: BTreeMap<StreamKind, StreamPipeline>,
}

/// Owns every remote participant's stream pipelines
pub struct StreamRouter {
    ssrcs: Arc<SsrcTable>,
    participants: HashMap<UserId, RemoteParticipant>,
    decoder: DecoderContext,
    ssrc_grace: Duration,
    /// First arrival of screen SSRCs with no mapping yet
    unmapped: HashMap<u32, Instant>,
    dropped_packets: u64,
    throttler: LogThrottler,
}

impl StreamRouter {
    pub fn new(ssrcs: Arc<SsrcTable>, decoder: DecoderContext, ssrc_grace: Duration) -> Self {
        Self {
            ssrcs,
            participants: HashMap::new(),
            decoder,
            ssrc_grace,
            unmapped: HashMap::new(),
            dropped_packets: 0,
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn ssrcs(&self) -> &Arc<SsrcTable> {
        &self.ssrcs
    }

    /// Track a participant and create slots for the streams they send
    pub fn add_participant(&mut self, info: ParticipantInfo) {
        let user_id = info.user_id.clone();
        let kinds: Vec<StreamKind> = info.streams.iter().copied().collect();
        match self.participants.get_mut(&user_id) {
            Some(existing) => {
                existing.info.display_name = info.display_name;
                existing.info.muted = info.muted;
                existing.info.deafened = info.deafened;
            }
            None => {
                debug!("Tracking participant {}", user_id);
                self.participants.insert(
                    user_id.clone(),
                    RemoteParticipant {
                        info: ParticipantInfo {
                            streams: Default::default(),
                            ..info
                        },
                        streams: BTreeMap::new(),
                    },
                );
            }
        }
        for kind in kinds {
            self.start_stream(&user_id, kind);
        }
    }

    /// Drop a participant and dispose their decoders
    pub async fn remove_participant(&mut self, user_id: &str) -> Option<ParticipantInfo> {
        let mut participant = self.participants.remove(user_id)?;
        for (kind, mut stream) in std::mem::take(&mut participant.streams) {
            stream.dispose().await;
            self.decoder.events.publish(CallEvent::StreamStopped {
                user_id: user_id.to_string(),
                kind,
            });
        }
        debug!("Participant {} removed", user_id);
        Some(participant.info)
    }

    /// Apply a remote participant's voice state change
    pub async fn apply_voice_state(&mut self, user_id: &str, patch: &VoiceStatePatch) {
        if !self.participants.contains_key(user_id) {
            self.add_participant(ParticipantInfo::new(user_id));
        }
        if let Some(participant) = self.participants.get_mut(user_id) {
            if let Some(muted) = patch.muted {
                participant.info.muted = muted;
            }
            if let Some(deafened) = patch.deafened {
                participant.info.deafened = deafened;
            }
        }
        for (kind, active) in patch.stream_changes() {
            if active {
                self.start_stream(user_id, kind);
            } else {
                self.stop_stream(user_id, kind).await;
            }
        }
    }

    fn start_stream(&mut self, user_id: &str, kind: StreamKind) -> bool {
        let Some(participant) = self.participants.get_mut(user_id) else {
            return false;
        };
        participant.info.streams.insert(kind);
        if participant.streams.contains_key(&kind) {
            return false;
        }
        participant
            .streams
            .insert(kind, StreamPipeline::new(user_id.to_string(), kind));
        info!("Decoder slot created for {}/{}", user_id, kind);
        self.decoder.events.publish(CallEvent::StreamStarted {
            user_id: user_id.to_string(),
            kind,
        });
        true
    }

    async fn stop_stream(&mut self, user_id: &str, kind: StreamKind) -> bool {
        let Some(participant) = self.participants.get_mut(user_id) else {
            return false;
        };
        participant.info.streams.remove(&kind);
        let Some(mut stream) = participant.streams.remove(&kind) else {
            return false;
        };
        stream.dispose().await;
        info!("Decoder slot released for {}/{}", user_id, kind);
        self.decoder.events.publish(CallEvent::StreamStopped {
            user_id: user_id.to_string(),
            kind,
        });
        true
    }

    pub fn participant(&self, user_id: &str) -> Option<&ParticipantInfo> {
        self.participants.get(user_id).map(|p| &p.info)
    }

    /// Every existing decoder slot, ordered by participant then kind
    pub fn slots(&self) -> Vec<(UserId, StreamKind)> {
        let mut slots: Vec<_> = self
            .participants
            .iter()
            .flat_map(|(user_id, p)| p.streams.keys().map(move |kind| (user_id.clone(), *kind)))
            .collect();
        slots.sort();
        slots
    }

    pub fn stream(&self, user_id: &str, kind: StreamKind) -> Option<&StreamPipeline> {
        self.participants.get(user_id)?.streams.get(&kind)
    }

    /// Video packets that could not be attributed to a stream
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    /// Route one inbound video packet to its stream pipeline
    pub async fn route_video(&mut self, packet: &Packet, now: Instant) {
        let ssrc = packet.header.ssrc;
        let payload_type = packet.header.payload_type;
        self.ssrcs.record_payload_type(ssrc, payload_type);

        let Some((user_id, kind)) = self.resolve_video(ssrc, payload_type, now) else {
            self.dropped_packets += 1;
            return;
        };

        if !self.participants.contains_key(&user_id) {
            self.add_participant(ParticipantInfo::new(user_id.clone()));
        }
        self.start_stream(&user_id, kind);

        let Some(stream) = self
            .participants
            .get_mut(&user_id)
            .and_then(|p| p.streams.get_mut(&kind))
        else {
            return;
        };
        stream.push(packet, &self.decoder).await;
    }

    fn resolve_video(&mut self, ssrc: u32, payload_type: u8, now: Instant) -> Option<(UserId, StreamKind)> {
        if let Some(entry) = self.ssrcs.resolve(ssrc) {
            self.unmapped.remove(&ssrc);
            return Self::video_target(ssrc, entry, payload_type);
        }

        let kind = StreamKind::from_payload_type(payload_type)?;
        if kind != StreamKind::Screen {
            if let Some(suppressed) = self.throttler.check("unmapped_camera") {
                debug!(suppressed, "Dropping camera packet from unmapped SSRC {}", ssrc);
            }
            return None;
        }

        let first_seen = *self.unmapped.entry(ssrc).or_insert(now);
        if now.saturating_duration_since(first_seen) < self.ssrc_grace {
            trace!("Screen SSRC {} unmapped, waiting for signaling", ssrc);
            return None;
        }

        let owner = self.single_screen_sharer()?;
        if self.ssrcs.map_inferred(ssrc, &owner, TrackKind::Screen) {
            warn!(
                "No mapping for screen SSRC {} after {:?}, attributing to sole sharer {}",
                ssrc, self.ssrc_grace, owner
            );
        }
        self.unmapped.remove(&ssrc);
        let entry = self.ssrcs.resolve(ssrc)?;
        Self::video_target(ssrc, entry, payload_type)
    }

    fn video_target(ssrc: u32, entry: SsrcEntry, payload_type: u8) -> Option<(UserId, StreamKind)> {
        let kind = match entry.kind {
            Some(track) => track.stream_kind(),
            None => StreamKind::from_payload_type(payload_type),
        };
        match kind {
            Some(kind) => Some((entry.user_id, kind)),
            None => {
                trace!("SSRC {} (PT {}) is not a video stream", ssrc, payload_type);
                None
            }
        }
    }

    /// The only participant sharing a screen that has no SSRC yet
    fn single_screen_sharer(&mut self) -> Option<UserId> {
        let ssrcs = &self.ssrcs;
        let mut candidates = self
            .participants
            .values()
            .filter(|p| p.info.is_sending(StreamKind::Screen))
            .filter(|p| !ssrcs.has_screen_ssrc(&p.info.user_id))
            .map(|p| p.info.user_id.clone());
        let first = candidates.next();
        let ambiguous = candidates.next().is_some();
        if first.is_none() || ambiguous {
            if let Some(suppressed) = self.throttler.check("screen_heuristic") {
                debug!(
                    suppressed,
                    "Cannot attribute unmapped screen SSRC ({})",
                    if ambiguous {
                        "several unmapped sharers"
                    } else {
                        "no sharer without a screen SSRC"
                    }
                );
            }
            return None;
        }
        first
    }

    /// Dispose every stream and forget all participants
    pub async fn clear(&mut self) {
        let users: Vec<UserId> = self.participants.keys().cloned().collect();
        for user_id in users {
            self.remove_participant(&user_id).await;
        }
        self.unmapped.clear();
    }
}

enum RouterCommand {
    AddParticipant(ParticipantInfo),
    RemoveParticipant(UserId),
    ApplyVoiceState { user_id: UserId, patch: VoiceStatePatch },
    Slots(oneshot::Sender<Vec<(UserId, StreamKind)>>),
}

/// Handle to the task that owns a [`StreamRouter`] and drains inbound media
pub struct RouterHandle {
    commands: mpsc::Sender<RouterCommand>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl RouterHandle {
    pub fn spawn(
        router: StreamRouter,
        inbound: mpsc::Receiver<InboundPacket>,
        mixer: Arc<AudioMixer>,
        stop_timeout: Duration,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatch_loop(router, inbound, command_rx, mixer, cancel.clone()));
        Self {
            commands,
            cancel,
            task: Mutex::new(Some(task)),
            stop_timeout,
        }
    }

    async fn send(&self, command: RouterCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("Router task gone, command dropped");
        }
    }

    pub async fn add_participant(&self, info: ParticipantInfo) {
        self.send(RouterCommand::AddParticipant(info)).await;
    }

    pub async fn remove_participant(&self, user_id: &str) {
        self.send(RouterCommand::RemoveParticipant(user_id.to_string()))
            .await;
    }

    pub async fn apply_voice_state(&self, user_id: &str, patch: VoiceStatePatch) {
        self.send(RouterCommand::ApplyVoiceState {
            user_id: user_id.to_string(),
            patch,
        })
        .await;
    }

    /// Current decoder slots; empty once the router has stopped
    pub async fn slots(&self) -> Vec<(UserId, StreamKind)> {
        let (tx, rx) = oneshot::channel();
        self.send(RouterCommand::Slots(tx)).await;
        rx.await.unwrap_or_default()
    }

    /// Stop the dispatch task; its streams are disposed before it exits
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.stop_timeout, &mut task).await.is_err() {
                warn!("Router did not stop in {:?}, aborting", self.stop_timeout);
                task.abort();
            }
        }
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch_loop(
    mut router: StreamRouter,
    mut inbound: mpsc::Receiver<InboundPacket>,
    mut commands: mpsc::Receiver<RouterCommand>,
    mixer: Arc<AudioMixer>,
    cancel: CancellationToken,
) {
    let mut inbound_open = true;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(command) = commands.recv() => match command {
                RouterCommand::AddParticipant(info) => router.add_participant(info),
                RouterCommand::RemoveParticipant(user_id) => {
                    router.remove_participant(&user_id).await;
                }
                RouterCommand::ApplyVoiceState { user_id, patch } => {
                    router.apply_voice_state(&user_id, &patch).await;
                }
                RouterCommand::Slots(reply) => {
                    let _ = reply.send(router.slots());
                }
            },

            packet = inbound.recv(), if inbound_open => {
                let Some(InboundPacket { media, packet }) = packet else {
                    debug!("Inbound media channel closed");
                    inbound_open = false;
                    continue;
                };
                match media {
                    MediaKind::Audio => {
                        let ssrc = packet.header.ssrc;
                        let user_id = router.ssrcs().user_for(ssrc);
                        mixer.push_packet(
                            ssrc,
                            user_id.as_deref(),
                            packet.header.payload_type,
                            &packet.payload,
                        );
                    }
                    MediaKind::Video => router.route_video(&packet, Instant::now()).await,
                }
            }
        }
    }

    router.clear().await;
    debug!(
        "Router stopped ({} unroutable video packets)",
        router.dropped_packets()
    );
}
