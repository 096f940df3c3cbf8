//! Remote stream decoding
//!
//! Each remote (participant, kind) stream owns a [`DecoderState`]. The first
//! time both SPS and PPS are known, a decoder is selected once: hardware when a
//! backend is available and initializes, software otherwise. A hardware
//! initialization failure is permanent for the stream.

pub mod software;

pub use software::{SoftwareDecoder, SoftwareDecoderConfig, SubmitOutcome};

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::events::{CallEvent, EventBus};
use crate::session::{StreamKind, UserId};
use crate::utils::LogThrottler;
use crate::video::format::Resolution;
use crate::video::nal::{self, NalType};

/// Platform decoder rendering straight to a surface
pub trait HardwareDecoder: Send {
    fn name(&self) -> &str;

    /// Configure for the given picture size and parameter sets (no start codes)
    fn initialize(&mut self, width: u32, height: u32, sps: &[u8], pps: &[u8]) -> bool;

    /// Decode one VCL NAL unit (no start code) and present the result
    fn decode_and_render(&mut self, nal_unit: &[u8], is_keyframe: bool) -> bool;

    fn dispose(&mut self);
}

/// Creates hardware decoders for new streams
pub trait HardwareDecoderBackend: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    fn create(&self, user_id: &str, kind: StreamKind) -> Option<Box<dyn HardwareDecoder>>;
}

/// Backend used when no platform decoder is compiled in
#[derive(Debug, Default)]
pub struct NoHardwareBackend;

impl HardwareDecoderBackend for NoHardwareBackend {
    fn name(&self) -> &str {
        "none"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn create(&self, _user_id: &str, _kind: StreamKind) -> Option<Box<dyn HardwareDecoder>> {
        None
    }
}

/// Process-wide result of probing decode capabilities
#[derive(Debug, Clone, Serialize)]
pub struct DecoderProbe {
    pub hardware_backend: Option<String>,
    pub software_program: String,
    pub software_available: bool,
}

impl DecoderProbe {
    /// Probe once per process; later calls return the first result
    pub fn global(software_program: &str) -> &'static DecoderProbe {
        static INSTANCE: OnceLock<DecoderProbe> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let probe = Self::run(&NoHardwareBackend, software_program);
            info!(
                "Decoder probe: hardware={}, software {} available={}",
                probe.hardware_backend.as_deref().unwrap_or("none"),
                probe.software_program,
                probe.software_available
            );
            probe
        })
    }

    pub fn run(backend: &dyn HardwareDecoderBackend, software_program: &str) -> Self {
        Self {
            hardware_backend: backend.is_available().then(|| backend.name().to_string()),
            software_program: software_program.to_string(),
            software_available: program_in_path(software_program),
        }
    }
}

fn program_in_path(program: &str) -> bool {
    let path = std::path::Path::new(program);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Shared inputs for creating decoders
#[derive(Clone)]
pub struct DecoderContext {
    pub hardware: Arc<dyn HardwareDecoderBackend>,
    pub software: SoftwareDecoderConfig,
    /// Used when the SPS cannot be parsed
    pub fallback_resolution: Resolution,
    pub events: Arc<EventBus>,
}

/// The decoder selected for a stream
pub enum ActiveDecoder {
    Hardware(Box<dyn HardwareDecoder>),
    Software(SoftwareDecoder),
}

impl ActiveDecoder {
    pub fn is_hardware(&self) -> bool {
        matches!(self, ActiveDecoder::Hardware(_))
    }
}

/// Per remote stream decoder bookkeeping
pub struct DecoderState {
    user_id: UserId,
    kind: StreamKind,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    decoder: Option<ActiveDecoder>,
    /// Hardware failed to initialize once; never tried again
    hardware_failed: bool,
    /// Software decoder could not be started or died
    software_failed: bool,
    /// Parameter sets not yet sent to the software decoder
    software_needs_params: bool,
    /// An access unit was refused; skip until the next IDR
    awaiting_keyframe: bool,
    hardware_init_attempts: u32,
    frames_submitted: u64,
    frames_dropped: u64,
    throttler: LogThrottler,
}

impl DecoderState {
    pub fn new(user_id: UserId, kind: StreamKind) -> Self {
        Self {
            user_id,
            kind,
            sps: None,
            pps: None,
            decoder: None,
            hardware_failed: false,
            software_failed: false,
            software_needs_params: false,
            awaiting_keyframe: false,
            hardware_init_attempts: 0,
            frames_submitted: 0,
            frames_dropped: 0,
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_initialized(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn hardware_failed(&self) -> bool {
        self.hardware_failed
    }

    pub fn hardware_init_attempts(&self) -> u32 {
        self.hardware_init_attempts
    }

    pub fn is_hardware(&self) -> bool {
        self.decoder.as_ref().is_some_and(ActiveDecoder::is_hardware)
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// The software decoder could not be started, died or stalled
    pub fn software_failed(&self) -> bool {
        self.software_failed
    }

    /// Handle one complete Annex-B access unit
    pub async fn decode_access_unit(&mut self, access_unit: Bytes, ctx: &DecoderContext) {
        let units = nal::find_nal_units(&access_unit);
        if units.is_empty() {
            return;
        }

        let mut keyframe = false;
        for unit in &units {
            let body = nal::strip_start_code(unit);
            match nal::nal_type(unit) {
                Some(NalType::Sps) => self.sps = Some(Bytes::copy_from_slice(body)),
                Some(NalType::Pps) => self.pps = Some(Bytes::copy_from_slice(body)),
                Some(NalType::IdrSlice) => keyframe = true,
                _ => {}
            }
        }

        if self.decoder.is_none() && !self.select_decoder(ctx) {
            return;
        }

        let software_input = match self.decoder {
            Some(ActiveDecoder::Software(_)) if self.software_needs_params => {
                self.with_parameter_sets(&access_unit)
            }
            _ => access_unit,
        };

        let mut software_died = false;
        let mut software_stalled = false;
        let submitted = match self.decoder.as_mut() {
            Some(ActiveDecoder::Hardware(hw)) => {
                let mut ok = true;
                for unit in &units {
                    let Some(t) = nal::nal_type(unit) else { continue };
                    if !t.is_vcl() {
                        continue;
                    }
                    if !hw.decode_and_render(nal::strip_start_code(unit), keyframe) {
                        ok = false;
                    }
                }
                ok
            }
            Some(ActiveDecoder::Software(_)) if self.awaiting_keyframe && !keyframe => false,
            Some(ActiveDecoder::Software(sw)) => match sw.submit(software_input) {
                SubmitOutcome::Queued => {
                    self.software_needs_params = false;
                    self.awaiting_keyframe = false;
                    true
                }
                SubmitOutcome::Full => {
                    // Later slices reference the dropped one
                    self.awaiting_keyframe = true;
                    false
                }
                SubmitOutcome::Stalled => {
                    software_stalled = true;
                    false
                }
                SubmitOutcome::Stopped => {
                    software_died = true;
                    false
                }
            },
            None => false,
        };

        if software_died {
            warn!(
                "Software decoder for {}/{} stopped; stream will not render",
                self.user_id, self.kind
            );
            self.software_failed = true;
            self.dispose().await;
        } else if software_stalled {
            warn!(
                "Software decoder for {}/{} stopped reading input; stream will not render",
                self.user_id, self.kind
            );
            self.software_failed = true;
            ctx.events.publish(CallEvent::PipelineFailed {
                pipeline: format!("decoder {}/{}", self.user_id, self.kind),
                reason: "decoder stalled".to_string(),
            });
            // Stopping waits on the process; keep that off the dispatch path
            if let Some(decoder) = self.decoder.take() {
                tokio::spawn(async move {
                    if let ActiveDecoder::Software(mut sw) = decoder {
                        sw.dispose().await;
                    }
                });
            }
        }

        if submitted {
            self.frames_submitted += 1;
        } else {
            self.frames_dropped += 1;
            let key = format!("decode:{}:{}", self.user_id, self.kind);
            if let Some(suppressed) = self.throttler.check(&key) {
                debug!(
                    suppressed,
                    "Dropped frame for {}/{} (keyframe={})", self.user_id, self.kind, keyframe
                );
            }
        }
    }

    /// Choose hardware or software once SPS and PPS are both cached
    fn select_decoder(&mut self, ctx: &DecoderContext) -> bool {
        if self.software_failed {
            return false;
        }
        let (Some(sps), Some(pps)) = (self.sps.clone(), self.pps.clone()) else {
            debug!(
                "Waiting for parameter sets on {}/{} (sps={}, pps={})",
                self.user_id,
                self.kind,
                self.sps.is_some(),
                self.pps.is_some()
            );
            return false;
        };

        let resolution = nal::parse_sps(&sps)
            .map(|info| Resolution::new(info.width, info.height))
            .filter(|r| !r.is_empty())
            .unwrap_or(ctx.fallback_resolution);

        if !self.hardware_failed && ctx.hardware.is_available() {
            if let Some(mut hw) = ctx.hardware.create(&self.user_id, self.kind) {
                self.hardware_init_attempts += 1;
                if hw.initialize(resolution.width, resolution.height, &sps, &pps) {
                    info!(
                        "Hardware decoder {} ready for {}/{} at {}",
                        hw.name(),
                        self.user_id,
                        self.kind,
                        resolution
                    );
                    self.decoder = Some(ActiveDecoder::Hardware(hw));
                    return true;
                }
                hw.dispose();
                self.hardware_failed = true;
                warn!(
                    "Hardware decoder init failed for {}/{}, using software",
                    self.user_id, self.kind
                );
                ctx.events.publish(CallEvent::DecoderFallback {
                    user_id: self.user_id.clone(),
                    kind: self.kind,
                });
            }
        }

        match SoftwareDecoder::start(
            &ctx.software,
            resolution,
            self.user_id.clone(),
            self.kind,
            ctx.events.clone(),
        ) {
            Ok(sw) => {
                self.decoder = Some(ActiveDecoder::Software(sw));
                self.software_needs_params = true;
                true
            }
            Err(e) => {
                warn!(
                    "Software decoder for {}/{} failed to start: {}",
                    self.user_id, self.kind, e
                );
                self.software_failed = true;
                ctx.events.publish(CallEvent::PipelineFailed {
                    pipeline: format!("decoder {}/{}", self.user_id, self.kind),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Prefix the cached SPS/PPS to an access unit that lacks them
    fn with_parameter_sets(&self, access_unit: &Bytes) -> Bytes {
        let sets = nal::extract_parameter_sets(access_unit);
        if sets.is_complete() {
            return access_unit.clone();
        }
        let mut out = BytesMut::with_capacity(access_unit.len() + 64);
        for set in [&self.sps, &self.pps].into_iter().flatten() {
            out.put_slice(&nal::START_CODE);
            out.put_slice(set);
        }
        out.put_slice(access_unit);
        out.freeze()
    }

    /// Release the decoder; the stream is going away
    pub async fn dispose(&mut self) {
        match self.decoder.take() {
            Some(ActiveDecoder::Hardware(mut hw)) => hw.dispose(),
            Some(ActiveDecoder::Software(mut sw)) => sw.dispose().await,
            None => {}
        }
    }
}
