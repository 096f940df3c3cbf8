//! Microphone capture
//!
//! Samples come from a capture subprocess, either as a bare s16le mono stream
//! or as `MCAP` packets (24-byte header followed by interleaved PCM).

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{CodecProcess, CodecProcessConfig, FrameAccumulator, Framer};
use crate::error::{AppError, Result};

/// One buffer of mono 16-bit samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub duration_ms: u32,
    pub samples: Vec<i16>,
}

impl AudioChunk {
    pub fn new(sample_rate: u32, samples: Vec<i16>) -> Self {
        let duration_ms = if sample_rate == 0 {
            0
        } else {
            (samples.len() as u64 * 1000 / sample_rate as u64) as u32
        };
        Self {
            sample_rate,
            duration_ms,
            samples,
        }
    }
}

/// Microphone that can be paused without tearing down the call
#[async_trait]
pub trait AudioSource: Send {
    /// Next buffer; `None` once the device has stopped. Must not be polled
    /// while paused.
    async fn next_chunk(&mut self) -> Option<AudioChunk>;

    /// Release the device until `resume`
    async fn pause(&mut self) -> Result<()>;

    async fn resume(&mut self) -> Result<()>;

    fn is_paused(&self) -> bool;

    async fn close(&mut self);
}

/// `MCAP` audio packet header (all fields little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McapHeader {
    pub version: u8,
    pub bits_per_sample: u8,
    pub channels: u8,
    pub is_float: bool,
    /// Frames (samples per channel) in the payload
    pub sample_count: u32,
    pub sample_rate: u32,
    pub timestamp_ms: u64,
}

impl McapHeader {
    pub const MAGIC: u32 = 0x4D43_4150;
    pub const VERSION: u8 = 2;
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let mut buf = &data[..Self::SIZE];
        if buf.get_u32_le() != Self::MAGIC {
            return None;
        }
        Some(Self {
            version: buf.get_u8(),
            bits_per_sample: buf.get_u8(),
            channels: buf.get_u8(),
            is_float: buf.get_u8() != 0,
            sample_count: buf.get_u32_le(),
            sample_rate: buf.get_u32_le(),
            timestamp_ms: buf.get_u64_le(),
        })
    }

    /// 16-bit integer PCM of the expected version
    pub fn is_supported(&self) -> bool {
        self.version == Self::VERSION
            && self.bits_per_sample == 16
            && !self.is_float
            && self.channels > 0
    }

    pub fn payload_len(&self) -> usize {
        self.sample_count as usize * self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

/// Cuts an `MCAP` stream into whole packets, resynchronizing on the magic
#[derive(Debug, Default)]
pub struct McapFramer {
    buffer: BytesMut,
    skipped: u64,
}

impl McapFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded while searching for a valid header
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn skip(&mut self, n: usize) {
        self.buffer.advance(n);
        self.skipped += n as u64;
    }
}

impl Framer for McapFramer {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) {
        self.buffer.extend_from_slice(chunk);
        let magic = McapHeader::MAGIC.to_le_bytes();

        loop {
            match self.buffer.windows(4).position(|w| w == magic) {
                Some(0) => {}
                Some(pos) => self.skip(pos),
                None => {
                    // Keep a possible partial magic
                    let keep = self.buffer.len().min(3);
                    let drop = self.buffer.len() - keep;
                    self.skip(drop);
                    return;
                }
            }

            let Some(header) = McapHeader::parse(&self.buffer) else {
                return;
            };
            if !header.is_supported() {
                self.skip(4);
                continue;
            }
            let total = McapHeader::SIZE + header.payload_len();
            if self.buffer.len() < total {
                return;
            }
            out.push(self.buffer.split_to(total).freeze());
        }
    }
}

/// Decode little-endian 16-bit samples
pub fn samples_from_le(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Average interleaved channels into one
pub fn downmix_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Convert one framed `MCAP` packet to a mono chunk
pub fn chunk_from_mcap(packet: &[u8]) -> Option<AudioChunk> {
    let header = McapHeader::parse(packet)?;
    if !header.is_supported() {
        return None;
    }
    let payload = packet.get(McapHeader::SIZE..McapHeader::SIZE + header.payload_len())?;
    let interleaved = samples_from_le(payload);
    let mono = downmix_to_mono(&interleaved, header.channels as usize);
    Some(AudioChunk::new(header.sample_rate, mono))
}

/// Byte layout written by the microphone capture program
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFraming {
    /// Mono s16le at the requested rate
    #[default]
    Raw,
    /// `MCAP` packets
    Mcap,
}

/// Capture program invocation for the microphone
#[derive(Debug, Clone)]
pub struct MicrophoneConfig {
    pub program: String,
    /// Options selecting the device
    pub input: Vec<String>,
    /// Replaces the generated arguments when set
    pub args: Option<Vec<String>>,
    pub framing: AudioFraming,
    pub sample_rate: u32,
    /// Samples per chunk for raw framing
    pub packet_ms: u32,
    pub stop_timeout: Duration,
}

impl MicrophoneConfig {
    fn process_args(&self) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.input.iter().cloned());
        args.extend([
            "-vn".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }

    fn chunk_bytes(&self) -> usize {
        (self.sample_rate as usize * self.packet_ms as usize / 1000).max(1) * 2
    }
}

/// Microphone backed by a capture subprocess; pausing stops the process
pub struct ProcessAudioSource {
    config: MicrophoneConfig,
    running: Option<(CodecProcess, mpsc::Receiver<Bytes>)>,
    chunks: u64,
}

impl ProcessAudioSource {
    pub fn open(config: MicrophoneConfig) -> Result<Self> {
        let mut source = Self {
            config,
            running: None,
            chunks: 0,
        };
        source.start()?;
        info!(
            "Microphone capture started: {}Hz, {:?} framing",
            source.config.sample_rate, source.config.framing
        );
        Ok(source)
    }

    fn start(&mut self) -> Result<()> {
        let process_config = CodecProcessConfig::new(&self.config.program)
            .args(self.config.process_args())
            .stop_timeout(self.config.stop_timeout);
        let spawned = match self.config.framing {
            AudioFraming::Raw => CodecProcess::spawn(
                "microphone capture",
                &process_config,
                FrameAccumulator::new(self.config.chunk_bytes()),
            ),
            AudioFraming::Mcap => {
                CodecProcess::spawn("microphone capture", &process_config, McapFramer::new())
            }
        };
        let running = spawned.map_err(|e| AppError::device_unavailable("microphone", e))?;
        self.running = Some(running);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some((process, _)) = self.running.take() {
            process.stop().await;
        }
    }
}

#[async_trait]
impl AudioSource for ProcessAudioSource {
    async fn next_chunk(&mut self) -> Option<AudioChunk> {
        let framing = self.config.framing;
        let sample_rate = self.config.sample_rate;
        let (_, output) = self.running.as_mut()?;
        loop {
            let packet = output.recv().await?;
            let chunk = match framing {
                AudioFraming::Raw => Some(AudioChunk::new(sample_rate, samples_from_le(&packet))),
                AudioFraming::Mcap => chunk_from_mcap(&packet),
            };
            match chunk {
                Some(chunk) => {
                    self.chunks += 1;
                    return Some(chunk);
                }
                None => warn!("Dropping malformed microphone packet ({} bytes)", packet.len()),
            }
        }
    }

    async fn pause(&mut self) -> Result<()> {
        debug!("Pausing microphone after {} chunks", self.chunks);
        self.stop().await;
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        if self.running.is_none() {
            debug!("Resuming microphone");
            self.start()?;
        }
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.running.is_none()
    }

    async fn close(&mut self) {
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn mcap_packet(channels: u8, frames: &[i16], timestamp_ms: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(McapHeader::MAGIC);
        buf.put_u8(2);
        buf.put_u8(16);
        buf.put_u8(channels);
        buf.put_u8(0);
        buf.put_u32_le((frames.len() / channels as usize) as u32);
        buf.put_u32_le(48000);
        buf.put_u64_le(timestamp_ms);
        for s in frames {
            buf.put_i16_le(*s);
        }
        buf.to_vec()
    }

    #[test]
    fn test_header_layout() {
        let packet = mcap_packet(2, &[1, 2, 3, 4], 1234);
        assert_eq!(&packet[..4], b"PACM");
        let header = McapHeader::parse(&packet).unwrap();
        assert_eq!(header.channels, 2);
        assert_eq!(header.sample_count, 2);
        assert_eq!(header.sample_rate, 48000);
        assert_eq!(header.timestamp_ms, 1234);
        assert_eq!(header.payload_len(), 8);
        assert!(McapHeader::parse(&packet[..23]).is_none());
    }

    #[test]
    fn test_framer_resyncs_and_splits() {
        let a = mcap_packet(2, &[100, 300, -100, -300], 0);
        let b = mcap_packet(1, &[7, 8, 9], 20);
        let mut stream = vec![0xde, 0xad, 0xbe];
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        for size in [1, 5, 64] {
            let mut framer = McapFramer::new();
            let mut out = Vec::new();
            for chunk in stream.chunks(size) {
                framer.push(chunk, &mut out);
            }
            assert_eq!(out.len(), 2, "chunk size {}", size);
            assert_eq!(&out[0][..], &a[..]);
            assert_eq!(&out[1][..], &b[..]);
            assert_eq!(framer.skipped(), 3);
        }
    }

    #[test]
    fn test_stereo_downmix() {
        let chunk = chunk_from_mcap(&mcap_packet(2, &[100, 300, -100, -300], 0)).unwrap();
        assert_eq!(chunk.samples, vec![200, -200]);
        assert_eq!(chunk.sample_rate, 48000);

        let chunk = AudioChunk::new(48000, vec![0; 960]);
        assert_eq!(chunk.duration_ms, 20);
    }

    #[test]
    fn test_raw_args() {
        let config = MicrophoneConfig {
            program: "ffmpeg".to_string(),
            input: vec!["-f".into(), "pulse".into(), "-i".into(), "default".into()],
            args: None,
            framing: AudioFraming::Raw,
            sample_rate: 48000,
            packet_ms: 20,
            stop_timeout: Duration::from_secs(1),
        };
        assert_eq!(config.chunk_bytes(), 1920);
        let args = config.process_args();
        assert!(args.windows(2).any(|w| w[0] == "-ar" && w[1] == "48000"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pause_releases_device() {
        let config = MicrophoneConfig {
            program: "cat".to_string(),
            input: vec![],
            args: Some(vec!["/dev/zero".to_string()]),
            framing: AudioFraming::Raw,
            sample_rate: 8000,
            packet_ms: 20,
            stop_timeout: Duration::from_millis(300),
        };
        let mut source = ProcessAudioSource::open(config).unwrap();
        let chunk = source.next_chunk().await.unwrap();
        assert_eq!(chunk.samples.len(), 160);
        assert_eq!(chunk.duration_ms, 20);

        source.pause().await.unwrap();
        assert!(source.is_paused());
        assert!(source.next_chunk().await.is_none());

        source.resume().await.unwrap();
        assert!(!source.is_paused());
        assert!(source.next_chunk().await.is_some());
        source.close().await;
    }
}
