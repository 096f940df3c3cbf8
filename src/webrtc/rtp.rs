//! H264 RTP packetization (RFC 6184)
//!
//! Outbound: Annex-B access units are split into single-NAL or FU-A packets
//! stamped with the stream's payload type and SSRC. Inbound: payloads go
//! through the rtp crate's depacketizer, which yields Annex-B bytes.

use bytes::{BufMut, Bytes, BytesMut};
use rtp::codecs::h264::H264Packet;
use rtp::header::Header;
use rtp::packet::Packet;
use rtp::packetizer::Depacketizer;
use tracing::trace;

use crate::session::StreamKind;
use crate::video::nal::{self, NalType};

/// Default maximum RTP payload size (conservative for most networks)
pub const RTP_MTU: usize = 1200;

/// H264 clock rate (always 90kHz per RFC 6184)
pub const H264_CLOCK_RATE: u32 = 90000;

/// FU indicator + FU header
const FU_A_HEADER_SIZE: usize = 2;
const FU_A_TYPE: u8 = 28;

/// Per-stream outbound packetizer state
#[derive(Debug)]
pub struct H264Packetizer {
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    timestamp: u32,
    frame_duration: u32,
    max_payload: usize,
    cached_sps: Option<Bytes>,
    cached_pps: Option<Bytes>,
}

impl H264Packetizer {
    pub fn new(kind: StreamKind, ssrc: u32, fps: u32, max_payload: usize) -> Self {
        Self {
            payload_type: kind.payload_type(),
            ssrc,
            sequence_number: rand::random(),
            timestamp: rand::random(),
            frame_duration: H264_CLOCK_RATE / fps.max(1),
            max_payload: max_payload.max(FU_A_HEADER_SIZE + 1),
            cached_sps: None,
            cached_pps: None,
        }
    }

    /// Start from fixed sequence/timestamp values
    pub fn with_initial(mut self, sequence_number: u16, timestamp: u32) -> Self {
        self.sequence_number = sequence_number;
        self.timestamp = timestamp;
        self
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Packetize one Annex-B access unit and advance the RTP clock by one
    /// frame. AUD and filler NAL units are dropped; cached SPS/PPS are
    /// inserted before an IDR that arrives without them.
    pub fn packetize(&mut self, access_unit: &Bytes) -> Vec<Packet> {
        let mut units: Vec<Bytes> = Vec::new();
        let mut has_sps = false;
        let mut has_pps = false;
        let mut has_idr = false;

        for unit in nal::find_nal_units(access_unit) {
            let code_len = unit.len() - nal::strip_start_code(&unit).len();
            let body = unit.slice(code_len..);
            match NalType::from_header(body[0]) {
                NalType::Aud | NalType::Filler => continue,
                NalType::Sps => {
                    has_sps = true;
                    self.cached_sps = Some(body.clone());
                }
                NalType::Pps => {
                    has_pps = true;
                    self.cached_pps = Some(body.clone());
                }
                NalType::IdrSlice => has_idr = true,
                _ => {}
            }
            units.push(body);
        }

        if has_idr && !(has_sps && has_pps) {
            let mut prefix = Vec::with_capacity(2);
            if !has_sps {
                if let Some(sps) = &self.cached_sps {
                    prefix.push(sps.clone());
                }
            }
            if !has_pps {
                if let Some(pps) = &self.cached_pps {
                    prefix.push(pps.clone());
                }
            }
            if !prefix.is_empty() {
                trace!("Injecting {} cached parameter sets before IDR", prefix.len());
                prefix.extend(units);
                units = prefix;
            }
        }

        let mut packets = Vec::new();
        let count = units.len();
        for (i, unit) in units.iter().enumerate() {
            self.packetize_nal(unit, i + 1 == count, &mut packets);
        }

        self.timestamp = self.timestamp.wrapping_add(self.frame_duration);
        packets
    }

    fn packetize_nal(&mut self, unit: &Bytes, last_in_au: bool, out: &mut Vec<Packet>) {
        if unit.len() <= self.max_payload {
            let packet = self.packet(unit.clone(), last_in_au);
            out.push(packet);
            return;
        }

        let header = unit[0];
        let fu_indicator = (header & 0xE0) | FU_A_TYPE;
        let nal_type = header & 0x1F;
        let chunk_size = self.max_payload - FU_A_HEADER_SIZE;

        let body = &unit[1..];
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk_size).min(body.len());
            let first = offset == 0;
            let last = end == body.len();

            let mut fu_header = nal_type;
            if first {
                fu_header |= 0x80;
            }
            if last {
                fu_header |= 0x40;
            }

            let mut payload = BytesMut::with_capacity(FU_A_HEADER_SIZE + end - offset);
            payload.put_u8(fu_indicator);
            payload.put_u8(fu_header);
            payload.put_slice(&body[offset..end]);

            let packet = self.packet(payload.freeze(), last_in_au && last);
            out.push(packet);
            offset = end;
        }
    }

    fn packet(&mut self, payload: Bytes, marker: bool) -> Packet {
        let packet = Packet {
            header: Header {
                version: 2,
                marker,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload,
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        packet
    }
}

/// Inbound RFC 6184 depacketizer producing Annex-B bytes
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    inner: H264Packet,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Annex-B bytes carried by `payload`. FU-A start/middle fragments and
    /// malformed payloads yield an empty buffer.
    pub fn depacketize(&mut self, payload: &Bytes) -> Bytes {
        if payload.is_empty() {
            return Bytes::new();
        }
        match self.inner.depacketize(payload) {
            Ok(out) => out,
            Err(e) => {
                trace!("Dropping undecodable H264 payload: {}", e);
                Bytes::new()
            }
        }
    }

    /// Forget any partially received FU-A
    pub fn reset(&mut self) {
        self.inner = H264Packet::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::FrameAssembler;

    fn idr_of_len(len: usize) -> Vec<u8> {
        let mut nal = vec![0x65];
        nal.extend((1..len).map(|i| (i % 251) as u8));
        nal
    }

    fn annexb(units: &[&[u8]]) -> Bytes {
        let mut out = BytesMut::new();
        for u in units {
            out.put_slice(&nal::START_CODE);
            out.put_slice(u);
        }
        out.freeze()
    }

    #[test]
    fn test_small_nal_single_packet() {
        let mut p = H264Packetizer::new(StreamKind::Camera, 1234, 30, 1200).with_initial(10, 0);
        let packets = p.packetize(&annexb(&[&[0x41, 1, 2, 3]]));

        assert_eq!(packets.len(), 1);
        let pkt = &packets[0];
        assert_eq!(pkt.header.payload_type, 96);
        assert_eq!(pkt.header.ssrc, 1234);
        assert_eq!(pkt.header.sequence_number, 10);
        assert!(pkt.header.marker);
        assert_eq!(&pkt.payload[..], &[0x41, 1, 2, 3]);
    }

    #[test]
    fn test_screen_share_fu_a_reassembles_exactly() {
        let nal_unit = idr_of_len(3000);
        let mut p = H264Packetizer::new(StreamKind::Screen, 42, 30, 1400).with_initial(0, 0);
        let packets = p.packetize(&annexb(&[&nal_unit]));

        assert!(packets.len() > 1);
        assert!(packets.iter().all(|pkt| pkt.header.payload_type == 97));
        assert!(packets.iter().all(|pkt| pkt.payload.len() <= 1400));
        assert!(packets.iter().all(|pkt| pkt.payload[0] & 0x1F == FU_A_TYPE));

        // Only the final fragment carries the marker bit
        let markers: Vec<bool> = packets.iter().map(|p| p.header.marker).collect();
        assert_eq!(markers.iter().filter(|m| **m).count(), 1);
        assert!(*markers.last().unwrap());

        // Start/end flags
        assert_eq!(packets[0].payload[1] & 0xC0, 0x80);
        assert_eq!(packets.last().unwrap().payload[1] & 0xC0, 0x40);

        let indicator = packets[0].payload[0];
        let fu_header = packets[0].payload[1];
        let mut rebuilt = vec![(indicator & 0xE0) | (fu_header & 0x1F)];
        for pkt in &packets {
            rebuilt.extend_from_slice(&pkt.payload[FU_A_HEADER_SIZE..]);
        }
        assert_eq!(rebuilt, nal_unit);
    }

    #[test]
    fn test_sequence_wraps_and_timestamp_advances() {
        let mut p = H264Packetizer::new(StreamKind::Camera, 1, 15, 1200).with_initial(u16::MAX, 100);
        let first = p.packetize(&annexb(&[&[0x41, 0]]));
        let second = p.packetize(&annexb(&[&[0x41, 1]]));

        assert_eq!(first[0].header.sequence_number, u16::MAX);
        assert_eq!(second[0].header.sequence_number, 0);
        assert_eq!(first[0].header.timestamp, 100);
        assert_eq!(second[0].header.timestamp, 100 + 6000);
    }

    #[test]
    fn test_cached_parameter_sets_injected_before_idr() {
        let sps: &[u8] = &[0x67, 0x42, 0x00, 0x1f];
        let pps: &[u8] = &[0x68, 0xce, 0x38, 0x80];
        let mut p = H264Packetizer::new(StreamKind::Camera, 1, 30, 1200);

        p.packetize(&annexb(&[sps, pps, &[0x65, 0x88]]));
        let packets = p.packetize(&annexb(&[&[0x09, 0x10], &[0x65, 0x99]]));

        let payloads: Vec<&[u8]> = packets.iter().map(|p| &p.payload[..]).collect();
        assert_eq!(payloads, vec![sps, pps, &[0x65, 0x99][..]]);
        assert!(packets[2].header.marker && !packets[0].header.marker);
    }

    #[test]
    fn test_depacketizer_into_assembler_round_trip() {
        let nal_unit = idr_of_len(3000);
        let mut p = H264Packetizer::new(StreamKind::Screen, 7, 30, 1400);
        let packets = p.packetize(&annexb(&[&[0x67, 0x42, 0x00, 0x1f], &nal_unit]));

        let mut depay = H264Depacketizer::new();
        let mut asm = FrameAssembler::new();
        let mut output = None;
        for pkt in &packets {
            let annexb_bytes = depay.depacketize(&pkt.payload);
            if let Some(au) = asm.process_packet(&annexb_bytes, pkt.header.timestamp, pkt.header.marker) {
                output = Some(au);
            }
        }

        let au = output.unwrap();
        let units = nal::find_nal_units(&au);
        assert_eq!(units.len(), 2);
        assert_eq!(nal::strip_start_code(&units[0]), &[0x67, 0x42, 0x00, 0x1f]);
        assert_eq!(nal::strip_start_code(&units[1]), &nal_unit[..]);
    }

    #[test]
    fn test_depacketizer_malformed_payload_is_empty() {
        let mut depay = H264Depacketizer::new();
        assert!(depay.depacketize(&Bytes::new()).is_empty());
        // FU-A header without body
        assert!(depay.depacketize(&Bytes::from_static(&[0x7c])).is_empty());
    }
}
