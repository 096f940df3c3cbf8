//! RTP payload to H264 access unit reassembly
//!
//! One `FrameAssembler` exists per logical inbound stream (participant, kind).
//! Payloads are appended in arrival order; the packet carrying the RTP marker
//! bit completes the access unit.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

/// Upper bound on a single buffered access unit
const MAX_ACCESS_UNIT_SIZE: usize = 8 * 1024 * 1024;

/// Accumulates RTP payloads for one logical stream
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    /// RTP timestamp of the access unit currently being buffered
    timestamp: Option<u32>,
    /// Partial access units thrown away because a new timestamp arrived first
    discarded: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            timestamp: None,
            discarded: 0,
        }
    }

    /// Feed one RTP payload.
    ///
    /// Returns the complete access unit when `marker` is set and at least one
    /// byte has been buffered for it. A payload whose timestamp differs from
    /// the buffered one starts a new access unit; the stale partial one is
    /// dropped since its final packet was lost.
    pub fn process_packet(&mut self, payload: &[u8], timestamp: u32, marker: bool) -> Option<Bytes> {
        if let Some(current) = self.timestamp {
            if current != timestamp && !self.buffer.is_empty() {
                debug!(
                    "Dropping {} byte partial access unit (ts {} superseded by {})",
                    self.buffer.len(),
                    current,
                    timestamp
                );
                self.buffer.clear();
                self.discarded += 1;
            }
        }
        self.timestamp = Some(timestamp);

        if self.buffer.len() + payload.len() > MAX_ACCESS_UNIT_SIZE {
            debug!(
                "Access unit exceeds {} bytes, discarding",
                MAX_ACCESS_UNIT_SIZE
            );
            self.buffer.clear();
            self.discarded += 1;
            return None;
        }
        self.buffer.extend_from_slice(payload);

        if !marker {
            return None;
        }

        self.timestamp = None;
        if self.buffer.is_empty() {
            trace!("Marker packet with no buffered data at ts {}", timestamp);
            return None;
        }

        Some(self.buffer.split().freeze())
    }

    /// Discard any buffered partial access unit
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.timestamp = None;
    }

    /// Bytes currently buffered for the in-progress access unit
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_concatenation_on_marker() {
        let mut asm = FrameAssembler::new();
        let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 10 + i as usize]).collect();

        for p in &payloads[..4] {
            assert!(asm.process_packet(p, 3000, false).is_none());
        }
        let au = asm.process_packet(&payloads[4], 3000, true).unwrap();

        let expected: Vec<u8> = payloads.concat();
        assert_eq!(&au[..], &expected[..]);
        assert_eq!(asm.buffered_len(), 0);
    }

    #[test]
    fn test_single_packet_access_unit() {
        let mut asm = FrameAssembler::new();
        let au = asm.process_packet(&[0, 0, 0, 1, 0x65, 0x88], 90, true).unwrap();
        assert_eq!(&au[..], &[0, 0, 0, 1, 0x65, 0x88]);
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut asm = FrameAssembler::new();
        asm.process_packet(&[1, 2, 3], 100, false);
        asm.process_packet(&[4, 5], 100, false);
        asm.reset();
        assert_eq!(asm.buffered_len(), 0);

        asm.process_packet(&[7], 100, false);
        let au = asm.process_packet(&[8, 9], 100, true).unwrap();
        assert_eq!(&au[..], &[7, 8, 9]);
    }

    #[test]
    fn test_empty_payloads_never_emit() {
        let mut asm = FrameAssembler::new();
        assert!(asm.process_packet(&[], 10, false).is_none());
        assert!(asm.process_packet(&[], 10, true).is_none());

        // Empty payloads in the middle are no-ops
        asm.process_packet(&[1], 20, false);
        asm.process_packet(&[], 20, false);
        let au = asm.process_packet(&[2], 20, true).unwrap();
        assert_eq!(&au[..], &[1, 2]);
    }

    #[test]
    fn test_timestamp_change_drops_stale_partial() {
        let mut asm = FrameAssembler::new();
        asm.process_packet(&[0xaa, 0xbb], 1000, false);
        // Marker for ts 1000 was lost; next frame starts
        asm.process_packet(&[0x01], 4000, false);
        let au = asm.process_packet(&[0x02], 4000, true).unwrap();
        assert_eq!(&au[..], &[0x01, 0x02]);
        assert_eq!(asm.discarded_count(), 1);
    }

    #[test]
    fn test_consecutive_access_units_are_independent() {
        let mut asm = FrameAssembler::new();
        let first = asm.process_packet(&[1, 1], 0, true).unwrap();
        let second = asm.process_packet(&[2, 2], 3000, true).unwrap();
        assert_eq!(&first[..], &[1, 1]);
        assert_eq!(&second[..], &[2, 2]);
    }
}
