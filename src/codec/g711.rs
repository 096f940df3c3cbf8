//! G.711 companding (PCMU / PCMA)
//!
//! 16-bit linear PCM at 8 kHz to one byte per sample and back.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// G.711 always runs at 8 kHz
pub const G711_SAMPLE_RATE: u32 = 8000;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// End of each A-law segment in 13-bit magnitude
const ALAW_SEG_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// Companding law, named after its RTP encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum G711Variant {
    /// µ-law, static payload type 0
    Pcmu,
    /// A-law, static payload type 8
    Pcma,
}

impl G711Variant {
    pub fn payload_type(self) -> u8 {
        match self {
            G711Variant::Pcmu => 0,
            G711Variant::Pcma => 8,
        }
    }

    /// MIME type as registered with the media engine
    pub fn mime_type(self) -> &'static str {
        match self {
            G711Variant::Pcmu => "audio/PCMU",
            G711Variant::Pcma => "audio/PCMA",
        }
    }

    pub fn from_payload_type(pt: u8) -> Option<Self> {
        match pt {
            0 => Some(G711Variant::Pcmu),
            8 => Some(G711Variant::Pcma),
            _ => None,
        }
    }
}

impl Default for G711Variant {
    fn default() -> Self {
        G711Variant::Pcmu
    }
}

/// Stateless G.711 encoder/decoder
#[derive(Debug, Clone, Copy)]
pub struct G711Codec {
    variant: G711Variant,
}

impl G711Codec {
    pub fn new(variant: G711Variant) -> Self {
        Self { variant }
    }

    pub fn variant(&self) -> G711Variant {
        self.variant
    }

    pub fn encode(&self, pcm: &[i16]) -> Bytes {
        let encoded: Vec<u8> = match self.variant {
            G711Variant::Pcmu => pcm.iter().map(|&s| linear_to_ulaw(s)).collect(),
            G711Variant::Pcma => pcm.iter().map(|&s| linear_to_alaw(s)).collect(),
        };
        Bytes::from(encoded)
    }

    pub fn decode(&self, encoded: &[u8]) -> Vec<i16> {
        match self.variant {
            G711Variant::Pcmu => encoded.iter().map(|&b| ulaw_to_linear(b)).collect(),
            G711Variant::Pcma => encoded.iter().map(|&b| alaw_to_linear(b)).collect(),
        }
    }
}

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte as i32;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let Some(seg) = ALAW_SEG_END.iter().position(|&end| pcm <= end) else {
        return (0x7F ^ mask) as u8;
    };

    let quant = if seg < 2 { pcm >> 1 } else { pcm >> seg };
    ((((seg as i32) << 4) | (quant & 0x0F)) ^ mask) as u8
}

pub fn alaw_to_linear(byte: u8) -> i16 {
    let a = (byte ^ 0x55) as i32;
    let mut t = (a & 0x0F) << 4;
    let seg = (a & 0x70) >> 4;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    if a & 0x80 != 0 {
        t as i16
    } else {
        -t as i16
    }
}
