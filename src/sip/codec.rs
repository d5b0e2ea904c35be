//! G.711 Audio Codec
//!
//! μ-law (PCMU) and A-law (PCMA) companding. The recorder only needs the
//! decode side to turn RTP payloads into PCM; encode feeds the outbound
//! RTP stream.

use super::config::SipCodec;

/// G.711 codec for encoding/decoding telephone audio
#[derive(Debug, Clone, Copy)]
pub struct G711Codec {
    codec_type: SipCodec,
}

impl G711Codec {
    pub fn new(codec_type: SipCodec) -> Self {
        Self { codec_type }
    }

    pub fn pcmu() -> Self {
        Self::new(SipCodec::Pcmu)
    }

    pub fn pcma() -> Self {
        Self::new(SipCodec::Pcma)
    }

    /// Codec for a static RTP payload type, `None` for anything but 0 / 8
    pub fn for_payload_type(payload_type: u8) -> Option<Self> {
        match payload_type {
            0 => Some(Self::pcmu()),
            8 => Some(Self::pcma()),
            _ => None,
        }
    }

    /// Encode 16-bit PCM samples to G.711
    pub fn encode(&self, pcm: &[i16]) -> Vec<u8> {
        match self.codec_type {
            SipCodec::Pcmu => pcm.iter().map(|&s| linear_to_ulaw(s)).collect(),
            SipCodec::Pcma => pcm.iter().map(|&s| linear_to_alaw(s)).collect(),
        }
    }

    /// Decode G.711 to 16-bit PCM samples
    pub fn decode(&self, encoded: &[u8]) -> Vec<i16> {
        match self.codec_type {
            SipCodec::Pcmu => encoded.iter().map(|&b| ulaw_to_linear(b)).collect(),
            SipCodec::Pcma => encoded.iter().map(|&b| alaw_to_linear(b)).collect(),
        }
    }

    pub fn payload_type(&self) -> u8 {
        self.codec_type.payload_type()
    }
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Segment (exponent) of a biased magnitude, 0..=7
fn segment(magnitude: i32) -> u8 {
    let mut exponent = 7u8;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    exponent
}

fn linear_to_ulaw(sample: i16) -> u8 {
    let sample = sample as i32;
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let magnitude = sample.abs().min(ULAW_CLIP) + ULAW_BIAS;

    let exponent = segment(magnitude);
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

fn ulaw_to_linear(ulaw: u8) -> i16 {
    let ulaw = !ulaw;
    let sign = ulaw & 0x80;
    let exponent = ((ulaw >> 4) & 0x07) as i32;
    let mantissa = (ulaw & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;

    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn linear_to_alaw(sample: i16) -> u8 {
    let sample = sample as i32;
    let sign: u8 = if sample < 0 { 0x00 } else { 0x80 };
    let magnitude = sample.abs().min(32767);

    let (exponent, mantissa) = if magnitude >= 256 {
        let exponent = segment(magnitude);
        (exponent, ((magnitude >> (exponent + 3)) & 0x0F) as u8)
    } else {
        (0, ((magnitude >> 4) & 0x0F) as u8)
    };

    (sign | (exponent << 4) | mantissa) ^ 0x55
}

fn alaw_to_linear(alaw: u8) -> i16 {
    let alaw = alaw ^ 0x55;
    let sign = alaw & 0x80;
    let exponent = ((alaw >> 4) & 0x07) as i32;
    let mantissa = (alaw & 0x0F) as i32;

    let magnitude = if exponent > 0 {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    } else {
        (mantissa << 4) + 0x08
    };

    if sign == 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}
