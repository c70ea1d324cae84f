//! Minimal RIFF/WAVE container for raw PCM.
//!
//! Layout: 44-byte canonical header (`RIFF`, `WAVE`, 16-byte `fmt ` chunk,
//! `data` chunk) followed by the samples, all integers little-endian.

use crate::error::{VoiceError, VoiceResult};

/// Size of the canonical header written by [`encode_pcm`].
pub const HEADER_LEN: usize = 44;

const PCM_FORMAT: u16 = 1;

/// Parameters describing a raw PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, bits_per_sample: u16, channels: u16) -> Self {
        Self {
            sample_rate,
            bits_per_sample,
            channels,
        }
    }

    /// Reject formats whose header fields would be zero, fractional or
    /// out of range.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.bits_per_sample == 0 {
            return Err(VoiceError::Config(format!(
                "audio format fields must be non-zero: {self:?}"
            )));
        }
        if self.bits_per_sample % 8 != 0 {
            return Err(VoiceError::Config(format!(
                "bits_per_sample must be a multiple of 8, got {}",
                self.bits_per_sample
            )));
        }
        let block_align = u32::from(self.channels) * u32::from(self.bits_per_sample) / 8;
        if u16::try_from(block_align).is_err() {
            return Err(VoiceError::Config(format!(
                "block align {block_align} does not fit in 16 bits"
            )));
        }
        if u32::try_from(u64::from(self.sample_rate) * u64::from(block_align)).is_err() {
            return Err(VoiceError::Config(format!(
                "byte rate for {} Hz x {block_align} bytes does not fit in 32 bits",
                self.sample_rate
            )));
        }
        Ok(())
    }

    /// Bytes per sample frame. Saturates for formats [`validate`](Self::validate) rejects.
    pub fn block_align(&self) -> u16 {
        let align = u32::from(self.channels) * u32::from(self.bits_per_sample) / 8;
        u16::try_from(align).unwrap_or(u16::MAX)
    }

    /// Bytes per second. Saturates for formats [`validate`](Self::validate) rejects.
    pub fn byte_rate(&self) -> u32 {
        let rate = u64::from(self.sample_rate) * u64::from(self.block_align());
        u32::try_from(rate).unwrap_or(u32::MAX)
    }
}

impl Default for PcmFormat {
    /// 16 kHz, 16-bit, mono: what the browser capture produces.
    fn default() -> Self {
        Self::new(16_000, 16, 1)
    }
}

/// Wrap raw PCM samples in a WAV container.
pub fn encode_pcm(pcm: &[u8], format: PcmFormat) -> Vec<u8> {
    let data_size = pcm.len() as u32;
    let mut out = Vec::with_capacity(HEADER_LEN + pcm.len());

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&PCM_FORMAT.to_le_bytes());
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&format.byte_rate().to_le_bytes());
    out.extend_from_slice(&format.block_align().to_le_bytes());
    out.extend_from_slice(&format.bits_per_sample.to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}
