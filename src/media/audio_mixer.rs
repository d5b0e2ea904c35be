//! Audio Mixer for Call Recording
//!
//! Combines the PCM of the local and remote tracks buffered during one
//! chunk interval into a single recording stream.

use crate::sip::TrackDirection;

/// Audio mixing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixMode {
    /// Mix all tracks into one channel
    #[default]
    Mono,
    /// Left = local party, right = remote party
    Stereo,
}

/// Mixer for the tracks of one call
#[derive(Debug, Clone)]
pub struct AudioMixer {
    mode: MixMode,
    sample_rate: u32,
}

impl AudioMixer {
    pub fn new(mode: MixMode, sample_rate: Option<u32>) -> Self {
        Self {
            mode,
            sample_rate: sample_rate.unwrap_or(8000),
        }
    }

    /// Mix per-track sample runs into one buffer.
    ///
    /// Mono averages the tracks that have a sample at each position, so a
    /// silent direction does not halve the other one. Stereo output is
    /// interleaved `[L, R, L, R, ...]`.
    pub fn mix(&self, tracks: &[(TrackDirection, Vec<i16>)]) -> Vec<i16> {
        match self.mode {
            MixMode::Mono => self.mix_mono(tracks),
            MixMode::Stereo => self.mix_stereo(tracks),
        }
    }

    fn mix_mono(&self, tracks: &[(TrackDirection, Vec<i16>)]) -> Vec<i16> {
        let len = tracks.iter().map(|(_, s)| s.len()).max().unwrap_or(0);
        let mut mixed = Vec::with_capacity(len);

        for i in 0..len {
            let mut sum = 0i32;
            let mut present = 0i32;
            for (_, samples) in tracks {
                if let Some(&sample) = samples.get(i) {
                    sum += sample as i32;
                    present += 1;
                }
            }
            mixed.push((sum / present.max(1)).clamp(i16::MIN as i32, i16::MAX as i32) as i16);
        }

        mixed
    }

    fn mix_stereo(&self, tracks: &[(TrackDirection, Vec<i16>)]) -> Vec<i16> {
        let left = self.mix_mono(&Self::only(tracks, TrackDirection::Local));
        let right = self.mix_mono(&Self::only(tracks, TrackDirection::Remote));
        let len = left.len().max(right.len());

        let mut mixed = Vec::with_capacity(len * 2);
        for i in 0..len {
            mixed.push(left.get(i).copied().unwrap_or(0));
            mixed.push(right.get(i).copied().unwrap_or(0));
        }
        mixed
    }

    fn only(
        tracks: &[(TrackDirection, Vec<i16>)],
        direction: TrackDirection,
    ) -> Vec<(TrackDirection, Vec<i16>)> {
        tracks
            .iter()
            .filter(|(d, _)| *d == direction)
            .cloned()
            .collect()
    }

    /// Get the number of channels (1 for mono, 2 for stereo)
    pub fn channels(&self) -> u16 {
        match self.mode {
            MixMode::Mono => 1,
            MixMode::Stereo => 2,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new(MixMode::Mono, None)
    }
}
