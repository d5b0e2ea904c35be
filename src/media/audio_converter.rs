//! Audio Format Converter
//!
//! Turns recorded PCM chunks into the WAV artifact uploaded with the CDR.

use std::io::Cursor;

use bytes::Bytes;

use super::MediaError;

pub struct AudioConverter;

impl AudioConverter {
    /// Convert PCM samples to WAV format.
    ///
    /// Stereo samples must be interleaved `[L, R, L, R, ...]`.
    pub fn pcm_to_wav(
        pcm_samples: &[i16],
        sample_rate: u32,
        channels: u16,
    ) -> Result<Vec<u8>, MediaError> {
        if channels == 0 || channels > 2 {
            return Err(MediaError::Encoding(format!(
                "Invalid number of channels: {}. Must be 1 (mono) or 2 (stereo)",
                channels
            )));
        }
        if sample_rate == 0 {
            return Err(MediaError::Encoding(
                "Invalid sample rate: must be greater than 0".to_string(),
            ));
        }
        if pcm_samples.is_empty() {
            return Err(MediaError::Encoding(
                "Cannot convert empty audio samples".to_string(),
            ));
        }

        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| MediaError::Encoding(format!("Failed to create WAV writer: {}", e)))?;
        for &sample in pcm_samples {
            writer
                .write_sample(sample)
                .map_err(|e| MediaError::Encoding(format!("Failed to write sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| MediaError::Encoding(format!("Failed to finalize WAV: {}", e)))?;

        Ok(cursor.into_inner())
    }

    /// Assemble little-endian PCM chunks into one WAV file
    pub fn chunks_to_wav(
        chunks: &[Bytes],
        sample_rate: u32,
        channels: u16,
    ) -> Result<Vec<u8>, MediaError> {
        let samples: Vec<i16> = chunks
            .iter()
            .flat_map(|chunk| {
                chunk
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            })
            .collect();
        Self::pcm_to_wav(&samples, sample_rate, channels)
    }

    /// Duration in seconds of `sample_count` interleaved samples
    pub fn calculate_duration(sample_count: usize, sample_rate: u32, channels: u16) -> f64 {
        if sample_rate == 0 || channels == 0 {
            return 0.0;
        }
        (sample_count / channels as usize) as f64 / sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_back(wav: &[u8]) -> (hound::WavSpec, Vec<i16>) {
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        let samples = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        (spec, samples)
    }

    #[test]
    fn test_pcm_to_wav_mono() {
        let wav = AudioConverter::pcm_to_wav(&[0, 100, -100, i16::MAX], 8000, 1).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44 byte header + 4 samples * 2 bytes
        assert_eq!(wav.len(), 52);

        let (spec, samples) = read_back(&wav);
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(spec.channels, 1);
        assert_eq!(samples, vec![0, 100, -100, i16::MAX]);
    }

    #[test]
    fn test_pcm_to_wav_rejects_bad_input() {
        assert!(AudioConverter::pcm_to_wav(&[], 8000, 1).is_err());
        assert!(AudioConverter::pcm_to_wav(&[1], 0, 1).is_err());
        assert!(AudioConverter::pcm_to_wav(&[1], 8000, 3).is_err());
    }

    #[test]
    fn test_chunks_to_wav_concatenates_in_order() {
        let first = Bytes::from([1i16, 2].iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<u8>>());
        let second = Bytes::from((-3i16).to_le_bytes().to_vec());

        let wav = AudioConverter::chunks_to_wav(&[first, second], 8000, 1).unwrap();
        let (_, samples) = read_back(&wav);
        assert_eq!(samples, vec![1, 2, -3]);
    }

    #[test]
    fn test_calculate_duration() {
        assert_eq!(AudioConverter::calculate_duration(8000, 8000, 1), 1.0);
        assert_eq!(AudioConverter::calculate_duration(16000, 8000, 2), 1.0);
        assert_eq!(AudioConverter::calculate_duration(100, 0, 1), 0.0);
    }
}
