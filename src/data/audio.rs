use std::path::Path;

use crate::error::{Error, Result};

/// Decodes a WAV file into samples in `[-1, 1]` and its sample rate.
/// Multi-channel files are averaged down to mono.
pub fn read_wav(path: &Path) -> Result<(Vec<f64>, u32)> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| Error::Audio(format!("failed to read WAV file '{}': {e}", path.display())))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(Error::Audio(format!("'{}' has sample rate 0", path.display())));
    }

    let interleaved: Vec<f64> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f64;
            reader.samples::<i32>()
                .map(|s| s.map(|v| v as f64 / max_val))
                .collect::<std::result::Result<_, _>>()?
        }
        hound::SampleFormat::Float => reader.samples::<f32>()
            .map(|s| s.map(f64::from))
            .collect::<std::result::Result<_, _>>()?,
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved.chunks(channels)
            .map(|frame| frame.iter().sum::<f64>() / frame.len() as f64)
            .collect()
    };
    Ok((samples, spec.sample_rate))
}

/// Writes mono 16-bit PCM.
pub fn write_wav(path: &Path, samples: &[f64], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f64).round() as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_round_trip_within_quantization() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f64> = (0..80).map(|i| (i as f64 * 0.3).sin() * 0.5).collect();
        write_wav(&path, &samples, 8000).unwrap();
        let (decoded, sr) = read_wav(&path).unwrap();
        assert_eq!(sr, 8000);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in decoded.iter().zip(&samples) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn missing_file_is_an_audio_error() {
        let err = read_wav(Path::new("/nonexistent/x.wav")).unwrap_err();
        assert!(matches!(err, Error::Audio(_)));
    }
}
