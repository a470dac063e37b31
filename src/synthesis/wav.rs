use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::audio::AudioFrame;

/// Write PCM frames to a 16-bit mono WAV file
///
/// Returns the number of samples written.
pub fn write_wav(path: impl AsRef<Path>, frames: &[AudioFrame], sample_rate: u32) -> Result<usize> {
    let path = path.as_ref();
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {:?}", path))?;

    let mut written = 0usize;
    for frame in frames {
        for sample in frame.samples() {
            writer
                .write_sample(sample)
                .context("Failed to write sample to WAV")?;
            written += 1;
        }
    }

    writer.finalize().context("Failed to finalize WAV file")?;

    info!("Wrote {} samples to {:?}", written, path);

    Ok(written)
}
