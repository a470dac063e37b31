//! Sample conversions between the device's native format and the mono
//! 16-bit wire format.

pub fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

pub fn to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Average interleaved multi-channel audio down to mono
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Fill interleaved `out` by copying each mono sample to every channel
///
/// Channels with no sample left are filled with silence. Returns how many
/// mono samples were consumed.
pub fn fill_interleaved(
    out: &mut [f32],
    channels: u16,
    mut next: impl FnMut() -> Option<f32>,
) -> usize {
    let ch = channels.max(1) as usize;
    let mut consumed = 0;
    for frame in out.chunks_mut(ch) {
        let sample = match next() {
            Some(s) => {
                consumed += 1;
                s
            }
            None => 0.0,
        };
        frame.fill(sample);
    }
    consumed
}

/// Linear-interpolation resampler, used in both directions
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio).round() as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}
