//! Channel downmix and sample-rate conversion for the capture path.
//!
//! The capture device negotiates whatever rate and channel count the
//! hardware prefers; the session input format is fixed 16 kHz mono. Linear
//! interpolation is plenty for speech and keeps this dependency-free.

/// Mix interleaved multi-channel audio down to mono by averaging channels.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

/// Resample mono audio from `from_rate` to `to_rate` by linear interpolation.
///
/// Equal rates are a no-op copy. The output length is
/// `ceil(samples.len() * to_rate / from_rate)`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let sample = match samples.get(idx + 1) {
            Some(&next) => samples[idx] * (1.0 - frac) + next * frac,
            None => *samples.get(idx).unwrap_or(&0.0),
        };
        output.push(sample);
    }

    output
}
