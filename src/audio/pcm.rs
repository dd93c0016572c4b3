//! PCM sample helpers: byte conversion, gain, resampling and edge fades.
//!
//! All pipeline audio is signed 16-bit linear PCM, mono. Byte order at
//! service boundaries is little-endian.

/// Converts samples to little-endian bytes for the wire.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Converts little-endian bytes back to samples. A trailing odd byte is
/// dropped.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Applies a linear gain in place, saturating at the i16 range.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = (*sample as f32 * gain).round();
        *sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// Linear-interpolation resampler.
///
/// Applied once at output-stage start when the device refuses 24kHz; never
/// mid-session.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = source_pos.floor() as usize;
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[samples.len() - 1]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

/// Linear fade-in over the first `fade_samples` samples, in place.
pub fn fade_in(samples: &mut [i16], fade_samples: usize) {
    let n = fade_samples.min(samples.len());
    for (i, sample) in samples.iter_mut().take(n).enumerate() {
        let scale = i as f32 / n as f32;
        *sample = (*sample as f32 * scale) as i16;
    }
}

/// Linear fade-out over the last `fade_samples` samples, in place.
pub fn fade_out(samples: &mut [i16], fade_samples: usize) {
    let len = samples.len();
    let n = fade_samples.min(len);
    for i in 0..n {
        let scale = (n - 1 - i) as f32 / n as f32;
        let idx = len - n + i;
        samples[idx] = (samples[idx] as f32 * scale) as i16;
    }
}
