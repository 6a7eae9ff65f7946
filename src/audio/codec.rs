//! # Audio Transcoding
//!
//! Pure conversions between the telephony codec (G.711 mu-law at 8 kHz) and
//! the linear PCM the AI transport and the dashboards consume.
//!
//! ## Operations:
//! - **decode_mulaw / encode_mulaw**: table-driven expansion and clamped compression
//! - **resample**: linear interpolation with exact integer positioning, so an input
//!   of N samples maps to `round(N * to / from)` output samples
//! - **pcm16_from_bytes / pcm16_to_bytes**: little-endian framing via `byteorder`
//!
//! Nothing here allocates shared state; every function can be called from any
//! adapter task without coordination.

use crate::audio::frame::{AudioFrame, TELEPHONY_SAMPLE_RATE};
use crate::error::{BridgeError, BridgeResult};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

const fn expand(byte: u8) -> i16 {
    let u = !byte;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = expand(i as u8);
        i += 1;
    }
    table
}

static MULAW_DECODE: [i16; 256] = build_decode_table();

/// Expand one companded sample.
#[inline]
pub fn decode_sample(byte: u8) -> i16 {
    MULAW_DECODE[byte as usize]
}

/// Compress one linear sample. Magnitudes above the G.711 clip level are
/// clamped before compression.
pub fn encode_sample(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Companded 8 kHz bytes to linear samples.
pub fn decode_mulaw(companded: &[u8]) -> Vec<i16> {
    companded.iter().map(|&b| decode_sample(b)).collect()
}

/// Linear samples to companded 8 kHz bytes.
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

/// Resample with linear interpolation.
///
/// Output sample `j` sits at source position `j * from / to`; the position is
/// kept as an exact rational so that integer rate ratios reproduce source
/// samples exactly where the grids line up.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() || from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let from = from_rate as u64;
    let to = to_rate as u64;
    let out_len = ((samples.len() as u64 * to + from / 2) / from) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|j| {
            let numerator = j as u64 * from;
            let index = (numerator / to) as usize;
            if index >= last {
                return samples[last];
            }
            let frac = (numerator % to) as f64 / to as f64;
            let a = samples[index] as f64;
            let b = samples[index + 1] as f64;
            clamp_i16(a + (b - a) * frac)
        })
        .collect()
}

fn clamp_i16(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Parse little-endian 16-bit PCM. An odd byte count is a `Decode` error.
pub fn pcm16_from_bytes(data: &[u8]) -> BridgeResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(BridgeError::Decode(format!(
            "PCM16 payload has odd length {}",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut out);
    out
}

/// Companded 8 kHz to little-endian PCM16 at `rate`.
pub fn mulaw_to_pcm16_bytes(companded: &[u8], rate: u32) -> Vec<u8> {
    let linear = decode_mulaw(companded);
    pcm16_to_bytes(&resample(&linear, TELEPHONY_SAMPLE_RATE, rate))
}

/// Little-endian PCM16 at `rate` to companded 8 kHz.
pub fn pcm16_bytes_to_mulaw(data: &[u8], rate: u32) -> BridgeResult<Vec<u8>> {
    let linear = pcm16_from_bytes(data)?;
    Ok(encode_mulaw(&resample(&linear, rate, TELEPHONY_SAMPLE_RATE)))
}

/// Linear samples of a frame at the requested rate.
pub fn frame_to_linear(frame: &AudioFrame, rate: u32) -> Vec<i16> {
    resample(&decode_mulaw(frame.payload()), TELEPHONY_SAMPLE_RATE, rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::REALTIME_SAMPLE_RATE;

    #[test]
    fn test_known_mulaw_values() {
        assert_eq!(decode_sample(0xFF), 0);
        assert_eq!(decode_sample(0x7F), 0);
        assert_eq!(decode_sample(0x80), 32_124);
        assert_eq!(decode_sample(0x00), -32_124);
        assert_eq!(encode_sample(0), 0xFF);
    }

    #[test]
    fn test_mulaw_round_trip_all_codes() {
        for code in 0u8..=255 {
            let linear = decode_sample(code);
            let back = encode_sample(linear);
            // 0x7F and 0xFF are both zero; every other code must survive exactly
            assert!(
                back == code || decode_sample(back) == linear,
                "code {:#04x} came back as {:#04x}",
                code,
                back
            );
        }
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        assert_eq!(encode_sample(i16::MAX), encode_sample(MULAW_CLIP as i16));
        assert_eq!(encode_sample(i16::MIN), encode_sample(-MULAW_CLIP as i16));
    }

    #[test]
    fn test_resample_lengths() {
        assert_eq!(resample(&[0; 160], 8_000, 24_000).len(), 480);
        assert_eq!(resample(&[0; 480], 24_000, 8_000).len(), 160);
        // durations that don't divide evenly stay within one sample
        let up = resample(&[0; 161], 8_000, 24_000).len() as i64;
        assert!((up - 483).abs() <= 1);
        let down = resample(&[0; 101], 24_000, 8_000).len() as i64;
        assert!((down - 34).abs() <= 1);
    }

    #[test]
    fn test_resample_sinusoid_round_trip() {
        let original: Vec<i16> = (0..800)
            .map(|n| {
                let t = n as f64 / 8_000.0;
                (8_000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16
            })
            .collect();

        let up = resample(&original, 8_000, REALTIME_SAMPLE_RATE);
        let back = resample(&up, REALTIME_SAMPLE_RATE, 8_000);

        assert_eq!(back.len(), original.len());
        let max_error = original
            .iter()
            .zip(back.iter())
            .map(|(a, b)| (*a as i32 - *b as i32).abs())
            .max()
            .unwrap();
        assert!(max_error <= 2, "max error {}", max_error);
    }

    #[test]
    fn test_pcm16_odd_length_is_decode_error() {
        let err = pcm16_from_bytes(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
    }

    #[test]
    fn test_pcm16_bytes_round_trip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = pcm16_to_bytes(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(pcm16_from_bytes(&bytes).unwrap(), samples);
    }

    #[test]
    fn test_telephony_to_realtime_pipeline() {
        let frame = vec![0xFFu8; 160];
        let pcm = mulaw_to_pcm16_bytes(&frame, REALTIME_SAMPLE_RATE);
        assert_eq!(pcm.len(), 480 * 2);

        let back = pcm16_bytes_to_mulaw(&pcm, REALTIME_SAMPLE_RATE).unwrap();
        assert_eq!(back, frame);
    }
}
