//! Integer <-> float sample conversion for the network payload.
//!
//! Decoding reads big-endian signed integers and normalizes into [-1, 1].
//! Encoding quantizes with a first-order error-feedback noise shaper fed by
//! uniform dither, so repeated low-level material does not collapse onto the
//! same quantization steps.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub struct SampleCodec {
    /// Bytes per encoded sample.
    unit: usize,
    /// Largest representable sample value, 2^(bits-1) - 1.
    max: f32,
    /// Dither amplitude applied to the uniform draw.
    scale: f32,
    /// Per channel shaper state.
    dither: [[f32; 4]; 8],
    decode: fn(&[u8]) -> i32,
    encode: fn(&mut [u8], i32),
    rng: SmallRng,
}

fn decode16(b: &[u8]) -> i32 {
    i16::from_be_bytes([b[0], b[1]]) as i32
}

fn decode24(b: &[u8]) -> i32 {
    // sign extend through the top byte
    ((b[0] as i8 as i32) << 16) | ((b[1] as i32) << 8) | (b[2] as i32)
}

fn decode32(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn encode16(out: &mut [u8], raw: i32) {
    out[0] = (raw >> 8) as u8;
    out[1] = raw as u8;
}

fn encode24(out: &mut [u8], raw: i32) {
    out[0] = (raw >> 16) as u8;
    out[1] = (raw >> 8) as u8;
    out[2] = raw as u8;
}

fn encode32(out: &mut [u8], raw: i32) {
    out.copy_from_slice(&raw.to_be_bytes());
}

impl SampleCodec {
    pub fn new(bits: u32, seed: u64) -> Self {
        let max = 2f32.powi(bits as i32 - 1) - 1.0;
        let (decode, encode): (fn(&[u8]) -> i32, fn(&mut [u8], i32)) = match bits {
            16 => (decode16 as _, encode16 as _),
            24 => (decode24 as _, encode24 as _),
            _ => (decode32 as _, encode32 as _),
        };

        Self {
            unit: bits as usize / 8,
            max,
            scale: 4.0 / max,
            dither: [[0.0; 4]; 8],
            decode,
            encode,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Decode one sample, saturating to [-1, 1].
    pub fn decode(&self, bytes: &[u8]) -> f32 {
        ((self.decode)(bytes) as f32 / self.max).clamp(-1.0, 1.0)
    }

    /// Decode a whole payload of interleaved samples.
    pub fn decode_payload(&self, bytes: &[u8], out: &mut Vec<f32>) {
        out.clear();
        for sample in bytes.chunks_exact(self.unit) {
            out.push(self.decode(sample));
        }
    }

    /// Quantize interleaved samples into `out`, `channels` wide, with dither
    /// and noise shaping.
    pub fn encode_payload(&mut self, samples: &[f32], channels: usize, out: &mut [u8]) {
        for (lp, (&sample, bytes)) in samples
            .iter()
            .zip(out.chunks_exact_mut(self.unit))
            .enumerate()
        {
            let d = &mut self.dither[lp % channels];

            // scale then fold in the shaper error feedback
            let mut raw = sample * self.max + d[0] - d[1] + d[2];

            // half step bias plus fresh dither, minus the previous noise
            let noise = (self.rng.gen::<f32>() - 0.5) * self.scale;
            let mut samp = (raw + 0.5) + (noise - d[3]);

            if samp > self.max {
                samp = self.max;
                raw = samp;
            } else if samp < -self.max {
                samp = -self.max;
                raw = samp;
            }

            let quant = samp.round_ties_even();

            d[3] = noise;
            d[2] = d[1];
            d[1] = d[0] / 2.0;
            d[0] = raw - quant;

            (self.encode)(bytes, quant as i32);
        }
    }
}
