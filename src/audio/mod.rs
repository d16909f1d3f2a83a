//! Audio plumbing between the host callback and the network threads.
//!
//! The system owns the shared FIFO, the payload codec and, when the host
//! device cannot run at the network rate, a sample rate converter sitting on
//! the write path (host->net for the sender, net->host for the receiver).

pub mod codec;
pub mod ring;

use log::error;
use parking_lot::Mutex;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::{Error, Result};
use codec::SampleCodec;
use ring::AudioRing;

/// Frames per converter invocation; input accumulates until a whole chunk
/// is ready because the converter only accepts fixed-size blocks.
const CONVERT_CHUNK: usize = 1024;

pub struct AudioSystem {
    ring: AudioRing,
    codec: Mutex<SampleCodec>,
    converter: Option<Mutex<RateConverter>>,
    channels: usize,
    unit: usize,
}

impl AudioSystem {
    /// `frames` sizes the FIFO; `rate_in`/`rate_out` describe the write path
    /// and engage the converter when they differ.
    pub fn new(
        bits: u32,
        channels: usize,
        frames: usize,
        rate_in: u32,
        rate_out: u32,
        seed: u64,
    ) -> Result<Self> {
        let converter = if rate_in != rate_out {
            Some(Mutex::new(RateConverter::new(rate_in, rate_out, channels)?))
        } else {
            None
        };

        Ok(Self {
            ring: AudioRing::new(channels, frames),
            codec: Mutex::new(SampleCodec::new(bits, seed)),
            converter,
            channels,
            unit: bits as usize / 8,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Write interleaved float frames, converting the rate when needed.
    /// Returns samples accepted by the FIFO.
    pub fn write(&self, data: &[f32]) -> usize {
        match &self.converter {
            None => self.ring.write(data),
            Some(converter) => {
                let mut converter = converter.lock();
                let out = converter.convert(data);
                self.ring.write(out)
            }
        }
    }

    /// Non-blocking read of interleaved float frames; zero-fills on underrun.
    pub fn read(&self, out: &mut [f32]) -> usize {
        self.ring.read(out)
    }

    /// Decode a network payload of big-endian integers and write it.
    pub fn write_int(&self, payload: &[u8]) {
        let mut floats = Vec::with_capacity(payload.len() / self.unit);
        self.codec.lock().decode_payload(payload, &mut floats);

        let whole = floats.len() - floats.len() % self.channels;
        self.write(&floats[..whole]);
    }

    /// Fill `out` with quantized big-endian integers, blocking until a full
    /// buffer of samples is available. Returns false once the FIFO is closed.
    pub fn read_int(&self, out: &mut [u8]) -> bool {
        let samples = out.len() / self.unit;
        let mut floats = vec![0.0f32; samples];

        if !self.ring.read_blocking(&mut floats) {
            return false;
        }

        self.codec
            .lock()
            .encode_payload(&floats, self.channels, out);
        true
    }

    /// Release any thread blocked in `read_int`.
    pub fn close(&self) {
        self.ring.close();
    }
}

/// Sample rate converter wrapping rubato with interleave glue.
///
/// The engine consumes fixed blocks, so incoming frames collect in per
/// channel lanes and convert a whole block at a time; anything shorter waits
/// for the next call.
struct RateConverter {
    inner: SincFixedIn<f32>,
    pending: Vec<Vec<f32>>,
    block: Vec<Vec<f32>>,
    scratch: Vec<f32>,
    channels: usize,
}

impl RateConverter {
    fn new(rate_in: u32, rate_out: u32, channels: usize) -> Result<Self> {
        let ratio = rate_out as f64 / rate_in as f64;
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let inner = SincFixedIn::<f32>::new(ratio, 1.1, params, CONVERT_CHUNK, channels)
            .map_err(|e| Error::AudioHost(format!("failed to create resample engine: {e}")))?;

        // scratch scales by the integer ratio ceiling
        let mult = ratio.ceil().max(1.0) as usize;

        Ok(Self {
            inner,
            pending: vec![Vec::with_capacity(CONVERT_CHUNK * 2); channels],
            block: vec![vec![0.0; CONVERT_CHUNK]; channels],
            scratch: Vec::with_capacity(CONVERT_CHUNK * mult * channels),
            channels,
        })
    }

    /// Feed interleaved samples; returns whatever whole blocks came out,
    /// interleaved (may be empty while input accumulates).
    fn convert(&mut self, input: &[f32]) -> &[f32] {
        let frames = input.len() / self.channels;

        for (ch, lane) in self.pending.iter_mut().enumerate() {
            lane.extend(input.iter().skip(ch).step_by(self.channels).take(frames));
        }

        self.scratch.clear();
        while self.pending[0].len() >= CONVERT_CHUNK {
            for (lane, block) in self.pending.iter_mut().zip(self.block.iter_mut()) {
                block.copy_from_slice(&lane[..CONVERT_CHUNK]);
                lane.drain(..CONVERT_CHUNK);
            }

            match self.inner.process(&self.block, None) {
                Ok(lanes) => {
                    let out_frames = lanes.first().map_or(0, Vec::len);
                    for frame in 0..out_frames {
                        for lane in &lanes {
                            self.scratch.push(lane[frame]);
                        }
                    }
                }
                Err(e) => error!("resample: {e}"),
            }
        }

        &self.scratch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats;

    #[test]
    fn int_write_reaches_float_read() {
        let _guard = stats::test_guard();
        let audio = AudioSystem::new(16, 1, 64, 48000, 48000, 3).unwrap();

        // 0x4000 = 16384 -> 16384/32767
        audio.write_int(&[0x40, 0x00, 0x40, 0x00]);

        let mut out = [0.0f32; 2];
        assert_eq!(audio.read(&mut out), 2);
        let expect = 16384.0 / 32767.0;
        assert!((out[0] - expect).abs() < 1e-6);
        assert!((out[1] - expect).abs() < 1e-6);
    }

    #[test]
    fn float_write_reaches_int_read() {
        let _guard = stats::test_guard();
        let audio = AudioSystem::new(24, 2, 128, 48000, 48000, 3).unwrap();

        let frames = vec![0.5f32; 32];
        audio.write(&frames);

        let mut wire = vec![0u8; 32 * 3];
        assert!(audio.read_int(&mut wire));

        let codec = SampleCodec::new(24, 0);
        let decoded = codec.decode(&wire[0..3]);
        assert!((decoded - 0.5).abs() < 1e-3);
    }

    #[test]
    fn converter_changes_frame_count() {
        let mut converter = RateConverter::new(48000, 96000, 2).unwrap();

        // short of a whole block: nothing comes out yet
        let input = vec![0.0f32; 1000 * 2];
        assert!(converter.convert(&input).is_empty());

        // topping the block up converts it at twice the rate
        let input = vec![0.0f32; 24 * 2];
        let out = converter.convert(&input);
        let out_frames = out.len() / 2;
        assert!(out_frames > 1500 && out_frames < 2600, "got {out_frames}");
    }

    #[test]
    fn partial_frame_tail_is_dropped() {
        let _guard = stats::test_guard();
        let audio = AudioSystem::new(16, 2, 64, 48000, 48000, 3).unwrap();

        // three samples of a two channel stream: one whole frame plus a tail
        audio.write_int(&[0x10, 0x00, 0x10, 0x00, 0x10, 0x00]);

        let mut out = [0.0f32; 2];
        assert_eq!(audio.read(&mut out), 2);
        let mut more = [0.0f32; 2];
        assert_eq!(audio.read(&mut more), 0);
    }
}
