//! Reconciliation between the host audio clock and the network clock.
//!
//! The network side observes the PTP master roughly once a second and
//! accumulates the rate error; the host callback pays that error back one
//! sample at a time by stretching or shrinking a period, which stays well
//! below audibility.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::rtp::RtpClock;
use crate::stats::STATS;

/// Host frames between rubber-band corrections.
const TRIGGER: u32 = 10_000;

/// Largest per-observation error accepted into the accumulator. XRUNs and
/// clock steps produce non-linear jumps far beyond normal drift; those are
/// the RTP resync path's problem, not ours.
const ERROR_LIMIT: i64 = 16;

/// Accumulated clock error, negative when the host runs fast.
#[derive(Debug, Default)]
pub struct DriftControl {
    error: AtomicI64,
}

impl DriftControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&self) -> i64 {
        self.error.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn set_error(&self, error: i64) {
        self.error.store(error, Ordering::Relaxed);
    }
}

/// Compares PTP master progress against the local sample clock. Owned by the
/// PTP event thread.
pub struct RateComparator {
    drift: Arc<DriftControl>,
    clock: Arc<RtpClock>,
    ptp_last: i64,
    local_last: i64,
}

impl RateComparator {
    pub fn new(drift: Arc<DriftControl>, clock: Arc<RtpClock>) -> Self {
        Self {
            drift,
            clock,
            ptp_last: 0,
            local_last: 0,
        }
    }

    /// Feed one master timestamp (in network sample units).
    pub fn observe(&mut self, ptp_now: u64) {
        let ptp_now = ptp_now as i64;
        let local_now = self.clock.now() as i64;

        let error = (ptp_now - self.ptp_last) - (local_now - self.local_last);
        self.ptp_last = ptp_now;
        self.local_last = local_now;

        if (-ERROR_LIMIT..=ERROR_LIMIT).contains(&error) {
            self.drift.error.fetch_add(error, Ordering::Relaxed);
        }
    }
}

/// Emits the one-sample correction bias. Owned by the host audio callback.
pub struct BiasGenerator {
    drift: Arc<DriftControl>,
    counter: u32,
}

impl BiasGenerator {
    pub fn new(drift: Arc<DriftControl>) -> Self {
        Self { drift, counter: 0 }
    }

    /// Account `frames` processed frames; returns -1, 0 or +1 once per
    /// trigger window.
    pub fn bias(&mut self, frames: u32) -> i32 {
        self.counter += frames;
        if self.counter < TRIGGER {
            return 0;
        }
        self.counter -= TRIGGER;

        let error = self.drift.error();
        let bias = match error {
            e if e < 0 => -1,
            e if e > 0 => 1,
            _ => 0,
        };

        if bias != 0 {
            self.drift.error.fetch_sub(bias as i64, Ordering::Relaxed);
            STATS.audio.drift.fetch_add(bias as i64, Ordering::Relaxed);
        }

        bias
    }
}

/// Capture side: turn `frames` interleaved host frames into `frames + bias`
/// frames for the FIFO. With bias +1 the first frame is doubled through its
/// average with the second; with bias -1 the first two collapse into their
/// average.
pub fn stretch_capture(input: &[f32], channels: usize, bias: i32, output: &mut Vec<f32>) {
    let frames = input.len() / channels;
    output.clear();

    match bias {
        1 => {
            output.extend_from_slice(&input[..channels]);
            for ch in 0..channels {
                output.push((input[ch] + input[channels + ch]) / 2.0);
            }
            output.extend_from_slice(&input[channels..frames * channels]);
        }
        -1 => {
            for ch in 0..channels {
                output.push((input[ch] + input[channels + ch]) / 2.0);
            }
            output.extend_from_slice(&input[2 * channels..frames * channels]);
        }
        _ => output.extend_from_slice(&input[..frames * channels]),
    }
}

/// Playout side: turn `frames + bias` FIFO frames into exactly `frames` host
/// frames. With bias +1 the first two FIFO frames collapse into their
/// average; with bias -1 the first frame is doubled through its average with
/// the second.
pub fn shrink_playout(input: &[f32], channels: usize, bias: i32, frames: usize, output: &mut [f32]) {
    debug_assert_eq!(output.len(), frames * channels);

    match bias {
        1 => {
            for ch in 0..channels {
                output[ch] = (input[ch] + input[channels + ch]) / 2.0;
            }
            output[channels..frames * channels]
                .copy_from_slice(&input[2 * channels..(frames + 1) * channels]);
        }
        -1 => {
            output[..channels].copy_from_slice(&input[..channels]);
            for ch in 0..channels {
                output[channels + ch] = (input[ch] + input[channels + ch]) / 2.0;
            }
            output[2 * channels..frames * channels]
                .copy_from_slice(&input[channels..(frames - 1) * channels]);
        }
        _ => output.copy_from_slice(&input[..frames * channels]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats;

    #[test]
    fn comparator_accumulates_small_errors() {
        let drift = Arc::new(DriftControl::new());
        let clock = Arc::new(RtpClock::new(48));
        let mut cmp = RateComparator::new(drift.clone(), clock.clone());

        // establish a baseline; the first delta is a huge jump and is ignored
        cmp.observe(1_000_000);
        assert_eq!(drift.error(), 0);

        // master advances 970, local advances 960: host is 10 slow
        for _ in 0..20 {
            clock.advance();
        }
        cmp.observe(1_000_000 + 970);
        assert_eq!(drift.error(), 10);
    }

    #[test]
    fn comparator_rejects_jumps() {
        let drift = Arc::new(DriftControl::new());
        let clock = Arc::new(RtpClock::new(48));
        let mut cmp = RateComparator::new(drift.clone(), clock.clone());

        cmp.observe(500);
        cmp.observe(500 + 17); // local static, delta 17 is past the limit
        assert_eq!(drift.error(), 0);

        cmp.observe(500 + 17 + 16); // 16 is accepted
        assert_eq!(drift.error(), 16);
    }

    #[test]
    fn bias_once_per_window() {
        let _guard = stats::test_guard();
        let drift = Arc::new(DriftControl::new());
        drift.set_error(11);

        let before = STATS.audio.drift.load(std::sync::atomic::Ordering::Relaxed);
        let mut gen = BiasGenerator::new(drift.clone());

        // window of exactly 10000 frames emits a single +1
        let mut biases = Vec::new();
        for _ in 0..10 {
            let b = gen.bias(1000);
            if b != 0 {
                biases.push(b);
            }
        }
        assert_eq!(biases, vec![1]);
        assert_eq!(drift.error(), 10);
        assert_eq!(
            STATS.audio.drift.load(std::sync::atomic::Ordering::Relaxed),
            before + 1
        );

        // host running fast: negative error, negative bias
        drift.set_error(-2);
        let mut biases = Vec::new();
        for _ in 0..10 {
            let b = gen.bias(1000);
            if b != 0 {
                biases.push(b);
            }
        }
        assert_eq!(biases, vec![-1]);
        assert_eq!(drift.error(), -1);
    }

    #[test]
    fn capture_stretch_inserts_averaged_sample() {
        let input = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0]; // 3 frames, 2 channels
        let mut out = Vec::new();

        stretch_capture(&input, 2, 1, &mut out);
        assert_eq!(out, vec![1.0, 10.0, 1.5, 15.0, 2.0, 20.0, 3.0, 30.0]);

        stretch_capture(&input, 2, -1, &mut out);
        assert_eq!(out, vec![1.5, 15.0, 3.0, 30.0]);

        stretch_capture(&input, 2, 0, &mut out);
        assert_eq!(out, input.to_vec());
    }

    #[test]
    fn playout_shrink_matches_capture_mapping() {
        // 4 FIFO frames, mono
        let input = [1.0, 2.0, 3.0, 4.0];

        // bias +1: consume 4, produce 3
        let mut out = [0.0f32; 3];
        shrink_playout(&input, 1, 1, 3, &mut out);
        assert_eq!(out, [1.5, 3.0, 4.0]);

        // bias -1: consume 2, produce 3
        let mut out = [0.0f32; 3];
        shrink_playout(&input[..2], 1, -1, 3, &mut out);
        assert_eq!(out, [1.0, 1.5, 2.0]);

        // bias 0: straight copy
        let mut out = [0.0f32; 4];
        shrink_playout(&input, 1, 0, 4, &mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }
}
