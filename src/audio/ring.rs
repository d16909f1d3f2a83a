//! Shared audio FIFO between the host callback and the network thread.
//!
//! Single producer, single consumer: interleaved f32 samples, whole frames
//! only. The host-callback side never blocks; the network side may wait on a
//! condition variable until a full packet of samples is available.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

use crate::stats::{self, STATS};

pub struct AudioRing {
    prod: Mutex<HeapProd<f32>>,
    cons: Mutex<HeapCons<f32>>,
    /// Samples per frame (channel count).
    stride: usize,
    closed: AtomicBool,
    gate: Mutex<()>,
    ready: Condvar,
}

impl AudioRing {
    /// Create a ring holding `frames` whole frames of `stride` samples.
    pub fn new(stride: usize, frames: usize) -> Self {
        let (prod, cons) = HeapRb::<f32>::new(stride * frames).split();
        Self {
            prod: Mutex::new(prod),
            cons: Mutex::new(cons),
            stride,
            closed: AtomicBool::new(false),
            gate: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    pub fn capacity_frames(&self) -> usize {
        self.cons.lock().capacity().get() / self.stride
    }

    /// Write interleaved samples, clipped to the free space rounded down to
    /// whole frames. A short write counts one overrun. Returns samples
    /// written.
    pub fn write(&self, data: &[f32]) -> usize {
        let frames = data.len() / self.stride;
        let mut prod = self.prod.lock();

        let space = prod.vacant_len() / self.stride;
        let take = frames.min(space);
        if take < frames {
            stats::inc(&STATS.audio.overrun);
        }

        let written = prod.push_slice(&data[..take * self.stride]);
        drop(prod);

        let _gate = self.gate.lock();
        self.ready.notify_one();
        written
    }

    /// Non-blocking read of exactly `out.len()` samples. When not enough data
    /// is buffered the output is zero-filled, one underrun is counted and 0
    /// is returned.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let mut cons = self.cons.lock();

        if cons.occupied_len() < out.len() {
            stats::inc(&STATS.audio.underrun);
            out.fill(0.0);
            return 0;
        }

        cons.pop_slice(out)
    }

    /// Blocking read of exactly `out.len()` samples; waits until the producer
    /// has supplied enough. Returns false when the ring was closed.
    pub fn read_blocking(&self, out: &mut [f32]) -> bool {
        let need = out.len();

        let mut gate = self.gate.lock();
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return false;
            }
            if self.cons.lock().occupied_len() >= need {
                break;
            }
            self.ready.wait(&mut gate);
        }
        drop(gate);

        let mut cons = self.cons.lock();
        cons.pop_slice(out);
        true
    }

    /// Wake any blocked reader and make further blocking reads fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let _gate = self.gate.lock();
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn write_then_read_roundtrip() {
        let _guard = stats::test_guard();
        let ring = AudioRing::new(2, 16);

        let data: Vec<f32> = (0..8).map(|i| i as f32).collect();
        assert_eq!(ring.write(&data), 8);

        let mut out = vec![0.0f32; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(out, data);
    }

    #[test]
    fn short_write_counts_overrun() {
        let _guard = stats::test_guard();
        let ring = AudioRing::new(2, 4);

        let before = STATS.audio.overrun.load(Ordering::Relaxed);
        let data = vec![0.5f32; 12]; // 6 frames into a 4 frame ring
        assert_eq!(ring.write(&data), 8);
        assert_eq!(STATS.audio.overrun.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn short_read_zero_fills_and_counts_underrun() {
        let _guard = stats::test_guard();
        let ring = AudioRing::new(1, 8);
        ring.write(&[1.0, 2.0]);

        let before = STATS.audio.underrun.load(Ordering::Relaxed);
        let mut out = vec![9.0f32; 4];
        assert_eq!(ring.read(&mut out), 0);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(STATS.audio.underrun.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn blocking_read_waits_for_producer() {
        let _guard = stats::test_guard();
        let ring = Arc::new(AudioRing::new(1, 64));

        let reader = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut out = vec![0.0f32; 32];
                assert!(ring.read_blocking(&mut out));
                out
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        ring.write(&vec![0.25f32; 16]);
        ring.write(&vec![0.25f32; 16]);

        let out = reader.join().unwrap();
        assert_eq!(out, vec![0.25f32; 32]);
    }

    #[test]
    fn close_releases_blocked_reader() {
        let ring = Arc::new(AudioRing::new(1, 8));

        let reader = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut out = vec![0.0f32; 8];
                ring.read_blocking(&mut out)
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        ring.close();
        assert!(!reader.join().unwrap());
    }
}
