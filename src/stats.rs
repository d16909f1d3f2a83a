//! Process-global statistics counters.
//!
//! Counters are only ever updated additively and may be written from several
//! threads at once; relaxed atomics are enough because nothing correlates one
//! counter with another.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AudioStats {
    /// Net samples inserted (+) or dropped (-) by the clock reconciler.
    pub drift: AtomicI64,
    pub underrun: AtomicU64,
    pub overrun: AtomicU64,
}

#[derive(Debug, Default)]
pub struct RtpStats {
    pub resynced: AtomicU64,
    pub packets: AtomicU64,
    pub reordered: AtomicU64,
    pub skipped: AtomicU64,
}

#[derive(Debug, Default)]
pub struct PtpStats {
    pub masters: AtomicU64,
    pub requests: AtomicU64,
    pub general: AtomicU64,
    pub event: AtomicU64,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub audio: AudioStats,
    pub rtp: RtpStats,
    pub ptp: PtpStats,
}

pub static STATS: Stats = Stats {
    audio: AudioStats {
        drift: AtomicI64::new(0),
        underrun: AtomicU64::new(0),
        overrun: AtomicU64::new(0),
    },
    rtp: RtpStats {
        resynced: AtomicU64::new(0),
        packets: AtomicU64::new(0),
        reordered: AtomicU64::new(0),
        skipped: AtomicU64::new(0),
    },
    ptp: PtpStats {
        masters: AtomicU64::new(0),
        requests: AtomicU64::new(0),
        general: AtomicU64::new(0),
        event: AtomicU64::new(0),
    },
};

/// Add one to a counter.
pub fn inc(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

/// Read a counter.
pub fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl Stats {
    /// Format the counters the way the SIGUSR1 dump prints them.
    pub fn report(&self) -> String {
        format!(
            "\n\n----- Statistics -----\n\n\
             Audio Clock Drift:     {}\n\
             Audio Buffer Underrun: {}\n\
             Audio Buffer Overrun:  {}\n\n\
             RTP Clock Resynced:    {}\n\
             RTP Total Packets:     {}\n\
             RTP Reordered Packets: {}\n\
             RTP Dropped Packets:   {}\n\n\
             PTP Master Changes:    {}\n\
             PTP Delay Updates:     {}\n\
             PTP General Messages:  {}\n\
             PTP Event Messages:    {}\n",
            self.audio.drift.load(Ordering::Relaxed),
            self.audio.underrun.load(Ordering::Relaxed),
            self.audio.overrun.load(Ordering::Relaxed),
            self.rtp.resynced.load(Ordering::Relaxed),
            self.rtp.packets.load(Ordering::Relaxed),
            self.rtp.reordered.load(Ordering::Relaxed),
            self.rtp.skipped.load(Ordering::Relaxed),
            self.ptp.masters.load(Ordering::Relaxed),
            self.ptp.requests.load(Ordering::Relaxed),
            self.ptp.general.load(Ordering::Relaxed),
            self.ptp.event.load(Ordering::Relaxed),
        )
    }
}

/// Serializes tests that assert on the process-global counters.
#[cfg(test)]
pub fn test_guard() -> parking_lot::MutexGuard<'static, ()> {
    static LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
    LOCK.lock()
}
