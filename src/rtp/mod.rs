//! RTP engine: one worker thread per direction plus the shared sample clock.
//!
//! The sender drains whole packets from the audio FIFO and paces itself just
//! under the nominal packet interval; the host callback writing into the FIFO
//! is what actually regulates the long-term rate. The receiver validates and
//! reorders datagrams into the FIFO.

pub mod header;
pub mod reorder;

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};

use crate::audio::AudioSystem;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::{self, Interface};
use crate::stats::{self, STATS};
use header::PacketBuilder;
use reorder::ReorderBuffer;

/// Free-running sample clock in network rate units, shared between the RTP
/// worker and the PTP slave.
pub struct RtpClock {
    clock: AtomicU64,
    samples: u32,
}

impl RtpClock {
    pub fn new(samples: u32) -> Self {
        Self {
            clock: AtomicU64::new(0),
            samples,
        }
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Advance by one packet worth of samples; returns the previous value,
    /// which is the timestamp of the packet being accounted.
    pub fn advance(&self) -> u64 {
        self.clock.fetch_add(self.samples as u64, Ordering::Relaxed)
    }

    /// Apply a PTP-derived offset. Within two packets of the master the
    /// phase error is acceptable and nothing happens; past that the clock
    /// steps and the resync is counted.
    pub fn offset(&self, delta: i64) {
        let window = (self.samples as i64) * 2;
        if (-window..=window).contains(&delta) {
            return;
        }

        stats::inc(&STATS.rtp.resynced);
        self.clock.fetch_sub(delta as u64, Ordering::Relaxed);
    }
}

/// Samples per packet for a given packet time. 44.1 kHz streams use the
/// 48 kHz-derived packet sizes, as AES67 senders do.
pub fn samples_per_packet(ptime_us: u32, rate: u32) -> u32 {
    let base: u64 = if rate == 96000 { 96000 } else { 48000 };
    (ptime_us as u64 * base / 1_000_000) as u32
}

pub struct RtpEngine {
    socket: UdpSocket,
    clock: Arc<RtpClock>,
    payload_len: usize,
    ptime_us: u32,
    sender: bool,
    running: Arc<AtomicBool>,
    audio: Option<Arc<AudioSystem>>,
    worker: Option<JoinHandle<()>>,
}

impl RtpEngine {
    /// Open the multicast socket and size the packet; fails when one packet
    /// would not fit the interface MTU.
    pub fn init(cfg: &Config, iface: &Interface) -> Result<Self> {
        let samples = samples_per_packet(cfg.ptime, cfg.rate);

        let socket = if cfg.is_sender() {
            net::open_send(cfg.address.addr, cfg.address.port, iface)?
        } else {
            net::open_recv(cfg.address.addr, cfg.address.port, iface)?
        };

        let payload_len = samples as usize * cfg.channels as usize * cfg.bits as usize / 8;

        // payload + rtp(12) + udp(8) + ip(20)
        let packet = payload_len + 40;
        if packet > iface.mtu {
            return Err(Error::PacketTooLarge {
                packet,
                mtu: iface.mtu,
            });
        }

        debug!(
            "RTP {}: {}",
            if cfg.is_sender() { "sender" } else { "receiver" },
            cfg.address
        );

        Ok(Self {
            socket,
            clock: Arc::new(RtpClock::new(samples)),
            payload_len,
            ptime_us: cfg.ptime,
            sender: cfg.is_sender(),
            running: Arc::new(AtomicBool::new(false)),
            audio: None,
            worker: None,
        })
    }

    pub fn clock(&self) -> Arc<RtpClock> {
        self.clock.clone()
    }

    /// FIFO frames needed to cover the reorder window plus one packet.
    pub fn ring_frames(&self) -> usize {
        self.clock.samples() as usize * (reorder::WINDOW + 1)
    }

    pub fn start(&mut self, audio: Arc<AudioSystem>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.audio = Some(audio.clone());

        let socket = self
            .socket
            .try_clone()
            .map_err(|_| Error::ThreadSpawn("rtp"))?;
        let clock = self.clock.clone();
        let running = self.running.clone();
        let payload_len = self.payload_len;
        let ptime_us = self.ptime_us;
        let sender = self.sender;

        let worker = thread::Builder::new()
            .name("rtp".into())
            .spawn(move || {
                if sender {
                    send_loop(socket, clock, audio, running, payload_len, ptime_us);
                } else {
                    recv_loop(socket, clock, audio, running);
                }
            })
            .map_err(|_| Error::ThreadSpawn("rtp"))?;

        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        // wake a sender blocked on the FIFO
        if let Some(audio) = self.audio.take() {
            audio.close();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RtpEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_loop(
    socket: UdpSocket,
    clock: Arc<RtpClock>,
    audio: Arc<AudioSystem>,
    running: Arc<AtomicBool>,
    payload_len: usize,
    ptime_us: u32,
) {
    let mut builder = PacketBuilder::new(rand::random(), rand::random(), payload_len);

    // sleep most of a packet interval between sends; the FIFO read blocks
    // when the audio side has not produced the next packet yet
    let pace = Duration::from_nanos(ptime_us as u64 * 900);

    while running.load(Ordering::SeqCst) {
        if !audio.read_int(builder.payload_mut()) {
            break;
        }

        let timestamp = clock.advance();
        let packet = builder.finish(timestamp as u32);

        match socket.send(packet) {
            Ok(_) => {
                stats::inc(&STATS.rtp.packets);
            }
            Err(e) => {
                error!("packet send: {e}");
            }
        }

        thread::sleep(pace);
    }
}

fn recv_loop(
    socket: UdpSocket,
    clock: Arc<RtpClock>,
    audio: Arc<AudioSystem>,
    running: Arc<AtomicBool>,
) {
    let mut reorder = ReorderBuffer::new();
    let mut buf = [0u8; reorder::SLOT_BYTES];

    while running.load(Ordering::SeqCst) {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                error!("packet recv: {e}");
                continue;
            }
        };

        let Some((seq, payload)) = header::parse_packet(&buf[..len]) else {
            continue;
        };

        stats::inc(&STATS.rtp.packets);

        reorder.admit(seq, payload, &mut |p| {
            audio.write_int(p);
            clock.advance();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_per_packet_table() {
        assert_eq!(samples_per_packet(1000, 48000), 48);
        assert_eq!(samples_per_packet(1000, 44100), 48);
        assert_eq!(samples_per_packet(1000, 96000), 96);
        assert_eq!(samples_per_packet(125, 48000), 6);
        assert_eq!(samples_per_packet(333, 48000), 15);
        assert_eq!(samples_per_packet(4000, 96000), 384);
    }

    #[test]
    fn clock_advance_returns_previous() {
        let clock = RtpClock::new(48);
        assert_eq!(clock.advance(), 0);
        assert_eq!(clock.advance(), 48);
        assert_eq!(clock.now(), 96);
    }

    #[test]
    fn delivery_feeds_audio_and_clock() {
        let _guard = stats::test_guard();
        let audio = AudioSystem::new(16, 1, 64, 48000, 48000, 5).unwrap();
        let clock = RtpClock::new(1);
        let mut reorder = ReorderBuffer::new();

        let mut sink = |p: &[u8]| {
            audio.write_int(p);
            clock.advance();
        };

        // adopt a starting position far from zero
        reorder.admit(99, &[], &mut sink);

        // four packets of one 0x4000 mono frame each
        for seq in 100u16..104 {
            reorder.admit(seq, &[0x40, 0x00], &mut sink);
        }

        let mut out = [0.0f32; 4];
        assert_eq!(audio.read(&mut out), 4);
        let expect = 16384.0 / 32767.0;
        for sample in out {
            assert!((sample - expect).abs() < 1e-6);
        }

        // the receive path free-runs the sample clock, one advance per packet
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn offset_dead_zone() {
        let _guard = stats::test_guard();
        let clock = RtpClock::new(48);
        for _ in 0..100 {
            clock.advance();
        }
        let before = clock.now();

        let resynced = stats::get(&STATS.rtp.resynced);
        clock.offset(96); // exactly two packets: tolerated
        clock.offset(-96);
        assert_eq!(clock.now(), before);
        assert_eq!(stats::get(&STATS.rtp.resynced), resynced);

        clock.offset(97);
        assert_eq!(clock.now(), before - 97);
        assert_eq!(stats::get(&STATS.rtp.resynced), resynced + 1);

        clock.offset(-200);
        assert_eq!(clock.now(), before - 97 + 200);
        assert_eq!(stats::get(&STATS.rtp.resynced), resynced + 2);
    }
}
