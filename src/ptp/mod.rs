//! PTP slave: tracks the grand-master on the event and general multicast
//! ports and publishes offsets into the RTP sample clock.
//!
//! The structure follows the wire protocol. SYNC arrives on the event port;
//! for a two-step master the precise timestamp comes later in a FOLLOW_UP on
//! the general port. The delay-request round trip (sender mode only)
//! completes the offset measurement.

pub mod messages;

use std::io::ErrorKind;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::config::Config;
use crate::drift::{DriftControl, RateComparator};
use crate::error::{Error, Result};
use crate::net::{self, Interface};
use crate::rtp::RtpClock;
use crate::stats::{self, STATS};
use messages::{PtpHeader, HEADER_LEN, MSG_DELAY_RESP, MSG_FOLLOW_UP, MSG_SYNC, SYNC_LEN};

const PTP_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 129);
const PTP_EVENT_PORT: u16 = 319;
const PTP_GENERAL_PORT: u16 = 320;

/// Seconds to wait for the first master before giving up.
const MASTER_WAIT_SECS: u32 = 60;

struct SlaveState {
    /// Identity of the master currently followed.
    source: [u8; 10],
    /// Text form of the source for SDP announcements.
    source_str: String,
    /// SYNC receive time on the local sample clock (T'1).
    ptp_recv: u64,
    /// SYNC origin time from the master (T1).
    ptp_sync: u64,
    /// Sequence of a two-step SYNC awaiting its FOLLOW_UP.
    clk_seq: u16,
    /// Local receive time of that SYNC.
    clk_recv: u64,
    /// Delay request sequence counter.
    req_seq: u16,
    /// Local send time of the last delay request (T2).
    req_sent: u64,
    /// Master receive time from the last DELAY_RESP (T'2).
    req_sync: u64,
    comparator: RateComparator,
    send_sock: Option<UdpSocket>,
    identity: [u8; 10],
}

/// Protocol state shared by the two receive threads.
pub struct PtpSlave {
    rate: u64,
    sender: bool,
    clock: Arc<RtpClock>,
    state: Mutex<SlaveState>,
}

impl PtpSlave {
    fn new(
        rate: u64,
        sender: bool,
        clock: Arc<RtpClock>,
        drift: Arc<DriftControl>,
        send_sock: Option<UdpSocket>,
        identity: [u8; 10],
    ) -> Self {
        let comparator = RateComparator::new(drift, clock.clone());
        Self {
            rate,
            sender,
            clock,
            state: Mutex::new(SlaveState {
                source: [0; 10],
                source_str: String::new(),
                ptp_recv: 0,
                ptp_sync: 0,
                clk_seq: 0,
                clk_recv: 0,
                req_seq: 0,
                req_sent: 0,
                req_sync: 0,
                comparator,
                send_sock,
                identity,
            }),
        }
    }

    /// Handle one datagram from the event port (SYNC messages).
    pub fn on_event(&self, data: &[u8]) {
        let Some(header) = PtpHeader::parse(data) else {
            return;
        };
        if header.version != 2 || header.domain != 0 {
            return;
        }

        stats::inc(&STATS.ptp.event);

        if data.len() < SYNC_LEN || (header.length as usize) < SYNC_LEN {
            return;
        }
        if header.msg_type != MSG_SYNC {
            return;
        }

        let mut s = self.state.lock();

        if header.source != s.source {
            // a different clock started announcing itself: follow it
            s.source = header.source;
            s.source_str = format_source(&header.source);
            let count = stats::inc(&STATS.ptp.masters);
            info!("Source: {} (#{count}).", s.source_str);
        }

        let Some(stamp) = messages::stamp(self.rate, &data[HEADER_LEN..]) else {
            return;
        };

        // let the drift controller compare master progress to our clock
        s.comparator.observe(stamp);

        if header.is_two_step() {
            s.clk_seq = header.sequence;
            s.clk_recv = self.clock.now();
        } else {
            s.ptp_recv = self.clock.now();
            s.ptp_sync = stamp;
            self.delay_request(&mut s);
        }
    }

    /// Handle one datagram from the general port (FOLLOW_UP, DELAY_RESP).
    pub fn on_general(&self, data: &[u8]) {
        let Some(header) = PtpHeader::parse(data) else {
            return;
        };
        if header.version != 2 || header.domain != 0 {
            return;
        }

        stats::inc(&STATS.ptp.general);

        match header.msg_type {
            MSG_FOLLOW_UP => {
                let mut s = self.state.lock();
                if header.sequence != s.clk_seq {
                    return;
                }
                let Some(stamp) = messages::stamp(self.rate, &data[HEADER_LEN..]) else {
                    return;
                };

                s.ptp_recv = s.clk_recv;
                s.ptp_sync = stamp;
                self.delay_request(&mut s);
            }
            MSG_DELAY_RESP => {
                let mut s = self.state.lock();
                if header.sequence != s.req_seq {
                    return;
                }
                let Some(stamp) = messages::stamp(self.rate, &data[HEADER_LEN..]) else {
                    return;
                };

                s.req_sync = stamp;

                let offset = (s.ptp_recv as i64 - s.ptp_sync as i64 - s.req_sync as i64
                    + s.req_sent as i64)
                    / 2;
                self.clock.offset(offset);
            }
            _ => {}
        }
    }

    /// Send a delay request, sender mode only and at most once per two
    /// seconds of network sample time.
    fn delay_request(&self, s: &mut SlaveState) {
        if !self.sender
            || s.req_sync > s.ptp_sync
            || (s.ptp_sync - s.req_sync) < self.rate * 2
        {
            return;
        }

        s.req_seq = s.req_seq.wrapping_add(1);
        let packet = messages::build_delay_req(&s.identity, s.req_seq);

        if let Some(sock) = &s.send_sock {
            if let Err(e) = sock.send(&packet) {
                error!("send: {e}");
            }
        }

        s.req_sent = self.clock.now();
        stats::inc(&STATS.ptp.requests);
    }

    /// Text form of the current master, for SDP.
    pub fn source(&self) -> String {
        self.state.lock().source_str.clone()
    }
}

fn format_source(source: &[u8; 10]) -> String {
    format!(
        "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}:0",
        source[0], source[1], source[2], source[3], source[4], source[5], source[6], source[7]
    )
}

pub struct PtpEngine {
    event_sock: UdpSocket,
    general_sock: UdpSocket,
    send_sock: Option<UdpSocket>,
    rate: u64,
    sender: bool,
    identity: [u8; 10],
    slave: Option<Arc<PtpSlave>>,
    running: Arc<AtomicBool>,
    event_thread: Option<JoinHandle<()>>,
    general_thread: Option<JoinHandle<()>>,
}

impl PtpEngine {
    /// Open the three PTP sockets.
    pub fn init(cfg: &Config, iface: &Interface) -> Result<Self> {
        let event_sock = net::open_recv(PTP_GROUP, PTP_EVENT_PORT, iface)?;
        let general_sock = net::open_recv(PTP_GROUP, PTP_GENERAL_PORT, iface)?;
        let send_sock = net::open_send(PTP_GROUP, PTP_EVENT_PORT, iface)?;

        debug!("PTP domain: {PTP_GROUP} (0)");

        Ok(Self {
            event_sock,
            general_sock,
            send_sock: Some(send_sock),
            rate: cfg.rate as u64,
            sender: cfg.is_sender(),
            identity: iface.identity,
            slave: None,
            running: Arc::new(AtomicBool::new(false)),
            event_thread: None,
            general_thread: None,
        })
    }

    /// Launch both receive threads and wait for the first master; gives up
    /// after a minute.
    pub fn start(&mut self, clock: Arc<RtpClock>, drift: Arc<DriftControl>) -> Result<()> {
        let slave = Arc::new(PtpSlave::new(
            self.rate,
            self.sender,
            clock,
            drift,
            self.send_sock.take(),
            self.identity,
        ));
        self.slave = Some(slave.clone());
        self.running.store(true, Ordering::SeqCst);

        let general_sock = self
            .general_sock
            .try_clone()
            .map_err(|_| Error::ThreadSpawn("ptp general"))?;
        let event_sock = self
            .event_sock
            .try_clone()
            .map_err(|_| Error::ThreadSpawn("ptp event"))?;

        let general_slave = slave.clone();
        let general_running = self.running.clone();
        self.general_thread = Some(
            thread::Builder::new()
                .name("ptp-general".into())
                .spawn(move || {
                    recv_loop(general_sock, general_running, move |data| {
                        general_slave.on_general(data)
                    });
                })
                .map_err(|_| Error::ThreadSpawn("ptp general"))?,
        );

        let event_slave = slave;
        let event_running = self.running.clone();
        self.event_thread = Some(
            thread::Builder::new()
                .name("ptp-event".into())
                .spawn(move || {
                    recv_loop(event_sock, event_running, move |data| {
                        event_slave.on_event(data)
                    });
                })
                .map_err(|_| Error::ThreadSpawn("ptp event"))?,
        );

        // wait for the first SYNC source to show up
        for count in 1..=MASTER_WAIT_SECS {
            if stats::get(&STATS.ptp.masters) > 0 {
                return Ok(());
            }

            if self
                .event_thread
                .as_ref()
                .is_some_and(|t| t.is_finished())
            {
                return Err(Error::StartupAborted);
            }

            if count % 5 == 0 {
                info!("Waiting.");
            }
            thread::sleep(Duration::from_secs(1));
        }

        error!("Timeout.");
        self.stop();
        Err(Error::PtpTimeout)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(t) = self.event_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.general_thread.take() {
            let _ = t.join();
        }
    }

    /// Text form of the tracked master, for SDP announcements.
    pub fn source(&self) -> String {
        self.slave.as_ref().map(|s| s.source()).unwrap_or_default()
    }
}

impl Drop for PtpEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn recv_loop(socket: UdpSocket, running: Arc<AtomicBool>, mut handle: impl FnMut(&[u8])) {
    let mut buf = [0u8; 2048];

    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(len) => handle(&buf[..len]),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => error!("recv: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_packet(source: [u8; 10], seq: u16, two_step: bool, sec: u64, nsec: u32) -> Vec<u8> {
        let mut buf = vec![0u8; SYNC_LEN];
        buf[0] = MSG_SYNC;
        buf[1] = 2;
        buf[2..4].copy_from_slice(&(SYNC_LEN as u16).to_be_bytes());
        if two_step {
            buf[6..8].copy_from_slice(&messages::FLAG_TWO_STEP.to_be_bytes());
        }
        buf[20..30].copy_from_slice(&source);
        buf[30..32].copy_from_slice(&seq.to_be_bytes());
        buf[34..40].copy_from_slice(&sec.to_be_bytes()[2..]);
        buf[40..44].copy_from_slice(&nsec.to_be_bytes());
        buf
    }

    fn general_packet(msg_type: u8, seq: u16, sec: u64, nsec: u32) -> Vec<u8> {
        let mut buf = sync_packet([0; 10], seq, false, sec, nsec);
        buf[0] = msg_type;
        buf
    }

    fn slave(sender: bool, clock: Arc<RtpClock>) -> PtpSlave {
        PtpSlave::new(
            48000,
            sender,
            clock,
            Arc::new(DriftControl::new()),
            None,
            [0xAA; 10],
        )
    }

    #[test]
    fn master_change_counts_once() {
        let _guard = stats::test_guard();
        let clock = Arc::new(RtpClock::new(48));
        let slave = slave(true, clock);

        let masters = stats::get(&STATS.ptp.masters);
        let requests = stats::get(&STATS.ptp.requests);

        let a = [1u8; 10];
        let b = [2u8; 10];

        slave.on_event(&sync_packet(a, 1, true, 1000, 0));
        slave.on_event(&sync_packet(a, 2, true, 1001, 0));
        assert_eq!(stats::get(&STATS.ptp.masters), masters + 1);

        slave.on_event(&sync_packet(b, 3, true, 1002, 0));
        slave.on_event(&sync_packet(b, 4, true, 1003, 0));
        assert_eq!(stats::get(&STATS.ptp.masters), masters + 2);

        // two-step syncs alone never produce a delay request
        assert_eq!(stats::get(&STATS.ptp.requests), requests);
        assert_eq!(slave.source(), "02-02-02-02-02-02-02-02:0");
    }

    #[test]
    fn rejects_wrong_version_domain_and_type() {
        let _guard = stats::test_guard();
        let clock = Arc::new(RtpClock::new(48));
        let slave = slave(true, clock);

        let masters = stats::get(&STATS.ptp.masters);

        let mut wrong_version = sync_packet([3; 10], 1, false, 1000, 0);
        wrong_version[1] = 1;
        slave.on_event(&wrong_version);

        let mut wrong_domain = sync_packet([3; 10], 1, false, 1000, 0);
        wrong_domain[4] = 5;
        slave.on_event(&wrong_domain);

        let mut not_sync = sync_packet([3; 10], 1, false, 1000, 0);
        not_sync[0] = MSG_FOLLOW_UP;
        slave.on_event(&not_sync);

        assert_eq!(stats::get(&STATS.ptp.masters), masters);
    }

    #[test]
    fn two_step_round_trip_publishes_offset() {
        let _guard = stats::test_guard();
        let clock = Arc::new(RtpClock::new(48));
        let slave = slave(true, clock.clone());

        // local clock at 480 samples when the SYNC arrives
        for _ in 0..10 {
            clock.advance();
        }

        // T1 approx in the SYNC, exact in the FOLLOW_UP
        slave.on_event(&sync_packet([7; 10], 7, true, 1000, 100));
        assert_eq!(clock.now(), 480); // nothing published yet

        // FOLLOW_UP seq 7: T1 = 1000s -> 48_000_000 samples; the delay
        // request goes out now, T2 = 480
        let requests = stats::get(&STATS.ptp.requests);
        slave.on_general(&general_packet(MSG_FOLLOW_UP, 7, 1000, 0));
        assert_eq!(stats::get(&STATS.ptp.requests), requests + 1);

        // master answers with T'2 = T1 + 2ms = 48_000_096 samples
        slave.on_general(&general_packet(MSG_DELAY_RESP, 1, 1000, 2_000_000));

        // offset = (T'1 - T1 - T'2 + T2) / 2 with T'1 = T2 = 480
        let expected = (480i64 - 48_000_000 - 48_000_096 + 480) / 2;
        assert_eq!(clock.now(), (480i64 - expected) as u64);
    }

    #[test]
    fn follow_up_with_wrong_sequence_is_ignored() {
        let _guard = stats::test_guard();
        let clock = Arc::new(RtpClock::new(48));
        let slave = slave(true, clock.clone());

        slave.on_event(&sync_packet([9; 10], 5, true, 1000, 0));
        let requests = stats::get(&STATS.ptp.requests);
        slave.on_general(&general_packet(MSG_FOLLOW_UP, 6, 1000, 0));
        assert_eq!(stats::get(&STATS.ptp.requests), requests);
    }

    #[test]
    fn receiver_mode_never_requests() {
        let _guard = stats::test_guard();
        let clock = Arc::new(RtpClock::new(48));
        let slave = slave(false, clock);

        let requests = stats::get(&STATS.ptp.requests);
        slave.on_event(&sync_packet([4; 10], 1, false, 1000, 0));
        assert_eq!(stats::get(&STATS.ptp.requests), requests);
    }

    #[test]
    fn delay_requests_are_rate_limited() {
        let _guard = stats::test_guard();
        let clock = Arc::new(RtpClock::new(48));
        let slave = slave(true, clock);

        let requests = stats::get(&STATS.ptp.requests);

        slave.on_event(&sync_packet([6; 10], 1, false, 1000, 0));
        assert_eq!(stats::get(&STATS.ptp.requests), requests + 1);

        // the response pins the last measurement time
        slave.on_general(&general_packet(MSG_DELAY_RESP, 1, 1000, 500_000));

        // one second later is within the two second window: no new request
        slave.on_event(&sync_packet([6; 10], 2, false, 1001, 0));
        assert_eq!(stats::get(&STATS.ptp.requests), requests + 1);

        // three seconds later is past it
        slave.on_event(&sync_packet([6; 10], 3, false, 1003, 0));
        assert_eq!(stats::get(&STATS.ptp.requests), requests + 2);
    }
}
