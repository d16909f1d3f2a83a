//! SAP announcements of the outgoing stream.
//!
//! A sender broadcasts its SDP every five minutes on the well-known SAP
//! group, and tries to delete the session on the way out. Receivers on the
//! network (consoles, monitoring tools) discover the stream this way.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::{self, Interface};

const SAP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 255);
const SAP_PORT: u16 = 9875;

/// Seconds between announcements.
const ANNOUNCE_INTERVAL: u64 = 300;

/// SAP header: V=1, everything else clear.
const SAP_ANNOUNCE: u8 = 0b0010_0000;
/// Type bit turning an announcement into a deletion.
const SAP_DELETE: u8 = 0b0000_0100;

/// The stream facts that end up in the SDP body.
#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub group: Ipv4Addr,
    pub port: u16,
    pub bits: u32,
    pub rate: u32,
    pub channels: u32,
    pub ptime_us: u32,
    pub session: String,
    pub title: String,
}

impl SessionDescription {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            group: cfg.address.addr,
            port: cfg.address.port,
            bits: cfg.bits,
            rate: cfg.rate,
            channels: cfg.channels,
            ptime_us: cfg.ptime,
            session: cfg.session_name(),
            title: cfg.session_title(),
        }
    }

    /// The advertised packet time in milliseconds; 44.1 kHz streams carry
    /// more audio per packet than the nominal figure.
    fn ptime_text(&self) -> Option<&'static str> {
        let at_44k1 = self.rate == 44100;
        match self.ptime_us {
            4000 => Some(if at_44k1 { "4.35" } else { "4" }),
            1000 => Some(if at_44k1 { "1.09" } else { "1" }),
            333 => Some(if at_44k1 { "0.36" } else { "0.33" }),
            250 => Some(if at_44k1 { "0.27" } else { "0.25" }),
            125 => Some(if at_44k1 { "0.13" } else { "0.12" }),
            _ => None,
        }
    }

    /// Render the SDP body. `origin` is the announcing host address,
    /// `master` the PTP reference, `now` the wall-clock second used for both
    /// session id and version.
    pub fn sdp_body(&self, origin: Ipv4Addr, master: &str, now: u64) -> String {
        let mut body = String::new();

        body.push_str("v=0\r\n");
        body.push_str(&format!("o=- {now} {now} IN IP4 {origin}\r\n"));
        body.push_str(&format!("s={}\r\n", self.session));
        body.push_str(&format!("c=IN IP4 {}/32\r\n", self.group));
        body.push_str("t=0 0\r\n");
        body.push_str(&format!("m=audio {} RTP/AVP 96\r\n", self.port));
        body.push_str(&format!("i={}\r\n", self.title));
        body.push_str(&format!(
            "a=rtpmap:96 L{}/{}/{}\r\n",
            self.bits, self.rate, self.channels
        ));
        body.push_str("a=recvonly\r\n");
        if let Some(ptime) = self.ptime_text() {
            body.push_str(&format!("a=ptime:{ptime}\r\n"));
        }
        body.push_str(&format!("a=ts-refclk:ptp=IEEE1588-2008:{master}\r\n"));
        body.push_str("a=mediaclk:direct=0\r\n");

        body
    }
}

/// Assemble the full SAP datagram around the SDP body.
pub fn build_packet(desc: &SessionDescription, origin: Ipv4Addr, master: &str, now: u64) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    packet.push(SAP_ANNOUNCE);
    packet.push(0); // no authentication data
    packet.extend_from_slice(&(std::process::id() as u16).to_be_bytes());
    packet.extend_from_slice(&origin.octets());
    packet.extend_from_slice(b"application/sdp\0");
    packet.extend_from_slice(desc.sdp_body(origin, master, now).as_bytes());

    packet
}

pub struct SapAnnouncer {
    socket: Option<UdpSocket>,
    origin: Ipv4Addr,
    desc: SessionDescription,
    active: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SapAnnouncer {
    pub fn init(cfg: &Config, iface: &Interface) -> Result<Self> {
        let socket = net::open_send(SAP_GROUP, SAP_PORT, iface)?;
        let origin = iface.addr;

        debug!("SAP sender: {SAP_GROUP}:{SAP_PORT} ({origin})");

        Ok(Self {
            socket: Some(socket),
            origin,
            desc: SessionDescription::from_config(cfg),
            active: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Start the announce loop; `master` is the PTP source learned during
    /// startup.
    pub fn start(&mut self, master: String) -> Result<()> {
        let socket = self.socket.take().ok_or(Error::ThreadSpawn("sap"))?;
        let desc = self.desc.clone();
        let origin = self.origin;

        self.active.store(true, Ordering::SeqCst);
        let active = self.active.clone();

        let worker = thread::Builder::new()
            .name("sap".into())
            .spawn(move || {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let mut packet = build_packet(&desc, origin, &master, now);

                for tick in 0u64.. {
                    if !active.load(Ordering::SeqCst) {
                        break;
                    }

                    if tick % ANNOUNCE_INTERVAL == 0 {
                        if let Err(e) = socket.send(&packet) {
                            error!("packet send: {e}");
                        } else {
                            debug!("sent SAP announce packet");
                        }
                    }

                    thread::sleep(Duration::from_secs(1));
                }

                // best effort deletion of the session on the way out
                packet[0] |= SAP_DELETE;
                let _ = socket.send(&packet);
                debug!("sent SAP delete packet");
            })
            .map_err(|_| Error::ThreadSpawn("sap"))?;

        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SapAnnouncer {
    fn drop(&mut self) {
        self.stop();
    }
}
