//! Multicast socket setup and network interface inspection.
//!
//! Sender sockets are connected to their destination and carry the AF41-like
//! service class the AES67 media profile asks for. Receiver sockets join the
//! group on the chosen interface and share their port. All receive sockets
//! get a short read timeout so worker threads can notice shutdown.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, InterfaceIndexOrAddress, Protocol, SockAddr, Socket, Type};

use crate::error::{Error, Result};

/// IP precedence FLASHOVERRIDE plus throughput, the AF41 equivalent.
const MEDIA_TOS: u32 = 0x88;

const MULTICAST_TTL: u32 = 32;

/// How long a blocked `recv` may hide a shutdown request.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Outbound multicast socket, connected to `addr:port`.
pub fn open_send(addr: Ipv4Addr, port: u16, iface: &Interface) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Socket)?;

    if iface.name.is_some() {
        socket
            .set_multicast_if_v4(&iface.addr)
            .map_err(Error::Socket)?;
    }

    socket.set_tos(MEDIA_TOS).map_err(Error::Socket)?;
    socket
        .set_multicast_ttl_v4(MULTICAST_TTL)
        .map_err(Error::Socket)?;

    socket
        .connect(&SockAddr::from(SocketAddrV4::new(addr, port)))
        .map_err(Error::Socket)?;

    Ok(socket.into())
}

/// Inbound multicast socket bound to `(group, port)` with the group joined
/// on the chosen interface.
pub fn open_recv(group: Ipv4Addr, port: u16, iface: &Interface) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Socket)?;

    socket
        .join_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(iface.index))
        .map_err(Error::Socket)?;

    socket.set_reuse_port(true).map_err(Error::Socket)?;
    socket.set_reuse_address(true).map_err(Error::Socket)?;

    socket
        .bind(&SockAddr::from(SocketAddrV4::new(group, port)))
        .map_err(Error::Socket)?;

    socket
        .set_read_timeout(Some(RECV_TIMEOUT))
        .map_err(Error::Socket)?;

    Ok(socket.into())
}

/// Facts about the multicast interface the bridge runs on.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: Option<String>,
    pub mtu: usize,
    /// Interface index, 0 when unspecified.
    pub index: u32,
    /// Primary IPv4 address, unspecified when no interface was named.
    pub addr: Ipv4Addr,
    /// EUI-64 derived PTP port identity, zeroed when no interface was named.
    pub identity: [u8; 10],
}

impl Interface {
    /// Query MTU, index, address and hardware identity for a named
    /// interface; without a name, fall back to an Ethernet-sized default.
    pub fn query(name: Option<&str>) -> Result<Self> {
        let Some(name) = name else {
            return Ok(Self {
                name: None,
                mtu: 1500,
                index: 0,
                addr: Ipv4Addr::UNSPECIFIED,
                identity: [0; 10],
            });
        };

        query_ioctl(name).map_err(|source| Error::Interface {
            name: name.to_string(),
            source,
        })
    }
}

/// Spread a MAC address into the 10-byte PTP port identity.
pub fn eui64(mac: &[u8; 6]) -> [u8; 10] {
    [
        mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5], 0x00, 0x02,
    ]
}

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };

    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= ifr.ifr_name.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad interface name"));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    Ok(ifr)
}

fn query_ioctl(name: &str) -> io::Result<Interface> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = (|| {
        let mut ifr = ifreq_for(name)?;

        if unsafe { libc::ioctl(fd, libc::SIOCGIFMTU, &mut ifr) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mtu = unsafe { ifr.ifr_ifru.ifru_mtu } as usize;

        if unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let index = unsafe { ifr.ifr_ifru.ifru_ifindex } as u32;

        unsafe {
            ifr.ifr_ifru.ifru_addr.sa_family = libc::AF_INET as libc::sa_family_t;
        }
        if unsafe { libc::ioctl(fd, libc::SIOCGIFADDR, &mut ifr) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let sin = unsafe {
            *(&ifr.ifr_ifru.ifru_addr as *const libc::sockaddr as *const libc::sockaddr_in)
        };
        let addr = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());

        if unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut ifr) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut mac = [0u8; 6];
        let sa_data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
        for (dst, src) in mac.iter_mut().zip(sa_data.iter()) {
            *dst = *src as u8;
        }

        Ok(Interface {
            name: Some(name.to_string()),
            mtu,
            index,
            addr,
            identity: eui64(&mac),
        })
    })();

    unsafe { libc::close(fd) };
    result
}
