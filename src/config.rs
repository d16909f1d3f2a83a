//! Command-line interface and validated runtime configuration.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use clap::Parser;

/// Operating direction of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Send,
    Recv,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.chars().next() {
            Some('s') => Ok(Mode::Send),
            Some('r') => Ok(Mode::Recv),
            _ => Err(format!("'mode' argument must be 's' or 'r', got '{s}'")),
        }
    }
}

/// Multicast destination, `IP[:port]` with the AES67 default port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = match s.split_once(':') {
            Some((ip, "")) => (ip, 5004),
            Some((ip, port)) => {
                let port: u32 = port
                    .parse()
                    .map_err(|_| format!("'port' argument is not a number: {port}"))?;
                if !(1025..=49152).contains(&port) {
                    return Err("'port' argument must be within 1025..49152".into());
                }
                (ip, port as u16)
            }
            None => (s, 5004),
        };

        let addr: Ipv4Addr = ip
            .parse()
            .map_err(|_| format!("'address' argument is not an IPv4 address: {ip}"))?;

        Ok(Target { addr, port })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

fn parse_choice(s: &str, name: &str, allowed: &[u32]) -> Result<u32, String> {
    let v: u32 = s
        .parse()
        .map_err(|_| format!("'{name}' argument is not a number: {s}"))?;
    if allowed.contains(&v) {
        Ok(v)
    } else {
        Err(format!("'{name}' argument must be one of {allowed:?} (got: {v})"))
    }
}

fn parse_bits(s: &str) -> Result<u32, String> {
    parse_choice(s, "bits", &[16, 24, 32])
}

fn parse_rate(s: &str) -> Result<u32, String> {
    parse_choice(s, "rate", &[44100, 48000, 96000])
}

fn parse_ptime(s: &str) -> Result<u32, String> {
    parse_choice(s, "ptime", &[4000, 1000, 333, 250, 125])
}

/// Bridge a local audio device and an AES67 multicast stream.
#[derive(Debug, Parser)]
#[command(name = "aes67-bridge", version, about)]
pub struct Config {
    /// AES67 sender or receiver: <send|recv>
    #[arg(short, long)]
    pub mode: Mode,

    /// AES67 multicast address: <ip>[:<port=5004>]
    #[arg(short, long)]
    pub address: Target,

    /// AES67 multicast interface
    #[arg(short, long)]
    pub interface: Option<String>,

    /// AES67 sender session name
    #[arg(short, long)]
    pub session: Option<String>,

    /// AES67 sender session title
    #[arg(short, long)]
    pub title: Option<String>,

    /// AES67 encoding bits <16,24,32>
    #[arg(short, long, value_parser = parse_bits)]
    pub bits: u32,

    /// AES67 sample rate <44100,48000,96000>
    #[arg(short, long, value_parser = parse_rate)]
    pub rate: u32,

    /// AES67 channels in stream <1-8>
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..=8))]
    pub channels: u32,

    /// AES67 audio per packet <4000,1000,333,250,125>us
    #[arg(short, long, value_parser = parse_ptime, default_value = "1000")]
    pub ptime: u32,

    /// Audio client name
    #[arg(short = 'l', long, default_value = "aes67-bridge")]
    pub client: String,

    /// Audio channel connection list (comma separated, '-' skips)
    #[arg(short = 'o', long)]
    pub ports: Option<String>,

    /// Drop privileges to userid
    #[arg(short = 'u', long = "user", default_value_t = 0)]
    pub uid: u32,

    /// Drop privileges to group
    #[arg(short = 'g', long = "group", default_value_t = 0)]
    pub gid: u32,

    /// Verbose debugging output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn is_sender(&self) -> bool {
        self.mode == Mode::Send
    }

    /// Session name for SDP, defaulting to `<hostname>.<pid>`.
    pub fn session_name(&self) -> String {
        match &self.session {
            Some(s) => s.clone(),
            None => format!("{}.{}", hostname(), std::process::id()),
        }
    }

    /// Session title for SDP, defaulting to the channel span.
    pub fn session_title(&self) -> String {
        match &self.title {
            Some(t) => t.clone(),
            None => format!("Audio 1-{}", self.channels),
        }
    }

    /// Channel connection hints, one entry per channel; `-` entries skip.
    pub fn port_list(&self) -> Vec<Option<&str>> {
        match &self.ports {
            Some(list) => list
                .split(',')
                .map(|p| match p {
                    "" | "-" => None,
                    other => Some(other),
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".into();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, clap::Error> {
        Config::try_parse_from(
            std::iter::once("aes67-bridge").chain(args.iter().copied()),
        )
    }

    #[test]
    fn minimal_sender() {
        let cfg = parse(&["-m", "send", "-a", "239.69.1.5", "-b", "24", "-r", "48000", "-c", "2"])
            .unwrap();
        assert!(cfg.is_sender());
        assert_eq!(cfg.address.addr, Ipv4Addr::new(239, 69, 1, 5));
        assert_eq!(cfg.address.port, 5004);
        assert_eq!(cfg.ptime, 1000);
    }

    #[test]
    fn address_with_port() {
        let t: Target = "239.1.2.3:6000".parse().unwrap();
        assert_eq!(t.port, 6000);

        assert!("239.1.2.3:80".parse::<Target>().is_err());
        assert!("239.1.2.3:65000".parse::<Target>().is_err());
        assert!("not-an-ip".parse::<Target>().is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse(&["-m", "r", "-a", "239.0.0.1", "-b", "20", "-r", "48000", "-c", "2"]).is_err());
        assert!(parse(&["-m", "r", "-a", "239.0.0.1", "-b", "24", "-r", "8000", "-c", "2"]).is_err());
        assert!(parse(&["-m", "r", "-a", "239.0.0.1", "-b", "24", "-r", "48000", "-c", "9"]).is_err());
        assert!(parse(&["-m", "r", "-a", "239.0.0.1", "-b", "24", "-r", "48000", "-c", "2", "-p", "500"]).is_err());
    }

    #[test]
    fn defaults_for_session_and_title() {
        let cfg = parse(&["-m", "s", "-a", "239.0.0.1", "-b", "16", "-r", "44100", "-c", "8"])
            .unwrap();
        assert!(cfg.session_name().contains('.'));
        assert_eq!(cfg.session_title(), "Audio 1-8");
    }

    #[test]
    fn port_list_skips() {
        let cfg = parse(&[
            "-m", "r", "-a", "239.0.0.1", "-b", "24", "-r", "48000", "-c", "3", "-o",
            "left,-,right",
        ])
        .unwrap();
        assert_eq!(cfg.port_list(), vec![Some("left"), None, Some("right")]);
    }
}
