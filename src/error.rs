//! Crate-wide error type.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),

    #[error("interface query failed ({name}): {source}")]
    Interface {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("packet size ({packet}) is larger than interface mtu ({mtu})")]
    PacketTooLarge { packet: usize, mtu: usize },

    #[error("audio host error: {0}")]
    AudioHost(String),

    #[error("could not set realtime scheduler: {0}")]
    Scheduler(#[source] io::Error),

    #[error("could not change to {kind}({id}): {source}")]
    Privileges {
        kind: &'static str,
        id: u32,
        #[source]
        source: io::Error,
    },

    #[error("could not start {0} thread")]
    ThreadSpawn(&'static str),

    #[error("timed out waiting for a PTP master")]
    PtpTimeout,

    #[error("startup aborted")]
    StartupAborted,
}

pub type Result<T> = std::result::Result<T, Error>;
