use std::process;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::error::ErrorKind;
use clap::Parser;
use log::{error, info, LevelFilter};
use signal_hook::consts::signal::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

use aes67_bridge::config::Config;
use aes67_bridge::drift::DriftControl;
use aes67_bridge::host::HostEngine;
use aes67_bridge::net::Interface;
use aes67_bridge::ptp::PtpEngine;
use aes67_bridge::rtp::RtpEngine;
use aes67_bridge::sap::SapAnnouncer;
use aes67_bridge::stats::STATS;

fn main() {
    let cfg = match Config::try_parse() {
        Ok(cfg) => cfg,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => -1,
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    env_logger::Builder::new()
        .filter_level(if cfg.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    // registered before any worker thread exists so every thread shares the
    // same disposition
    let mut signals = match Signals::new([SIGINT, SIGTERM, SIGUSR1, SIGUSR2]) {
        Ok(signals) => signals,
        Err(e) => {
            error!("could not mask signals: {e}");
            process::exit(-1);
        }
    };

    if let Err(e) = run(&cfg, &mut signals) {
        error!("{e}");
        process::exit(-1);
    }

    if cfg.verbose {
        eprintln!("{}", STATS.report());
    }
}

fn run(cfg: &Config, signals: &mut Signals) -> aes67_bridge::Result<()> {
    let iface = Interface::query(cfg.interface.as_deref())?;

    // bring the stack up leaves first: sockets, then audio, then threads
    let mut ptp = PtpEngine::init(cfg, &iface)?;
    let mut rtp = RtpEngine::init(cfg, &iface)?;
    let mut sap = if cfg.is_sender() {
        Some(SapAnnouncer::init(cfg, &iface)?)
    } else {
        None
    };

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        ^ process::id() as u64;

    let drift = Arc::new(DriftControl::new());
    let engine = HostEngine::init(cfg, rtp.ring_frames(), drift.clone(), seed)?;

    ptp.start(rtp.clock(), drift)?;
    rtp.start(engine.audio())?;
    if let Some(sap) = sap.as_mut() {
        sap.start(ptp.source())?;
    }

    // nothing left to do but wait for a reason to leave
    for signal in signals.forever() {
        match signal {
            SIGUSR1 => eprintln!("{}", STATS.report()),
            SIGUSR2 => {}
            other => {
                info!("Signal {other}. Exiting.");
                break;
            }
        }
    }

    rtp.stop();
    ptp.stop();
    if let Some(mut sap) = sap {
        sap.stop();
    }

    Ok(())
}
