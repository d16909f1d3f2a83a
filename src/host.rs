//! Host audio: the local capture or playback device the bridge hangs off.
//!
//! The device callback is the realtime end of the pipeline. Each invocation
//! asks the drift controller for a bias and stretches or shrinks its period
//! by that one sample while moving audio between the device buffer and the
//! shared FIFO. Scheduling and privilege handling happen here because they
//! must be in place before the stream starts.

use std::io;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use log::{debug, error, info};

use crate::audio::AudioSystem;
use crate::config::Config;
use crate::drift::{self, BiasGenerator, DriftControl};
use crate::error::{Error, Result};

/// Assumed callback size when the device will not say; doubled for the FIFO.
const HOST_FRAMES_HINT: usize = 4096;

pub struct HostEngine {
    // kept alive for the lifetime of the process; dropping it stops audio
    _stream: cpal::Stream,
    audio: Arc<AudioSystem>,
    rate: u32,
}

impl HostEngine {
    /// Lock in scheduling and privileges, open the device and start the
    /// stream. `ring_frames` is the network side's FIFO requirement.
    pub fn init(
        cfg: &Config,
        ring_frames: usize,
        drift: Arc<DriftControl>,
        seed: u64,
    ) -> Result<Self> {
        set_realtime_scheduling()?;
        drop_privileges(cfg)?;

        let host = cpal::default_host();
        let device = pick_device(&host, cfg)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());

        let host_rate = negotiate_rate(&device, cfg)?;
        if host_rate != cfg.rate {
            info!(
                "device {device_name} runs at {host_rate} Hz, converting to {} Hz",
                cfg.rate
            );
        }

        let channels = cfg.channels as usize;
        let (rate_in, rate_out) = if cfg.is_sender() {
            (host_rate, cfg.rate)
        } else {
            (cfg.rate, host_rate)
        };

        let frames = ring_frames.max(HOST_FRAMES_HINT * 2);
        let audio = Arc::new(AudioSystem::new(
            cfg.bits, channels, frames, rate_in, rate_out, seed,
        )?);

        let stream_config = StreamConfig {
            channels: cfg.channels as u16,
            sample_rate: SampleRate(host_rate),
            buffer_size: BufferSize::Default,
        };

        let stream = if cfg.is_sender() {
            build_capture(&device, &stream_config, audio.clone(), drift)?
        } else {
            build_playout(&device, &stream_config, audio.clone(), drift)?
        };

        stream
            .play()
            .map_err(|e| Error::AudioHost(format!("could not start stream: {e}")))?;

        debug!("started: {device_name} ({} channels)", cfg.channels);

        Ok(Self {
            _stream: stream,
            audio,
            rate: host_rate,
        })
    }

    pub fn audio(&self) -> Arc<AudioSystem> {
        self.audio.clone()
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }
}

/// Capture side: device frames go through the rubber band into the FIFO.
fn build_capture(
    device: &cpal::Device,
    config: &StreamConfig,
    audio: Arc<AudioSystem>,
    drift: Arc<DriftControl>,
) -> Result<cpal::Stream> {
    let channels = config.channels as usize;
    let mut bias_gen = BiasGenerator::new(drift);
    let mut scratch: Vec<f32> = Vec::with_capacity((HOST_FRAMES_HINT + 1) * channels);

    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let frames = data.len() / channels;
                let bias = bias_gen.bias(frames as u32);

                if bias != 0 && frames >= 2 {
                    drift::stretch_capture(data, channels, bias, &mut scratch);
                    audio.write(&scratch);
                } else {
                    audio.write(&data[..frames * channels]);
                }
            },
            |e| error!("audio stream: {e}"),
            None,
        )
        .map_err(|e| Error::AudioHost(format!("could not open capture stream: {e}")))
}

/// Playout side: FIFO frames go through the rubber band into the device.
fn build_playout(
    device: &cpal::Device,
    config: &StreamConfig,
    audio: Arc<AudioSystem>,
    drift: Arc<DriftControl>,
) -> Result<cpal::Stream> {
    let channels = config.channels as usize;
    let mut bias_gen = BiasGenerator::new(drift);
    let mut scratch: Vec<f32> = Vec::with_capacity((HOST_FRAMES_HINT + 1) * channels);

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let bias = bias_gen.bias(frames as u32);

                if bias != 0 && frames >= 2 {
                    let need = (frames as i64 + bias as i64) as usize * channels;
                    scratch.resize(need, 0.0);
                    audio.read(&mut scratch[..need]);
                    drift::shrink_playout(&scratch[..need], channels, bias, frames, data);
                } else {
                    audio.read(data);
                }
            },
            |e| error!("audio stream: {e}"),
            None,
        )
        .map_err(|e| Error::AudioHost(format!("could not open playout stream: {e}")))
}

/// Choose the device: the first connection hint that names one wins,
/// otherwise the host default for the direction.
fn pick_device(host: &cpal::Host, cfg: &Config) -> Result<cpal::Device> {
    let hints = cfg.port_list();
    let wanted: Vec<&str> = hints.iter().flatten().copied().collect();

    if !wanted.is_empty() {
        let devices = if cfg.is_sender() {
            host.input_devices()
        } else {
            host.output_devices()
        };

        if let Ok(devices) = devices {
            for device in devices {
                let name = device.name().unwrap_or_default();
                if wanted.iter().any(|w| name.contains(w)) {
                    debug!("connected: {name}");
                    return Ok(device);
                }
            }
        }
        info!("no device matches {wanted:?}, using the default");
    }

    let device = if cfg.is_sender() {
        host.default_input_device()
    } else {
        host.default_output_device()
    };

    device.ok_or_else(|| Error::AudioHost("no suitable audio device".into()))
}

/// Run at the network rate when the device can, otherwise fall back to its
/// default rate and let the converter bridge the difference.
fn negotiate_rate(device: &cpal::Device, cfg: &Config) -> Result<u32> {
    let wanted = cfg.channels as u16;

    fn supports_rate(
        mut ranges: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
        wanted: u16,
        rate: u32,
    ) -> bool {
        ranges.any(|r| {
            r.channels() == wanted && r.min_sample_rate().0 <= rate && r.max_sample_rate().0 >= rate
        })
    }

    let native = if cfg.is_sender() {
        device
            .supported_input_configs()
            .map(|r| supports_rate(r, wanted, cfg.rate))
            .unwrap_or(false)
    } else {
        device
            .supported_output_configs()
            .map(|r| supports_rate(r, wanted, cfg.rate))
            .unwrap_or(false)
    };

    if native {
        return Ok(cfg.rate);
    }

    let default = if cfg.is_sender() {
        device.default_input_config()
    } else {
        device.default_output_config()
    };

    default
        .map(|c| c.sample_rate().0)
        .map_err(|e| Error::AudioHost(format!("could not query device: {e}")))
}

fn set_realtime_scheduling() -> Result<()> {
    let param = libc::sched_param { sched_priority: 99 };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) } != 0 {
        return Err(Error::Scheduler(io::Error::last_os_error()));
    }
    Ok(())
}

fn drop_privileges(cfg: &Config) -> Result<()> {
    if cfg.gid != 0 {
        let ok = unsafe { libc::setgid(cfg.gid) == 0 && libc::setegid(cfg.gid) == 0 };
        if !ok {
            return Err(Error::Privileges {
                kind: "group",
                id: cfg.gid,
                source: io::Error::last_os_error(),
            });
        }
    }

    if cfg.uid != 0 {
        let ok = unsafe { libc::setuid(cfg.uid) == 0 && libc::seteuid(cfg.uid) == 0 };
        if !ok {
            return Err(Error::Privileges {
                kind: "user",
                id: cfg.uid,
                source: io::Error::last_os_error(),
            });
        }
    }

    Ok(())
}
