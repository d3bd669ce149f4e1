//! ALSA PCM wrappers for the microphone and speaker paths.
//!
//! Devices are opened S16LE interleaved. Rates are negotiated with
//! `set_rate_near`, so the hardware may come back with something other than
//! the requested rate; callers read the negotiated parameters and resample
//! in software.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters the hardware actually granted.
#[derive(Debug, Clone)]
pub struct NegotiatedParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames.
    pub period_size: usize,
}

/// Open the microphone device, preferring the given rate and channel count.
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
) -> Result<(PCM, NegotiatedParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, None)
}

/// Open the speaker device, preferring the given rate and channel count.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, NegotiatedParams)> {
    open_pcm(device, Direction::Playback, sample_rate, channels, period_size)
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, NegotiatedParams)> {
    let kind = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("failed to open {kind} device '{device}'"))?;

    {
        let hwp = HwParams::any(&pcm).context("failed to initialize hardware params")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        // Mono-first, but some devices only expose stereo.
        if hwp.set_channels(channels).is_err() {
            hwp.set_channels(2)?;
        }
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        NegotiatedParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {kind} open: device={device}, rate={}, channels={}, period={}",
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}
