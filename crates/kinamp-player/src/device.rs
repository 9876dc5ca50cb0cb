//! Output device discovery and selection.
//!
//! The render pipeline wants a device that can run at (or near) the 44.1 kHz PCM rate of
//! the pipe; anything else is resampled on the pipe side before it reaches the sink.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Largest fixed buffer the output stream asks for.
const MAX_BUFFER_FRAMES: u32 = 16_384;

/// First output device whose name contains `needle` (case-insensitive), or the host default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let found = host
            .output_devices()
            .context("No output devices")?
            .find(|d| {
                d.description()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            });
        return found.ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to `target_rate`.
///
/// An exact match wins; otherwise the highest rate below the target, then the lowest above.
/// Ties on rate are broken by sample format (float first).
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;

    for range in device.supported_output_configs()? {
        let rate = clamp_rate(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = best
            .as_ref()
            .is_none_or(|(b, _)| candidate.beats(b, target_rate));
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Prefer a fixed (large) buffer when the device advertises a range.
///
/// `None` lets CPAL use the device default.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(clamp_buffer_frames(*min, *max)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Names of the host's output devices, in enumeration order.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<String>> {
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    for d in devices {
        names.push(d.description()?.to_string());
    }
    Ok(names)
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn beats(&self, other: &Candidate, target: u32) -> bool {
        let (self_key, other_key) = (rate_key(self.rate, target), rate_key(other.rate, target));
        if self_key != other_key {
            self_key < other_key
        } else {
            self.format_rank < other.format_rank
        }
    }
}

/// Sort key for a rate relative to the target: exact, then below (closest first), then above.
fn rate_key(rate: u32, target: u32) -> (u8, u32) {
    if rate == target {
        (0, 0)
    } else if rate < target {
        (1, target - rate)
    } else {
        (2, rate - target)
    }
}

fn clamp_rate(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn clamp_buffer_frames(min: u32, max: u32) -> u32 {
    if max > MAX_BUFFER_FRAMES {
        min.max(MAX_BUFFER_FRAMES)
    } else {
        max
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", " USB "));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "  "));
    }

    #[test]
    fn clamp_rate_keeps_target_inside_range() {
        assert_eq!(clamp_rate(8_000, 96_000, 44_100), 44_100);
        assert_eq!(clamp_rate(48_000, 96_000, 44_100), 48_000);
        assert_eq!(clamp_rate(8_000, 32_000, 44_100), 32_000);
    }

    #[test]
    fn exact_rate_beats_everything() {
        let exact = Candidate { rate: 44_100, format_rank: 3 };
        let below = Candidate { rate: 32_000, format_rank: 0 };
        let above = Candidate { rate: 48_000, format_rank: 0 };
        assert!(exact.beats(&below, 44_100));
        assert!(exact.beats(&above, 44_100));
        assert!(!above.beats(&exact, 44_100));
    }

    #[test]
    fn below_target_preferred_over_above() {
        let below = Candidate { rate: 32_000, format_rank: 2 };
        let above = Candidate { rate: 48_000, format_rank: 0 };
        assert!(below.beats(&above, 44_100));
    }

    #[test]
    fn same_rate_prefers_float_format() {
        let float = Candidate { rate: 48_000, format_rank: 0 };
        let int = Candidate { rate: 48_000, format_rank: 2 };
        assert!(float.beats(&int, 44_100));
        assert!(!int.beats(&float, 44_100));
    }

    #[test]
    fn clamp_buffer_frames_caps_large_ranges() {
        assert_eq!(clamp_buffer_frames(64, 4_096), 4_096);
        assert_eq!(clamp_buffer_frames(64, 65_536), MAX_BUFFER_FRAMES);
        assert_eq!(clamp_buffer_frames(32_768, 65_536), 32_768);
    }
}
