//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing the stream config closest to a requested format

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device matching `needle` (case-insensitive), or the default device.
///
/// Returns an error if no suitable device is found.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle.filter(|n| !n.trim().is_empty()) {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config best suited to `target_rate` and `target_channels`.
///
/// Ranking, most important first:
/// 1. a rate range that contains the target rate exactly
/// 2. the channel count closest to the target (an exact match wins)
/// 3. the rate closest to the target
/// 4. the sample format that converts with the least loss
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
    target_channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .context("query supported output configs")?
        .collect();

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            exact_rate: rate == target_rate,
            channel_distance: range.channels().abs_diff(target_channels),
            rate_distance: rate.abs_diff(target_rate),
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = match &best {
            None => true,
            Some((b, _)) => candidate.is_better_than(b),
        };
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    match best {
        Some((_, cfg)) => Ok(cfg),
        None => device
            .default_output_config()
            .context("No supported output configs"),
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    exact_rate: bool,
    channel_distance: u16,
    rate_distance: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate) -> bool {
        if self.exact_rate != other.exact_rate {
            self.exact_rate
        } else if self.channel_distance != other.channel_distance {
            self.channel_distance < other.channel_distance
        } else if self.rate_distance != other.rate_distance {
            self.rate_distance < other.rate_distance
        } else {
            self.format_rank < other.format_rank
        }
    }
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        cpal::SampleFormat::U8 => 4,
        _ => 10,
    }
}

/// Output device metadata for `--list-devices`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub min_rate: u32,
    pub max_rate: u32,
    pub max_channels: u16,
}

/// Enumerate output devices of `host`.
///
/// Devices whose capabilities cannot be queried are still listed with zeroed ranges.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());

    let devices = host.output_devices().context("No output devices")?;
    let mut out = Vec::new();
    for d in devices {
        let name = d.description()?.name().to_string();
        let mut info = DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate: 0,
            max_rate: 0,
            max_channels: 0,
        };
        match d.supported_output_configs() {
            Ok(ranges) => {
                let mut min_rate = u32::MAX;
                for r in ranges {
                    min_rate = min_rate.min(r.min_sample_rate());
                    info.max_rate = info.max_rate.max(r.max_sample_rate());
                    info.max_channels = info.max_channels.max(r.channels());
                }
                if min_rate != u32::MAX {
                    info.min_rate = min_rate;
                }
            }
            Err(e) => {
                tracing::warn!(device = %info.name, "cannot query output configs: {e}");
            }
        }
        out.push(info);
    }
    Ok(out)
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

    fn candidate(exact: bool, ch: u16, dist: u32, rank: u8) -> Candidate {
        Candidate {
            exact_rate: exact,
            channel_distance: ch,
            rate_distance: dist,
            format_rank: rank,
        }
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "  "));
    }

    #[test]
    fn pick_rate_for_range_prefers_target_when_in_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, 48_000), 48_000);
    }

    #[test]
    fn pick_rate_for_range_clamps() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, 22_050), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, 192_000), 96_000);
    }

    #[test]
    fn exact_rate_beats_channel_match() {
        let exact = candidate(true, 4, 0, 2);
        let close = candidate(false, 0, 100, 0);
        assert!(exact.is_better_than(&close));
        assert!(!close.is_better_than(&exact));
    }

    #[test]
    fn channel_match_beats_format() {
        let stereo = candidate(true, 0, 0, 3);
        let surround = candidate(true, 6, 0, 0);
        assert!(stereo.is_better_than(&surround));
    }

    #[test]
    fn format_rank_breaks_ties() {
        assert!(candidate(true, 0, 0, 0).is_better_than(&candidate(true, 0, 0, 2)));
        assert!(!candidate(true, 0, 0, 2).is_better_than(&candidate(true, 0, 0, 2)));
    }
}
