// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Startup configuration.
//!
//! User input is never fatal here: anything malformed is replaced by its
//! default and a warning is logged.

use std::{path::PathBuf, time::Duration};

use log::{warn, LevelFilter};

use crate::brightness::BrightnessSpec;

/// Idle timeout used when none (or a bad one) is given.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 2;

/// LED name fragment used when none is given.
pub const DEFAULT_LED_FRAGMENT: &str = "kbd";

/// Everything the dimmer needs to know, fixed once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedConfig {
    /// Seconds without key activity before the backlight turns off.
    pub timeout_seconds: u64,
    /// Brightness to use when the backlight is on.
    pub brightness: BrightnessSpec,
    /// Keyboard event device to use instead of searching for one.
    pub device: Option<PathBuf>,
    /// Substring identifying the backlight in `/sys/class/leds`.
    pub led_fragment: String,
    /// Start with the backlight off rather than on.
    pub start_off: bool,
    /// 0 is quiet, 1 reports progress, 2 traces every key event.
    pub verbosity: u8,
    /// Set brightness through systemd-logind instead of sysfs.
    pub use_logind: bool,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            brightness: BrightnessSpec::Unset,
            device: None,
            led_fragment: DEFAULT_LED_FRAGMENT.to_string(),
            start_off: false,
            verbosity: 0,
            use_logind: false,
        }
    }
}

impl ResolvedConfig {
    /// The idle timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// The log level matching [`verbosity`](Self::verbosity).
    pub fn log_level(&self) -> LevelFilter {
        log_level(self.verbosity)
    }
}

/// Maps a verbosity to a log level: quiet apart from problems, then
/// progress, then every key event.
pub fn log_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Parses a timeout in whole seconds, falling back to the default for
/// negative or non-numeric input.
pub fn parse_timeout(raw: &str) -> u64 {
    match raw.trim().parse::<i64>() {
        Ok(secs) if secs >= 0 => secs as u64,
        Ok(_) => {
            warn!("timeout can't be negative; using default {DEFAULT_TIMEOUT_SECONDS}");
            DEFAULT_TIMEOUT_SECONDS
        }
        Err(_) => {
            warn!("timeout {raw:?} is not a number; using default {DEFAULT_TIMEOUT_SECONDS}");
            DEFAULT_TIMEOUT_SECONDS
        }
    }
}

/// Parses a brightness given either as a raw value (`"40"`) or as a
/// percentage of the maximum (`"50%"`).
///
/// Negative values, percentages outside `0..=100`, and anything that isn't a
/// number fall back to [`BrightnessSpec::Unset`].
pub fn parse_brightness(raw: &str) -> BrightnessSpec {
    let raw = raw.trim();

    if let Some(pct) = raw.strip_suffix('%') {
        return match pct.trim().parse::<i64>() {
            Ok(pct @ 0..=100) => BrightnessSpec::Percentage(pct as u8),
            Ok(_) => {
                warn!("brightness percentage out of range (0-100%); using default");
                BrightnessSpec::Unset
            }
            Err(_) => {
                warn!("brightness {raw:?} is not a percentage; using default");
                BrightnessSpec::Unset
            }
        };
    }

    match raw.parse::<i64>() {
        Ok(value) if value >= 0 => BrightnessSpec::Absolute(value),
        Ok(_) => {
            warn!("brightness can't be negative; using default");
            BrightnessSpec::Unset
        }
        Err(_) => {
            warn!("brightness {raw:?} is not a number; using default");
            BrightnessSpec::Unset
        }
    }
}
