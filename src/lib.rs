// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Automatic keyboard backlight control for Linux.
//!
//! This crate finds a keyboard under `/dev/input` and a keyboard backlight LED
//! under `/sys/class/leds`, then turns the LED on whenever a key is pressed and
//! back off once the keyboard has been idle for a while.
//!
//! The pieces are usable on their own:
//!
//! - [`resolve`] locates the keyboard and the LED.
//! - [`brightness`] reads and writes LED brightness, either directly through
//!   sysfs or through systemd-logind.
//! - [`monitor`] is the event loop that ties the two together.
//! - [`config`] holds the startup configuration and its lenient parsers.

pub mod brightness;
pub mod config;
pub mod monitor;
pub mod resolve;

pub use brightness::{Backlight, BrightnessSpec, LogindBacklight, SysfsBacklight};
pub use config::ResolvedConfig;
pub use monitor::{Keyboard, Monitor, MonitorError, Shutdown};
pub use resolve::{LedControl, ResolveError, Resolver};
