// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading and writing LED brightness.
//!
//! Reading and writing brightness is best-effort. A keyboard backlight that
//! fails to change is an annoyance, not a reason to stop watching the
//! keyboard, so those failures are logged and swallowed rather than returned.
//! Connecting to logind is the exception: [`LogindBacklight::connect`] reports
//! its errors to the caller.

use std::{ffi::OsString, fmt, fs, path::Path, path::PathBuf};

use log::{debug, warn};
use logind_zbus::session::SessionProxyBlocking;
use zbus::blocking::Connection;

/// The brightness the user asked for when the backlight is on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BrightnessSpec {
    /// Use the LED's maximum brightness.
    #[default]
    Unset,
    /// A raw value in the driver's own units.
    Absolute(i64),
    /// A percentage of the maximum, already validated to be in `0..=100`.
    Percentage(u8),
}

/// Something that can set the brightness of the keyboard backlight.
pub trait Backlight {
    /// Sets the backlight to `value`. Failures are logged, not reported.
    fn set(&mut self, value: u32);
}

/// Writes brightness straight into the LED's sysfs `brightness` file.
#[derive(Clone, Debug)]
pub struct SysfsBacklight {
    path: PathBuf,
}

impl SysfsBacklight {
    /// Creates a backlight writing to the given `brightness` file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The `brightness` file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backlight for SysfsBacklight {
    fn set(&mut self, value: u32) {
        write_brightness(&self.path, value);
    }
}

/// Sets brightness through the current logind session, which lets a user
/// logged in at the seat change the LED without write access to sysfs.
pub struct LogindBacklight {
    session: SessionProxyBlocking<'static>,
    name: String,
}

impl LogindBacklight {
    /// Connects to the system bus and the current session (`.../session/auto`)
    /// for the LED called `name` (its directory name in `/sys/class/leds`).
    pub fn connect(name: OsString) -> anyhow::Result<Self> {
        // logind talks DBus, so the name has to be UTF-8. The kernel sticks to
        // ASCII for LED names, so this is not expected to fail.
        let name = name
            .into_string()
            .map_err(|name| anyhow::anyhow!("LED name not valid UTF-8: {name:?}"))?;

        // Note that this happens on the SYSTEM bus, _not_ the SESSION bus!
        let conn = Connection::system()?;
        let session = SessionProxyBlocking::builder(&conn)
            .path("/org/freedesktop/login1/session/auto")?
            .build()?;

        Ok(Self { session, name })
    }
}

impl fmt::Debug for LogindBacklight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogindBacklight")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Backlight for LogindBacklight {
    fn set(&mut self, value: u32) {
        match self.session.set_brightness("leds", &self.name, value) {
            Ok(()) => debug!("set brightness of LED {} to {value} via logind", self.name),
            Err(e) => warn!("can't set brightness of LED {} to {value} via logind: {e}", self.name),
        }
    }
}

/// Reads the maximum brightness of an LED from its `max_brightness` file.
///
/// This never fails: a missing file, unparseable contents, or a value of zero
/// or less all produce 1. A dim backlight beats a division by zero.
pub fn read_max_brightness(path: &Path) -> u32 {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("can't read max brightness from {}: {e}; using 1", path.display());
            return 1;
        }
    };

    match contents.trim().parse::<i64>() {
        Ok(max) if max > 0 => u32::try_from(max).unwrap_or(u32::MAX),
        Ok(max) => {
            warn!("max brightness in {} is {max}; using 1", path.display());
            1
        }
        Err(e) => {
            warn!(
                "can't parse max brightness from {}: {contents:?} ({e}); using 1",
                path.display()
            );
            1
        }
    }
}

/// Writes `value` (plus a newline) to a `brightness` file, truncating it.
///
/// The file is opened and closed on every call. Failures are logged and
/// otherwise ignored.
pub fn write_brightness(path: &Path, value: u32) {
    match fs::write(path, format!("{value}\n")) {
        Ok(()) => debug!("set brightness of {} to {value}", path.display()),
        Err(e) => warn!("can't write brightness {value} to {}: {e}", path.display()),
    }
}

/// Works out the "on" brightness for a device with the given maximum.
///
/// The result is always in `0..=max`.
pub fn resolve_on_level(spec: BrightnessSpec, max: u32) -> u32 {
    match spec {
        BrightnessSpec::Unset => max,
        BrightnessSpec::Percentage(pct) => {
            let pct = u64::from(pct.min(100));
            // Can't overflow: max <= u32::MAX and pct <= 100.
            (u64::from(max) * pct / 100) as u32
        }
        BrightnessSpec::Absolute(value) => {
            u32::try_from(value.clamp(0, i64::from(max))).unwrap_or(max)
        }
    }
}
