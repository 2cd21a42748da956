// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Finding the keyboard and its backlight.
//!
//! Neither the input subsystem nor the LED class offers a way to ask "which one
//! is the keyboard?", so we do it the hard way: walk the directories the kernel
//! and udev give us and apply a couple of heuristics.

use std::{
    collections::BTreeSet,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use evdev::{Device, EventType, Key};
use log::{debug, error, info};
use nix::unistd::{access, AccessFlags};

/// Keys that mark a `by-path` keyboard candidate as a real keyboard.
const BY_PATH_KEYS: [Key; 3] = [Key::KEY_Q, Key::KEY_SPACE, Key::KEY_ENTER];

/// Keys that mark a raw `event<N>` candidate as a real keyboard.
const RAW_SCAN_KEYS: [Key; 3] = [Key::KEY_Q, Key::KEY_A, Key::KEY_SPACE];

/// Name marker udev uses for keyboard-class links in `by-path`.
const BY_PATH_KBD_MARKER: &str = "-event-kbd";

/// Reasons startup discovery can fail.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The keyboard device given by the user can't be read.
    #[error("keyboard device {} is not accessible", .0.display())]
    DeviceNotAccessible(PathBuf),
    /// Neither `by-path` nor the raw `event<N>` scan turned up a keyboard.
    #[error("no suitable keyboard event device found")]
    NoKeyboardFound,
    /// No LED matched the name fragment, or none that did was usable.
    #[error("no keyboard backlight LED found in {} matching {fragment:?}", dir.display())]
    NoLedFound {
        /// The name fragment that was searched for.
        fragment: String,
        /// The LED class directory that was searched.
        dir: PathBuf,
    },
}

/// Directories searched during discovery.
#[derive(Clone, Debug)]
pub struct DeviceRoots {
    /// Stable, physically-named input links, e.g. `/dev/input/by-path`.
    pub by_path: PathBuf,
    /// Raw input event nodes, e.g. `/dev/input`.
    pub input: PathBuf,
    /// LED class devices, e.g. `/sys/class/leds`.
    pub leds: PathBuf,
}

impl Default for DeviceRoots {
    fn default() -> Self {
        Self {
            by_path: PathBuf::from("/dev/input/by-path"),
            input: PathBuf::from("/dev/input"),
            leds: PathBuf::from("/sys/class/leds"),
        }
    }
}

/// What an input device says it can report.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    classes: BTreeSet<u16>,
    keys: BTreeSet<u16>,
}

impl Capabilities {
    /// Builds a capability set from event classes and key codes.
    pub fn new(
        classes: impl IntoIterator<Item = EventType>,
        keys: impl IntoIterator<Item = Key>,
    ) -> Self {
        Self {
            classes: classes.into_iter().map(|class| class.0).collect(),
            keys: keys.into_iter().map(|key| key.code()).collect(),
        }
    }

    /// Checks whether the device reports events of the given class.
    pub fn supports(&self, class: EventType) -> bool {
        self.classes.contains(&class.0)
    }

    /// Checks whether the device reports the given key.
    pub fn supports_key(&self, key: Key) -> bool {
        self.keys.contains(&key.code())
    }

    /// The keyboard heuristic: key events, and at least one of `whitelist`.
    fn looks_like_keyboard(&self, whitelist: &[Key]) -> bool {
        self.supports(EventType::KEY) && whitelist.iter().any(|&key| self.supports_key(key))
    }
}

/// Asks an input device node for its capabilities.
pub trait Probe {
    /// Opens `path`, reads its capabilities and closes it again.
    fn probe(&self, path: &Path) -> io::Result<Capabilities>;
}

/// Probes real devices with the `EVIOCGBIT` ioctls.
#[derive(Copy, Clone, Debug, Default)]
pub struct EvdevProbe;

impl Probe for EvdevProbe {
    fn probe(&self, path: &Path) -> io::Result<Capabilities> {
        let dev = Device::open(path)?;
        let keys = dev
            .supported_keys()
            .map(|keys| keys.iter().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(Capabilities::new(dev.supported_events().iter(), keys))
    }
}

/// The sysfs files controlling one LED.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedControl {
    /// Directory name of the LED, e.g. `tpacpi::kbd_backlight`.
    pub name: OsString,
    /// The writable `brightness` file.
    pub brightness: PathBuf,
    /// The readable `max_brightness` file.
    pub max_brightness: PathBuf,
}

/// Locates the keyboard and backlight devices.
#[derive(Clone, Debug, Default)]
pub struct Resolver<P = EvdevProbe> {
    roots: DeviceRoots,
    probe: P,
}

impl Resolver<EvdevProbe> {
    /// A resolver for the usual system locations.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P: Probe> Resolver<P> {
    /// A resolver searching `roots`, checking candidates with `probe`.
    pub fn with_roots(roots: DeviceRoots, probe: P) -> Self {
        Self { roots, probe }
    }

    /// Finds the keyboard event device.
    ///
    /// If `hint` is given it is used as-is, provided it can be read. Otherwise
    /// `by-path` keyboard links are tried first, then every raw `event<N>`
    /// node.
    pub fn resolve_keyboard(&self, hint: Option<&Path>) -> Result<PathBuf, ResolveError> {
        if let Some(path) = hint {
            if access(path, AccessFlags::R_OK).is_err() {
                return Err(ResolveError::DeviceNotAccessible(path.to_owned()));
            }
            info!("using user-specified keyboard device: {}", path.display());
            return Ok(path.to_owned());
        }

        debug!("searching for keyboard in {}", self.roots.by_path.display());
        match self.scan(
            &self.roots.by_path,
            |name| name.contains(BY_PATH_KBD_MARKER),
            &BY_PATH_KEYS,
        ) {
            Ok(Some(path)) => {
                info!("found keyboard (by-path): {}", path.display());
                return Ok(path);
            }
            Ok(None) => (),
            // Plenty of systems don't have by-path links at all.
            Err(e) => debug!("can't read {}: {e}", self.roots.by_path.display()),
        }

        debug!("searching for keyboard in {}/event*", self.roots.input.display());
        match self.scan(&self.roots.input, is_event_node, &RAW_SCAN_KEYS) {
            Ok(Some(path)) => {
                info!("found keyboard (event scan): {}", path.display());
                Ok(path)
            }
            Ok(None) => Err(ResolveError::NoKeyboardFound),
            Err(e) => {
                error!("can't read {}: {e}", self.roots.input.display());
                Err(ResolveError::NoKeyboardFound)
            }
        }
    }

    /// Finds the LED whose name contains `fragment`.
    ///
    /// The first match in directory order with a usable `brightness` and a
    /// readable `max_brightness` wins. With `need_write` unset the
    /// `brightness` file only has to exist, for when something else (logind)
    /// does the writing.
    pub fn resolve_led(&self, fragment: &str, need_write: bool) -> Result<LedControl, ResolveError> {
        let not_found = || ResolveError::NoLedFound {
            fragment: fragment.to_owned(),
            dir: self.roots.leds.clone(),
        };

        debug!(
            "searching for LED matching {fragment:?} in {}",
            self.roots.leds.display()
        );
        let dir = match fs::read_dir(&self.roots.leds) {
            Ok(dir) => dir,
            Err(e) => {
                error!("can't read {}: {e}", self.roots.leds.display());
                return Err(not_found());
            }
        };

        let brightness_mode = if need_write {
            AccessFlags::W_OK
        } else {
            AccessFlags::F_OK
        };

        for dirent in dir.flatten() {
            let name = dirent.file_name();
            if !name.to_str().is_some_and(|name| name.contains(fragment)) {
                continue;
            }

            let path = dirent.path();
            let brightness = path.join("brightness");
            let max_brightness = path.join("max_brightness");

            if access(&brightness, brightness_mode).is_ok()
                && access(&max_brightness, AccessFlags::R_OK).is_ok()
            {
                info!("found LED control: {}", path.display());
                return Ok(LedControl {
                    name,
                    brightness,
                    max_brightness,
                });
            }
            debug!("skipping LED at {}: brightness files not accessible", path.display());
        }

        Err(not_found())
    }

    /// Returns the first entry of `dir` whose name passes `name_ok` and whose
    /// capabilities look like a keyboard.
    fn scan(
        &self,
        dir: &Path,
        name_ok: impl Fn(&str) -> bool,
        whitelist: &[Key],
    ) -> io::Result<Option<PathBuf>> {
        let entries = fs::read_dir(dir)?.map(|dirent| dirent.map(|d| (d.file_name(), d.path())));
        Ok(self.pick(entries, name_ok, whitelist))
    }

    /// Returns the first of `entries` whose name passes `name_ok` and whose
    /// capabilities look like a keyboard. Unreadable entries are skipped.
    fn pick(
        &self,
        entries: impl Iterator<Item = io::Result<(OsString, PathBuf)>>,
        name_ok: impl Fn(&str) -> bool,
        whitelist: &[Key],
    ) -> Option<PathBuf> {
        for entry in entries {
            let (name, path) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("skipping unreadable directory entry: {e}");
                    continue;
                }
            };
            if !name.to_str().is_some_and(&name_ok) {
                continue;
            }

            match self.probe.probe(&path) {
                Ok(caps) if caps.looks_like_keyboard(whitelist) => return Some(path),
                Ok(_) => debug!("skipping {}: doesn't look like a keyboard", path.display()),
                Err(e) => debug!("skipping {}: {e}", path.display()),
            }
        }
        None
    }
}

/// Matches raw input node names of the form `event<N>`.
fn is_event_node(name: &str) -> bool {
    name.strip_prefix("event")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}
