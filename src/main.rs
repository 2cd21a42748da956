// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small daemon that turns the keyboard backlight on while you type and off
//! again once the keyboard has been idle for a few seconds.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use kbd_dimmer::{
    brightness::{self, Backlight},
    config::{self, ResolvedConfig},
    Keyboard, LogindBacklight, Monitor, Resolver, SysfsBacklight,
};
use log::info;

/// Turn the keyboard backlight on when a key is pressed, and off after a
/// period of inactivity.
#[derive(Parser)]
#[clap(version)]
struct KbdDimmer {
    /// Increase output. Pass twice to trace every key event.
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Seconds of inactivity before the backlight turns off.
    #[clap(short, long, value_name = "SECS", allow_negative_numbers = true)]
    timeout: Option<String>,

    /// Brightness when on, either absolute (0 to max) or a percentage of the
    /// maximum such as '50%'. Defaults to the maximum.
    #[clap(short, long, value_name = "VAL", allow_negative_numbers = true)]
    brightness: Option<String>,

    /// Keyboard event device to watch, e.g. /dev/input/event3. Use this to
    /// override the automatic detection logic.
    #[clap(short, long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Fragment of the LED name in /sys/class/leds, e.g. 'kbd_backlight'.
    #[clap(short, long, value_name = "NAME_FRAG")]
    led: Option<String>,

    /// Start with the backlight off and turn it on at the first keypress.
    #[clap(short, long)]
    initial_off: bool,

    /// Set brightness through systemd-logind, which works without write
    /// access to /sys for a user logged in at the seat.
    #[clap(long)]
    logind: bool,
}

impl KbdDimmer {
    fn into_config(self, verbosity: u8) -> ResolvedConfig {
        let defaults = ResolvedConfig::default();
        ResolvedConfig {
            timeout_seconds: self
                .timeout
                .as_deref()
                .map_or(defaults.timeout_seconds, config::parse_timeout),
            brightness: self
                .brightness
                .as_deref()
                .map_or(defaults.brightness, config::parse_brightness),
            device: self.device,
            led_fragment: self.led.unwrap_or(defaults.led_fragment),
            start_off: self.initial_off,
            verbosity,
            use_logind: self.logind,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = KbdDimmer::parse();
    let verbosity = args.verbose.min(2);
    init_logging(verbosity);

    // Warnings about malformed values come out of here, so logging has to be
    // up first.
    let config = args.into_config(verbosity);

    let resolver = Resolver::new();
    let keyboard_path = resolver.resolve_keyboard(config.device.as_deref())?;
    let led = resolver.resolve_led(&config.led_fragment, !config.use_logind)?;

    let max = brightness::read_max_brightness(&led.max_brightness);
    let on_level = brightness::resolve_on_level(config.brightness, max);

    info!("configuration:");
    info!("  keyboard device: {}", keyboard_path.display());
    info!("  LED brightness: {} (max: {max})", led.brightness.display());
    info!("  timeout: {} seconds", config.timeout_seconds);
    info!("  brightness on: {on_level}, off: {}", kbd_dimmer::monitor::OFF_LEVEL);
    info!("  initial state: {}", if config.start_off { "off" } else { "on" });
    info!("  verbosity: {} ({})", config.verbosity, config.log_level());

    let keyboard = Keyboard::open(&keyboard_path)
        .with_context(|| format!("can't open input device {}", keyboard_path.display()))?;

    if config.use_logind {
        let backlight = LogindBacklight::connect(led.name.clone())
            .with_context(|| format!("can't reach logind for LED {:?}", led.name))?;
        run(keyboard, backlight, &config, on_level)
    } else {
        run(keyboard, SysfsBacklight::new(led.brightness), &config, on_level)
    }
}

fn run(
    keyboard: Keyboard,
    backlight: impl Backlight,
    config: &ResolvedConfig,
    on_level: u32,
) -> anyhow::Result<()> {
    let path = keyboard.path().to_owned();
    let monitor = Monitor::new(keyboard, backlight, config.timeout(), on_level, config.start_off);
    let shutdown = monitor
        .run()
        .with_context(|| format!("lost keyboard {}", path.display()))?;
    info!("stopped: {shutdown:?}");
    Ok(())
}

/// Sets up `env_logger` at a level matching `-v`. `RUST_LOG` still wins.
fn init_logging(verbosity: u8) {
    env_logger::Builder::new()
        .filter_level(config::log_level(verbosity))
        .parse_default_env()
        .init();
}
