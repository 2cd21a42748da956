// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The keyboard activity loop.
//!
//! The loop sleeps in `poll(2)` for at most [`POLL_INTERVAL`] at a time, so the
//! idle timeout gets checked even when nobody is typing. Worst-case latency
//! for switching the backlight off is therefore one poll interval.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    os::{fd::AsFd, unix::fs::OpenOptionsExt},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use evdev::EventType;
use log::{debug, info, trace};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::brightness::Backlight;

/// Longest single wait for keyboard input.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Brightness written when the backlight is off.
pub const OFF_LEVEL: u32 = 0;

/// Size of one `struct input_event` as the kernel hands it out.
pub const EVENT_SIZE: usize = std::mem::size_of::<libc::input_event>();

/// Key pressed.
const KEY_PRESS: i32 = 1;
/// Key held down long enough to autorepeat.
const KEY_REPEAT: i32 = 2;

/// Why the loop stopped without an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Shutdown {
    /// The keyboard went away (end of file on the event device).
    DeviceClosed,
}

/// Fatal errors from the keyboard while the loop is running.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Waiting for the keyboard to become readable failed.
    #[error("waiting for keyboard events failed")]
    Wait(#[source] io::Error),
    /// Reading an event from the keyboard failed.
    #[error("reading from keyboard failed")]
    Read(#[source] io::Error),
}

/// A source of raw input event records.
pub trait EventSource {
    /// Waits up to `timeout` for a record to become available. Returns `true`
    /// if one can be read.
    fn wait(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Reads a single record into `buf`, returning the number of bytes read.
    fn read_record(&mut self, buf: &mut [u8; EVENT_SIZE]) -> io::Result<usize>;
}

/// An open keyboard event device.
#[derive(Debug)]
pub struct Keyboard {
    file: File,
    path: PathBuf,
}

impl Keyboard {
    /// Opens the event device at `path` for non-blocking reads.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    /// The device's path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSource for Keyboard {
    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(millis))?;
        Ok(ready > 0)
    }

    fn read_record(&mut self, buf: &mut [u8; EVENT_SIZE]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// The parts of an input event the loop cares about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct RawEvent {
    kind: u16,
    code: u16,
    value: i32,
}

impl RawEvent {
    /// Decodes a `struct input_event`. The timestamp leads the record and is
    /// followed by `type: u16`, `code: u16` and `value: i32`.
    fn decode(buf: &[u8; EVENT_SIZE]) -> Self {
        let tail = &buf[EVENT_SIZE - 8..];
        Self {
            kind: u16::from_ne_bytes([tail[0], tail[1]]),
            code: u16::from_ne_bytes([tail[2], tail[3]]),
            value: i32::from_ne_bytes([tail[4], tail[5], tail[6], tail[7]]),
        }
    }

    fn is_key(&self) -> bool {
        self.kind == EventType::KEY.0
    }
}

/// Source of the current time.
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> Instant;
}

/// The monotonic system clock.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Whether the backlight is on, and when the keyboard was last touched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BacklightState {
    /// The backlight is currently on.
    pub is_on: bool,
    /// Time of the most recent key event of any kind.
    pub last_activity: Instant,
}

/// Drives the backlight from keyboard activity.
#[derive(Debug)]
pub struct Monitor<S, B, C = SystemClock> {
    source: S,
    backlight: B,
    clock: C,
    timeout: Duration,
    on_level: u32,
    state: BacklightState,
}

impl<S: EventSource, B: Backlight> Monitor<S, B> {
    /// Creates a monitor using the system clock.
    ///
    /// `on_level` is the brightness to use when keys are being pressed, and
    /// `timeout` is how long the keyboard has to be idle before the backlight
    /// goes off.
    pub fn new(source: S, backlight: B, timeout: Duration, on_level: u32, start_off: bool) -> Self {
        Self::with_clock(source, backlight, SystemClock, timeout, on_level, start_off)
    }
}

impl<S: EventSource, B: Backlight, C: Clock> Monitor<S, B, C> {
    /// Creates a monitor reading time from `clock`.
    pub fn with_clock(
        source: S,
        backlight: B,
        clock: C,
        timeout: Duration,
        on_level: u32,
        start_off: bool,
    ) -> Self {
        let state = BacklightState {
            is_on: !start_off,
            last_activity: clock.now(),
        };
        Self {
            source,
            backlight,
            clock,
            timeout,
            on_level,
            state,
        }
    }

    /// The current backlight state.
    pub fn state(&self) -> BacklightState {
        self.state
    }

    /// Runs until the keyboard goes away or fails.
    ///
    /// The initial brightness is written first. However the loop ends, the
    /// keyboard is closed and the backlight is switched off before returning.
    pub fn run(mut self) -> Result<Shutdown, MonitorError> {
        self.state.last_activity = self.clock.now();
        let initial = if self.state.is_on {
            self.on_level
        } else {
            OFF_LEVEL
        };
        self.backlight.set(initial);

        let outcome = self.pump();

        let Self {
            source,
            mut backlight,
            ..
        } = self;
        drop(source);
        info!("exiting, turning backlight off");
        backlight.set(OFF_LEVEL);

        outcome
    }

    fn pump(&mut self) -> Result<Shutdown, MonitorError> {
        loop {
            let readable = match self.source.wait(POLL_INTERVAL) {
                Ok(readable) => readable,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MonitorError::Wait(e)),
            };
            let now = self.clock.now();

            if readable {
                let mut buf = [0; EVENT_SIZE];
                match self.source.read_record(&mut buf) {
                    Ok(0) => {
                        info!("end of file on keyboard device");
                        return Ok(Shutdown::DeviceClosed);
                    }
                    Ok(EVENT_SIZE) => self.handle(RawEvent::decode(&buf), now),
                    Ok(n) => debug!("partial read from keyboard ({n} bytes), discarding"),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // Somebody else drained the queue between poll and read.
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => (),
                    Err(e) => return Err(MonitorError::Read(e)),
                }
            }

            self.check_idle(now);
        }
    }

    /// Updates state for one input event observed at `now`.
    fn handle(&mut self, event: RawEvent, now: Instant) {
        if !event.is_key() {
            return;
        }
        trace!(
            "key event: type={}, code={}, value={}",
            event.kind,
            event.code,
            event.value
        );

        if matches!(event.value, KEY_PRESS | KEY_REPEAT) && !self.state.is_on {
            info!("key pressed, turning backlight on");
            self.backlight.set(self.on_level);
            self.state.is_on = true;
        }
        // Any key event counts as activity, even the ones that don't switch
        // the light on.
        self.state.last_activity = now;
    }

    fn check_idle(&mut self, now: Instant) {
        if !self.state.is_on {
            return;
        }
        let idle = now.saturating_duration_since(self.state.last_activity);
        if idle >= self.timeout {
            info!("idle for {idle:?}, turning backlight off");
            self.backlight.set(OFF_LEVEL);
            self.state.is_on = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        io::Write,
        rc::Rc,
    };

    const ON: u32 = 100;

    #[derive(Clone)]
    struct FakeClock(Rc<Cell<Instant>>);

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    #[derive(Clone, Default)]
    struct FakeBacklight(Rc<RefCell<Vec<u32>>>);

    impl Backlight for FakeBacklight {
        fn set(&mut self, value: u32) {
            self.0.borrow_mut().push(value);
        }
    }

    /// What the fake keyboard does on one trip around the loop.
    #[derive(Copy, Clone, Debug)]
    enum Step {
        /// Nothing happens for a whole poll interval.
        Tick,
        /// A key event with the given value.
        Key(i32),
        /// An event of some other class.
        Other(EventType, i32),
        Interrupted,
        WaitFailed,
        Partial,
        WouldBlock,
        ReadFailed,
    }

    use Step::*;

    /// Plays back a script, one step per wait. Every wait takes a full poll
    /// interval. Once the script runs out the device reports end of file.
    struct FakeKeyboard {
        clock: FakeClock,
        script: VecDeque<Step>,
        pending: Option<Step>,
    }

    impl EventSource for FakeKeyboard {
        fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
            self.clock.0.set(self.clock.0.get() + timeout);
            self.pending = self.script.pop_front();
            match self.pending {
                Some(Tick) => Ok(false),
                Some(Interrupted) => Err(io::ErrorKind::Interrupted.into()),
                Some(WaitFailed) => Err(io::Error::from_raw_os_error(libc::EBADF)),
                _ => Ok(true),
            }
        }

        fn read_record(&mut self, buf: &mut [u8; EVENT_SIZE]) -> io::Result<usize> {
            match self.pending.take() {
                Some(Key(value)) => Ok(encode(buf, EventType::KEY, evdev::Key::KEY_A.code(), value)),
                Some(Other(kind, value)) => Ok(encode(buf, kind, 0, value)),
                Some(Partial) => Ok(EVENT_SIZE / 2),
                Some(WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
                Some(ReadFailed) => Err(io::Error::from_raw_os_error(libc::ENODEV)),
                _ => Ok(0),
            }
        }
    }

    fn encode(buf: &mut [u8; EVENT_SIZE], kind: EventType, code: u16, value: i32) -> usize {
        let tail = &mut buf[EVENT_SIZE - 8..];
        tail[..2].copy_from_slice(&kind.0.to_ne_bytes());
        tail[2..4].copy_from_slice(&code.to_ne_bytes());
        tail[4..].copy_from_slice(&value.to_ne_bytes());
        EVENT_SIZE
    }

    /// Runs `script` with a 2 second timeout and returns the outcome and every
    /// brightness written.
    fn run(start_off: bool, script: &[Step]) -> (Result<Shutdown, MonitorError>, Vec<u32>) {
        let clock = FakeClock(Rc::new(Cell::new(Instant::now())));
        let keyboard = FakeKeyboard {
            clock: clock.clone(),
            script: script.iter().copied().collect(),
            pending: None,
        };
        let backlight = FakeBacklight::default();
        let writes = backlight.0.clone();

        let monitor = Monitor::with_clock(
            keyboard,
            backlight,
            clock,
            Duration::from_secs(2),
            ON,
            start_off,
        );
        let outcome = monitor.run();
        let writes = writes.borrow().clone();
        (outcome, writes)
    }

    #[test]
    fn decodes_event_tail() {
        let mut buf = [0xaa; EVENT_SIZE];
        encode(&mut buf, EventType::KEY, evdev::Key::KEY_Q.code(), KEY_REPEAT);
        let event = RawEvent::decode(&buf);
        assert!(event.is_key());
        assert_eq!(event.code, evdev::Key::KEY_Q.code());
        assert_eq!(event.value, KEY_REPEAT);
    }

    #[test]
    fn initial_state() {
        let clock = FakeClock(Rc::new(Cell::new(Instant::now())));
        let keyboard = FakeKeyboard {
            clock: clock.clone(),
            script: VecDeque::new(),
            pending: None,
        };
        let monitor = Monitor::with_clock(
            keyboard,
            FakeBacklight::default(),
            clock.clone(),
            Duration::from_secs(2),
            ON,
            true,
        );
        assert!(!monitor.state().is_on);
        assert_eq!(monitor.state().last_activity, clock.now());
    }

    #[test]
    fn stays_on_until_timeout() {
        // Press at 0.5s, last tick at 2.0s: not idle long enough yet.
        let (outcome, writes) = run(false, &[Key(1), Tick, Tick, Tick]);
        assert_eq!(outcome.unwrap(), Shutdown::DeviceClosed);
        assert_eq!(writes, [ON, OFF_LEVEL]);

        // One more tick at 2.5s crosses the timeout.
        let (_, writes) = run(false, &[Key(1), Tick, Tick, Tick, Tick]);
        assert_eq!(writes, [ON, OFF_LEVEL, OFF_LEVEL]);
    }

    #[test]
    fn off_after_timeout_then_on_again() {
        let mut script = vec![Key(1)];
        script.extend([Tick; 8]);
        script.push(Key(1));
        let (outcome, writes) = run(false, &script);
        assert_eq!(outcome.unwrap(), Shutdown::DeviceClosed);
        assert_eq!(writes, [ON, OFF_LEVEL, ON, OFF_LEVEL]);
    }

    #[test]
    fn starts_off() {
        let (_, writes) = run(true, &[Tick, Key(1)]);
        assert_eq!(writes, [OFF_LEVEL, ON, OFF_LEVEL]);
    }

    #[test]
    fn autorepeat_turns_on() {
        let (_, writes) = run(true, &[Key(2)]);
        assert_eq!(writes, [OFF_LEVEL, ON, OFF_LEVEL]);
    }

    #[test]
    fn release_does_not_turn_on() {
        let (_, writes) = run(true, &[Key(0), Tick]);
        assert_eq!(writes, [OFF_LEVEL, OFF_LEVEL]);
    }

    #[test]
    fn release_counts_as_activity() {
        // Without the release at 1.5s this would time out at 2.0s.
        let (_, writes) = run(false, &[Tick, Tick, Key(0), Tick, Tick, Tick]);
        assert_eq!(writes, [ON, OFF_LEVEL]);

        let (_, writes) = run(false, &[Tick, Tick, Key(0), Tick, Tick, Tick, Tick]);
        assert_eq!(writes, [ON, OFF_LEVEL, OFF_LEVEL]);
    }

    #[test]
    fn no_redundant_writes_while_on() {
        let (_, writes) = run(false, &[Key(1), Key(2), Key(0), Key(1), Key(1)]);
        assert_eq!(writes, [ON, OFF_LEVEL]);
    }

    #[test]
    fn ignores_non_key_events() {
        let (_, writes) = run(
            true,
            &[Other(EventType::MISC, 1), Other(EventType::SYNCHRONIZATION, 0)],
        );
        assert_eq!(writes, [OFF_LEVEL, OFF_LEVEL]);

        // Non-key events don't count as activity either.
        let (_, writes) = run(false, &[Tick, Other(EventType::LED, 1), Tick, Tick]);
        assert_eq!(writes, [ON, OFF_LEVEL, OFF_LEVEL]);
    }

    #[test]
    fn transient_conditions_are_survived() {
        let (outcome, writes) = run(true, &[Interrupted, Partial, WouldBlock, Key(1)]);
        assert_eq!(outcome.unwrap(), Shutdown::DeviceClosed);
        assert_eq!(writes, [OFF_LEVEL, ON, OFF_LEVEL]);
    }

    #[test]
    fn wait_failure_is_fatal() {
        let (outcome, writes) = run(false, &[WaitFailed, Key(1)]);
        assert!(matches!(outcome, Err(MonitorError::Wait(_))));
        assert_eq!(writes, [ON, OFF_LEVEL]);
    }

    #[test]
    fn read_failure_is_fatal() {
        let (outcome, writes) = run(true, &[ReadFailed, Key(1)]);
        assert!(matches!(outcome, Err(MonitorError::Read(_))));
        assert_eq!(writes, [OFF_LEVEL, OFF_LEVEL]);
    }

    #[test]
    fn unusual_key_values_count_as_activity() {
        // A key event with a value outside 0..=2 keeps the light on but
        // doesn't switch it on.
        let (_, writes) = run(false, &[Tick, Tick, Key(7), Tick, Tick, Tick]);
        assert_eq!(writes, [ON, OFF_LEVEL]);

        let (_, writes) = run(true, &[Key(7)]);
        assert_eq!(writes, [OFF_LEVEL, OFF_LEVEL]);
    }

    #[test]
    fn reads_from_real_handle_until_writer_closes() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("event0");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();

        // Opening the read end must not block, even with no writer yet.
        let keyboard = Keyboard::open(&fifo).unwrap();
        assert_eq!(keyboard.path(), fifo.as_path());

        let mut writer = OpenOptions::new().write(true).open(&fifo).unwrap();
        let mut record = [0; EVENT_SIZE];
        encode(&mut record, EventType::KEY, evdev::Key::KEY_A.code(), KEY_PRESS);
        writer.write_all(&record).unwrap();
        writer.write_all(&record[..EVENT_SIZE / 2]).unwrap();
        drop(writer);

        let backlight = FakeBacklight::default();
        let writes = backlight.0.clone();
        let monitor = Monitor::new(keyboard, backlight, Duration::from_secs(60), ON, true);

        assert_eq!(monitor.run().unwrap(), Shutdown::DeviceClosed);
        assert_eq!(*writes.borrow(), [OFF_LEVEL, ON, OFF_LEVEL]);
    }
}
