// Dozer - Duty-cycled temperature and humidity reporter
//
// Copyright 2021 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::error::Error;
use std::fmt::{self, Formatter};
use std::thread;
use std::time::{Duration, Instant};

use rppal::gpio::{Gpio, IoPin, Mode, PullUpDown};

/// A decimal value with two fraction digits stored as an integer multiplied by 100.
///
/// Readings are accumulated and averaged in this form so that summing many of
/// them never drifts the way floating point values would.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Hundredths(i32);

impl Hundredths {
    pub fn new(v: i32) -> Self {
        Self(v)
    }

    pub fn get(&self) -> i32 {
        self.0
    }
}

impl From<i32> for Hundredths {
    fn from(v: i32) -> Self {
        Self(v)
    }
}

impl From<Hundredths> for f64 {
    fn from(v: Hundredths) -> Self {
        v.0 as f64 / 100.0
    }
}

impl fmt::Display for Hundredths {
    /// Always render exactly two fraction digits: `250` is `2.50`, `0` is `0.00`
    /// and `-5` is `-0.05`.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Temperature, in degrees celsius
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct TemperatureCelsius(Hundredths);

impl TemperatureCelsius {
    pub fn hundredths(&self) -> Hundredths {
        self.0
    }
}

impl From<Hundredths> for TemperatureCelsius {
    fn from(v: Hundredths) -> Self {
        Self(v)
    }
}

impl From<TemperatureCelsius> for f64 {
    fn from(v: TemperatureCelsius) -> Self {
        v.0.into()
    }
}

impl fmt::Display for TemperatureCelsius {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}c", self.0)
    }
}

/// Relative humidity (from 0 to 100)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Humidity(Hundredths);

impl Humidity {
    pub fn hundredths(&self) -> Hundredths {
        self.0
    }
}

impl From<Hundredths> for Humidity {
    fn from(v: Hundredths) -> Self {
        Self(v)
    }
}

impl From<Humidity> for f64 {
    fn from(v: Humidity) -> Self {
        v.0.into()
    }
}

impl fmt::Display for Humidity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Temperature and humidity recovered from a single successful exchange with the sensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodedReading {
    pub temperature: TemperatureCelsius,
    pub humidity: Humidity,
}

impl DecodedReading {
    pub fn new(temperature: TemperatureCelsius, humidity: Humidity) -> Self {
        Self { temperature, humidity }
    }
}

/// Ways a single exchange with the sensor can fail.
///
/// None of these are fatal. The exchange is simply retried, see `measure::Aggregator`.
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum DecodeError {
    /// The sensor never pulled the line low to acknowledge the start signal.
    NoResponse,
    /// The line stopped changing before the first data bit.
    Stalled,
    /// The frame ended early, with this many data bits recovered.
    Truncated(usize),
    /// The checksum byte did not match: expected (from the data), computed.
    ChecksumMismatch(u8, u8),
}

impl DecodeError {
    pub fn as_label(&self) -> &'static str {
        match self {
            DecodeError::NoResponse => "no_response",
            DecodeError::Stalled => "stalled",
            DecodeError::Truncated(_) => "truncated",
            DecodeError::ChecksumMismatch(_, _) => "checksum",
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::NoResponse => write!(f, "timeout waiting for sensor acknowledgment"),
            DecodeError::Stalled => write!(f, "data line stalled before the first data bit"),
            DecodeError::Truncated(bits) => write!(f, "truncated frame: only {} data bits recovered", bits),
            DecodeError::ChecksumMismatch(expected, got) => {
                write!(f, "checksum error: expected {}, got {}", expected, got)
            }
        }
    }
}

impl Error for DecodeError {}

/// Error acquiring the GPIO pin the sensor data line is connected to.
#[derive(Debug)]
pub struct PinError {
    msg: &'static str,
    cause: rppal::gpio::Error,
}

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.msg, self.cause)
    }
}

impl Error for PinError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}

/// Create a new `IoPin` based on the BCM GPIO pin number of the data wire of a
/// sensor.
///
/// Note that the BCM GPIO pin number is NOT the same as the physical pin number.
/// See [pinout] for more information.
///
/// [pinout]: https://www.raspberrypi.com/documentation/computers/os.html#gpio-and-the-40-pin-header
pub fn open_pin(bcm_gpio_pin: u8) -> Result<IoPin, PinError> {
    let controller = Gpio::new().map_err(|e| PinError {
        msg: "unable to create GPIO controller",
        cause: e,
    })?;

    let pin = controller.get(bcm_gpio_pin).map_err(|e| PinError {
        msg: "unable to acquire pin from controller",
        cause: e,
    })?;

    let mut io_pin = pin.into_io(Mode::Input);
    io_pin.set_pullupdown(PullUpDown::PullUp);
    Ok(io_pin)
}

/// Abstraction around an `rppal::gpio::IoPin` to allow for easier testing.
pub trait DataPin {
    fn is_low(&self) -> bool;
    fn is_high(&self) -> bool;
    fn pin(&self) -> u8;
    fn set_high(&mut self);
    fn set_low(&mut self);
    fn set_mode(&mut self, mode: Mode);
    fn enable_pull_up(&mut self);
}

impl DataPin for IoPin {
    fn is_low(&self) -> bool {
        IoPin::is_low(self)
    }

    fn is_high(&self) -> bool {
        IoPin::is_high(self)
    }

    fn pin(&self) -> u8 {
        IoPin::pin(self)
    }

    fn set_high(&mut self) {
        IoPin::set_high(self);
    }

    fn set_low(&mut self) {
        IoPin::set_low(self);
    }

    fn set_mode(&mut self, mode: Mode) {
        IoPin::set_mode(self, mode);
    }

    fn enable_pull_up(&mut self) {
        IoPin::set_pullupdown(self, PullUpDown::PullUp);
    }
}

/// Blocking delay used while talking to the sensor.
pub trait Delay {
    fn delay_us(&mut self, us: u32);

    fn delay_ms(&mut self, ms: u32) {
        self.delay_us(ms.saturating_mul(1000));
    }
}

/// `Delay` that busy-waits for short delays.
///
/// `thread::sleep` can't be trusted to return after a few microseconds, so anything
/// shorter than a millisecond spins on a monotonic clock instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinDelay;

const SPIN_LIMIT_US: u32 = 1000;

impl Delay for SpinDelay {
    fn delay_us(&mut self, us: u32) {
        let duration = Duration::from_micros(us as u64);
        if us >= SPIN_LIMIT_US {
            thread::sleep(duration);
            return;
        }

        let start = Instant::now();
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }
}
