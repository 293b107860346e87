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

use crate::sensor::core::{
    DataPin, DecodeError, DecodedReading, Delay, Humidity, Hundredths, SpinDelay, TemperatureCelsius,
};
use rppal::gpio::Mode;
use std::fmt::{Debug, Formatter};

/// How long to hold the line high so the sensor wakes up and rests.
pub(crate) const WAKE_HIGH_MS: u32 = 250;
/// How long to hold the line low as the start signal.
pub(crate) const START_LOW_MS: u32 = 20;
/// How long to hold the line high before releasing it to the sensor.
pub(crate) const RELEASE_HIGH_US: u32 = 40;
/// Number of 1us polls to wait for the sensor to acknowledge the start signal.
pub(crate) const MAX_ACK_POLLS: u32 = 200_000;
/// Upper bound on the number of transitions sampled in a single exchange.
pub(crate) const MAX_TRANSITIONS: usize = 10_000;
/// Number of 1us polls without a level change after which the line is considered stalled.
pub(crate) const STALL_POLLS: u32 = 1000;
/// High pulses lasting at least this many polls are 1 bits, shorter ones are 0 bits.
pub(crate) const BIT_THRESHOLD: u32 = 20;
/// Transitions before the first data bit: the host release and the sensor's
/// low/high response, followed by the low half of the first bit.
pub(crate) const SYNC_TRANSITIONS: usize = 4;
pub(crate) const DATA_BITS: usize = 40;
pub(crate) const MIN_DATA_BITS: usize = 39;
pub(crate) const DATA_SIZE: usize = 5;

/// Transitions needed to capture every data bit. The last one is the high half
/// of the 40th bit, there's no need to wait for the trailing low pulse.
const FRAME_TRANSITIONS: usize = SYNC_TRANSITIONS + DATA_BITS * 2 - 1;

/// Source of single temperature and humidity readings.
///
/// Implementations make exactly one attempt per call, retries are up to the caller.
pub trait Decode {
    fn decode(&mut self) -> Result<DecodedReading, DecodeError>;
}

/// Poll counts of how long the data pin spent at each level before flipping.
///
/// Even entries are high-to-low waits and odd entries are low-to-high waits,
/// starting from the moment the sensor acknowledged the start signal.
#[derive(Debug)]
struct Pulses {
    counts: Vec<u32>,
    stalled: bool,
}

impl Pulses {
    /// Count the number of 1us polls the given pin spends at each level until all
    /// data bits have been seen or the line stops changing.
    ///
    /// NOTE: This method assumes the sensor has already acknowledged the start
    /// signal and is holding the line low.
    fn from_data_pin(pin: &dyn DataPin, delay: &mut dyn Delay) -> Self {
        let mut counts = Vec::with_capacity(FRAME_TRANSITIONS);
        let mut stalled = false;
        let mut last_high = true;

        for _ in 0..MAX_TRANSITIONS {
            let mut count = 0;
            while pin.is_high() == last_high {
                count += 1;
                delay.delay_us(1);
                if count == STALL_POLLS {
                    break;
                }
            }

            if count == STALL_POLLS {
                stalled = true;
                break;
            }

            last_high = pin.is_high();
            counts.push(count);

            if counts.len() == FRAME_TRANSITIONS {
                break;
            }
        }

        tracing::trace!(message = "reading pulse counts", counts = ?counts, stalled = stalled);
        Self { counts, stalled }
    }

    /// Return an iterator over the high half of each data bit.
    fn data(&self) -> impl Iterator<Item = &u32> {
        // Skip the synchronization transitions then take every second count, the
        // low halves of each bit are always the same length and carry no data.
        self.counts.iter().skip(SYNC_TRANSITIONS).step_by(2)
    }
}

/// Bytes read from a sensor, computed from pulse counts.
///
/// Bytes read make up humidity data, temperature data, and a checksum to ensure
/// the reading is valid.
#[derive(Debug)]
struct Reading {
    bytes: [u8; DATA_SIZE],
}

impl Reading {
    fn from_pulses(pulses: &Pulses) -> Result<Self, DecodeError> {
        let bits = pulses.data().count();
        if bits < MIN_DATA_BITS {
            return if pulses.stalled && pulses.counts.len() <= SYNC_TRANSITIONS {
                Err(DecodeError::Stalled)
            } else {
                Err(DecodeError::Truncated(bits))
            };
        }

        let mut bytes: [u8; DATA_SIZE] = [0; DATA_SIZE];
        for (i, &v) in pulses.data().enumerate() {
            // Bits arrive MSB first. Divide by eight to figure out which byte this
            // bit ends up in and shift the current value left.
            let index = i / 8;
            bytes[index] <<= 1;

            if v >= BIT_THRESHOLD {
                bytes[index] |= 1;
            }
        }

        Self::checksum_bytes(&bytes)?;
        Ok(Reading { bytes })
    }

    fn checksum_bytes(bytes: &[u8; DATA_SIZE]) -> Result<(), DecodeError> {
        let expected = bytes[4];
        let computed = ((bytes[0] as u16 + bytes[1] as u16 + bytes[2] as u16 + bytes[3] as u16) & 0xFF) as u8;

        tracing::debug!(
            message = "computing checksum for sensor data",
            computed = computed,
            expected = expected
        );

        if computed != expected {
            Err(DecodeError::ChecksumMismatch(expected, computed))
        } else {
            Ok(())
        }
    }
}

impl From<Reading> for DecodedReading {
    /// Integer and fraction bytes combine as `int + frac / 100`, kept here as hundredths.
    fn from(reading: Reading) -> Self {
        let humidity = Humidity::from(Hundredths::new(
            reading.bytes[0] as i32 * 100 + reading.bytes[1] as i32,
        ));
        let temperature = TemperatureCelsius::from(Hundredths::new(
            reading.bytes[2] as i32 * 100 + reading.bytes[3] as i32,
        ));

        tracing::debug!(
            message = "parsed sensor data",
            humidity_int = reading.bytes[0],
            humidity_frac = reading.bytes[1],
            temperature_int = reading.bytes[2],
            temperature_frac = reading.bytes[3],
            temperature = %temperature,
            humidity = %humidity
        );

        DecodedReading::new(temperature, humidity)
    }
}

/// Read temperature in degrees celsius and relative humidity from a DHT22 sensor
pub struct DHT22Sensor {
    pin: Box<dyn DataPin + Send + Sync + 'static>,
    delay: Box<dyn Delay + Send + Sync + 'static>,
}

impl DHT22Sensor {
    pub fn from_pin<T>(pin: T) -> Self
    where
        T: DataPin + Send + Sync + 'static,
    {
        Self::with_delay(pin, SpinDelay)
    }

    pub fn with_delay<T, D>(pin: T, delay: D) -> Self
    where
        T: DataPin + Send + Sync + 'static,
        D: Delay + Send + Sync + 'static,
    {
        Self {
            pin: Box::new(pin),
            delay: Box::new(delay),
        }
    }

    fn prepare_for_read(&mut self) {
        // Host needs to set the sensor:
        // * high to wake it up and let it rest
        // * low for the start signal
        // * high briefly, then release the line and let the pull-up hold it
        self.pin.set_mode(Mode::Output);
        self.pin.set_high();
        self.delay.delay_ms(WAKE_HIGH_MS);
        self.pin.set_low();
        self.delay.delay_ms(START_LOW_MS);
        self.pin.set_high();
        self.delay.delay_us(RELEASE_HIGH_US);
        self.pin.set_mode(Mode::Input);
        self.pin.enable_pull_up();
    }

    /// Wait for the sensor to pull the line low in response to the start signal.
    fn wait_for_ack(&mut self) -> Result<(), DecodeError> {
        let mut polls = 0;
        while self.pin.is_high() && polls < MAX_ACK_POLLS {
            self.delay.delay_us(1);
            polls += 1;
        }

        if polls == MAX_ACK_POLLS {
            Err(DecodeError::NoResponse)
        } else {
            tracing::trace!(message = "sensor acknowledged start signal", polls = polls);
            Ok(())
        }
    }
}

impl Decode for DHT22Sensor {
    /// Read temperature and humidity from the sensor or return an error if the
    /// read failed with details about what caused the read to fail.
    ///
    /// This blocks the calling thread for the whole exchange, a bit more than a
    /// quarter of a second.
    fn decode(&mut self) -> Result<DecodedReading, DecodeError> {
        self.prepare_for_read();
        self.wait_for_ack()?;
        let pulses = Pulses::from_data_pin(self.pin.as_ref(), self.delay.as_mut());
        let data = Reading::from_pulses(&pulses)?;
        Ok(data.into())
    }
}

impl Debug for DHT22Sensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DHT22Sensor").field("pin", &self.pin.pin()).finish()
    }
}
