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

#![cfg(test)]

use crate::sensor::core::{DataPin, Delay};
use crate::sensor::dht22::{DATA_BITS, DATA_SIZE};
use rppal::gpio::Mode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Sensor response low pulse, then high pulse, before data bits.
const RESPONSE_US: u64 = 80;
/// Low half of every data bit.
const BIT_LOW_US: u64 = 50;
/// High half of a 1 bit, in 1us polls.
const ONE_HIGH_US: u64 = 35;
/// High half of a 0 bit, in 1us polls.
const ZERO_HIGH_US: u64 = 10;
/// Time the pull-up holds the line high after release before the sensor answers.
const RELEASE_US: u64 = 20;

/// Microsecond counter shared between a test pin and the delays it is sampled with.
///
/// Time only moves when a delay is requested, so every poll of the decoder lasts
/// exactly one microsecond.
#[derive(Debug, Clone, Default)]
pub(crate) struct VirtualClock {
    now: Arc<AtomicU64>,
    long_delays: Arc<Mutex<Vec<u32>>>,
}

impl VirtualClock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub(crate) fn delay(&self) -> VirtualDelay {
        VirtualDelay { clock: self.clone() }
    }

    /// Every delay requested that was longer than a single poll.
    pub(crate) fn long_delays(&self) -> Vec<u32> {
        self.long_delays.lock().unwrap().clone()
    }
}

/// Delay implementation that advances a `VirtualClock` instead of waiting.
#[derive(Debug)]
pub(crate) struct VirtualDelay {
    clock: VirtualClock,
}

impl Delay for VirtualDelay {
    fn delay_us(&mut self, us: u32) {
        if us > 1 {
            self.clock.long_delays.lock().unwrap().push(us);
        }

        self.clock.now.fetch_add(us as u64, Ordering::SeqCst);
    }
}

/// Calls made to drive the data pin, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PinOp {
    Output,
    Input,
    High,
    Low,
    PullUp,
}

/// DataPin implementation whose level follows a scripted waveform.
///
/// The waveform starts when the pin is switched to input mode (the host releases
/// the line) and is a list of `(high, duration_us)` segments. Once every segment
/// has elapsed the line stays at `tail_high` forever.
#[derive(Debug)]
pub(crate) struct WaveformDataPin {
    clock: VirtualClock,
    released_at: Option<u64>,
    segments: Vec<(bool, u64)>,
    tail_high: bool,
    ops: Arc<Mutex<Vec<PinOp>>>,
}

impl WaveformDataPin {
    fn new(clock: &VirtualClock, segments: Vec<(bool, u64)>, tail_high: bool) -> Self {
        WaveformDataPin {
            clock: clock.clone(),
            released_at: None,
            segments,
            tail_high,
            ops: Default::default(),
        }
    }

    /// A sensor that answers with all 40 bits of `data`.
    pub(crate) fn frame(clock: &VirtualClock, data: [u8; DATA_SIZE]) -> Self {
        Self::partial_frame(clock, data, DATA_BITS)
    }

    /// A sensor that answers with only the first `bits` bits of `data` and then
    /// lets the line float high.
    pub(crate) fn partial_frame(clock: &VirtualClock, data: [u8; DATA_SIZE], bits: usize) -> Self {
        let mut segments = vec![(true, RELEASE_US), (false, RESPONSE_US), (true, RESPONSE_US)];

        for idx in 0..bits {
            let bit_offset = 8 - (idx % 8) - 1;
            let on = data[idx / 8] & (0x01 << bit_offset) > 0;

            segments.push((false, BIT_LOW_US));
            segments.push((true, if on { ONE_HIGH_US } else { ZERO_HIGH_US }));
        }

        segments.push((false, BIT_LOW_US));
        Self::new(clock, segments, true)
    }

    /// A sensor that acknowledges the start signal and then holds the line low.
    pub(crate) fn stuck_low(clock: &VirtualClock) -> Self {
        Self::new(clock, vec![(true, RELEASE_US)], false)
    }

    /// No sensor at all, the pull-up holds the line high.
    pub(crate) fn silent(clock: &VirtualClock) -> Self {
        Self::new(clock, Vec::new(), true)
    }

    /// Start the waveform now, as if the host just released the line.
    pub(crate) fn release(&mut self) {
        self.released_at = Some(self.clock.now_us());
    }

    pub(crate) fn ops(&self) -> Arc<Mutex<Vec<PinOp>>> {
        self.ops.clone()
    }

    fn record(&self, op: PinOp) {
        self.ops.lock().unwrap().push(op);
    }

    fn level(&self) -> bool {
        let start = match self.released_at {
            Some(t) => t,
            // Still driven by the host
            None => return true,
        };

        let mut elapsed = self.clock.now_us() - start;
        for &(high, duration) in self.segments.iter() {
            if elapsed < duration {
                return high;
            }

            elapsed -= duration;
        }

        self.tail_high
    }
}

impl DataPin for WaveformDataPin {
    fn is_low(&self) -> bool {
        !self.level()
    }

    fn is_high(&self) -> bool {
        self.level()
    }

    fn pin(&self) -> u8 {
        0
    }

    fn set_high(&mut self) {
        self.record(PinOp::High);
    }

    fn set_low(&mut self) {
        self.record(PinOp::Low);
    }

    fn set_mode(&mut self, mode: Mode) {
        if mode == Mode::Input {
            self.record(PinOp::Input);
            self.release();
        } else {
            self.record(PinOp::Output);
            self.released_at = None;
        }
    }

    fn enable_pull_up(&mut self) {
        self.record(PinOp::PullUp);
    }
}
