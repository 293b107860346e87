// Dozer - Duty-cycled temperature and humidity reporter
//
// Copyright 2022 Nick Pillitteri
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

use std::time::Duration;

pub const DEFAULT_MAX_MEASUREMENTS: u32 = 100;
pub const DEFAULT_MEASUREMENT_INTERVAL_MS: u64 = 300;
pub const DEFAULT_LINK_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_SLEEP_DEADLINE_MS: u64 = 30_000;
pub const DEFAULT_SLEEP_SECS: u64 = 300;
pub const DEFAULT_READ_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Timing of a single wake cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleConfig {
    /// Measurement timer firings allowed per cycle.
    pub max_measurements: u32,
    /// Delay between the end of one measurement and the start of the next.
    pub measurement_interval: Duration,
    /// Period of the link readiness check.
    pub link_poll_interval: Duration,
    /// Time after waking at which the node goes back to sleep no matter what.
    pub sleep_deadline: Duration,
    /// How long to sleep for once the cycle is over.
    pub sleep_duration: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_measurements: DEFAULT_MAX_MEASUREMENTS,
            measurement_interval: Duration::from_millis(DEFAULT_MEASUREMENT_INTERVAL_MS),
            link_poll_interval: Duration::from_millis(DEFAULT_LINK_POLL_INTERVAL_MS),
            sleep_deadline: Duration::from_millis(DEFAULT_SLEEP_DEADLINE_MS),
            sleep_duration: Duration::from_secs(DEFAULT_SLEEP_SECS),
        }
    }
}

/// How many times to try reading the sensor per measurement and how long to
/// wait between tries. The DHT22 needs a rest between reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_READ_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}
