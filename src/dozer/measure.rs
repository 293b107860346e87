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

use crate::config::RetryPolicy;
use crate::sensor::{Decode, DecodeError, DecodedReading, Delay, Humidity, Hundredths, TemperatureCelsius};
use std::error::Error;
use std::fmt::{self, Formatter};

/// Running sums of every successful reading taken during a wake cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Accumulator {
    temperature_sum: i64,
    humidity_sum: i64,
    count: u32,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    fn add(&mut self, reading: &DecodedReading) {
        self.temperature_sum += i64::from(reading.temperature.hundredths().get());
        self.humidity_sum += i64::from(reading.humidity.hundredths().get());
        self.count += 1;
    }

    /// Average of every reading added so far, truncated to the hundredth, or `None`
    /// if nothing has been added.
    pub fn finalize(&self) -> Option<DecodedReading> {
        if self.count == 0 {
            return None;
        }

        // The average of i32 values always fits back into an i32.
        let count = i64::from(self.count);
        Some(DecodedReading::new(
            TemperatureCelsius::from(Hundredths::new((self.temperature_sum / count) as i32)),
            Humidity::from(Hundredths::new((self.humidity_sum / count) as i32)),
        ))
    }
}

/// Every attempt at reading the sensor for a measurement failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationFailure {
    pub attempts: u32,
    pub last: DecodeError,
}

impl fmt::Display for AggregationFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "no reading after {} attempts: {}", self.attempts, self.last)
    }
}

impl Error for AggregationFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.last)
    }
}

/// Takes measurements from a sensor, retrying failed reads, and adds the
/// successful ones to an `Accumulator`.
pub struct Aggregator<D> {
    decoder: D,
    delay: Box<dyn Delay + Send + Sync + 'static>,
    policy: RetryPolicy,
}

impl<D> Aggregator<D>
where
    D: Decode,
{
    pub fn new<T>(decoder: D, delay: T, policy: RetryPolicy) -> Self
    where
        T: Delay + Send + Sync + 'static,
    {
        Self {
            decoder,
            delay: Box::new(delay),
            policy,
        }
    }

    /// Read the sensor, up to the configured number of attempts, and add the first
    /// successful reading to `acc`. `acc` is left untouched if every attempt fails.
    pub fn measure_once(&mut self, acc: &mut Accumulator) -> Result<DecodedReading, AggregationFailure> {
        let attempts = self.policy.attempts.max(1);
        let mut last = DecodeError::NoResponse;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tracing::warn!(
                    message = "sensor read failed, retrying",
                    attempt = attempt,
                    max_attempts = attempts,
                    error = %last,
                    kind = last.as_label(),
                );
                self.pause();
            }

            match self.decoder.decode() {
                Ok(reading) => {
                    acc.add(&reading);
                    tracing::info!(
                        message = "sensor read done",
                        temperature = %reading.temperature,
                        humidity = %reading.humidity,
                        count = acc.count(),
                    );
                    return Ok(reading);
                }
                Err(e) => last = e,
            }
        }

        Err(AggregationFailure { attempts, last })
    }

    /// Wait out the retry delay, in as many `delay_us` calls as it takes.
    fn pause(&mut self) {
        let mut remaining = self.policy.delay.as_micros();
        while remaining > 0 {
            let chunk = u32::try_from(remaining).unwrap_or(u32::MAX);
            self.delay.delay_us(chunk);
            remaining -= u128::from(chunk);
        }
    }
}

impl<D> fmt::Debug for Aggregator<D>
where
    D: fmt::Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("decoder", &self.decoder)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{Accumulator, AggregationFailure, Aggregator};
    use crate::config::RetryPolicy;
    use crate::sensor::{Decode, DecodeError, DecodedReading, Delay, Humidity, Hundredths, TemperatureCelsius};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    pub(crate) fn reading(temperature: i32, humidity: i32) -> DecodedReading {
        DecodedReading::new(
            TemperatureCelsius::from(Hundredths::new(temperature)),
            Humidity::from(Hundredths::new(humidity)),
        )
    }

    /// Decoder that replays scripted results, then repeats `fallback` forever.
    #[derive(Debug)]
    pub(crate) struct ScriptedDecoder {
        script: VecDeque<Result<DecodedReading, DecodeError>>,
        fallback: Result<DecodedReading, DecodeError>,
        pub(crate) calls: Arc<AtomicU32>,
    }

    impl ScriptedDecoder {
        pub(crate) fn new(
            script: Vec<Result<DecodedReading, DecodeError>>,
            fallback: Result<DecodedReading, DecodeError>,
        ) -> Self {
            Self {
                script: script.into(),
                fallback,
                calls: Default::default(),
            }
        }

        pub(crate) fn always(result: Result<DecodedReading, DecodeError>) -> Self {
            Self::new(Vec::new(), result)
        }
    }

    impl Decode for ScriptedDecoder {
        fn decode(&mut self) -> Result<DecodedReading, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.pop_front().unwrap_or(self.fallback)
        }
    }

    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingDelay {
        pub(crate) calls: Arc<Mutex<Vec<u32>>>,
    }

    impl Delay for RecordingDelay {
        fn delay_us(&mut self, us: u32) {
            self.calls.lock().unwrap().push(us);
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_measure_once_first_try() {
        let decoder = ScriptedDecoder::always(Ok(reading(250, 500)));
        let calls = decoder.calls.clone();
        let delay = RecordingDelay::default();
        let delays = delay.calls.clone();
        let mut agg = Aggregator::new(decoder, delay, policy(5));
        let mut acc = Accumulator::new();

        assert_eq!(Ok(reading(250, 500)), agg.measure_once(&mut acc));
        assert_eq!(1, acc.count());
        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert!(delays.lock().unwrap().is_empty());
    }

    #[test]
    fn test_measure_once_retries_until_success() {
        let decoder = ScriptedDecoder::new(
            vec![Err(DecodeError::ChecksumMismatch(1, 2)), Err(DecodeError::Truncated(10))],
            Ok(reading(2195, 6529)),
        );
        let calls = decoder.calls.clone();
        let delay = RecordingDelay::default();
        let delays = delay.calls.clone();
        let mut agg = Aggregator::new(decoder, delay, policy(5));
        let mut acc = Accumulator::new();

        assert_eq!(Ok(reading(2195, 6529)), agg.measure_once(&mut acc));
        assert_eq!(3, calls.load(Ordering::SeqCst));
        assert_eq!(vec![2000, 2000], *delays.lock().unwrap());
        assert_eq!(Some(reading(2195, 6529)), acc.finalize());
    }

    #[test]
    fn test_measure_once_all_attempts_fail() {
        let decoder = ScriptedDecoder::always(Err(DecodeError::NoResponse));
        let calls = decoder.calls.clone();
        let mut agg = Aggregator::new(decoder, RecordingDelay::default(), policy(4));
        let mut acc = Accumulator::new();
        acc.add(&reading(100, 200));
        let before = acc.clone();

        let res = agg.measure_once(&mut acc);

        assert_eq!(
            Err(AggregationFailure {
                attempts: 4,
                last: DecodeError::NoResponse
            }),
            res
        );
        assert_eq!(4, calls.load(Ordering::SeqCst));
        assert_eq!(before, acc);
    }

    #[test]
    fn test_measure_once_long_retry_delay() {
        let decoder = ScriptedDecoder::new(vec![Err(DecodeError::NoResponse)], Ok(reading(250, 500)));
        let delay = RecordingDelay::default();
        let delays = delay.calls.clone();
        let policy = RetryPolicy {
            attempts: 2,
            delay: Duration::from_secs(5_000),
        };
        let mut agg = Aggregator::new(decoder, delay, policy);

        assert!(agg.measure_once(&mut Accumulator::new()).is_ok());

        let delays = delays.lock().unwrap();
        assert_eq!(vec![u32::MAX, 705_032_705], *delays);
        let total: u64 = delays.iter().map(|&us| u64::from(us)).sum();
        assert_eq!(5_000_000_000, total);
    }

    #[test]
    fn test_accumulator_finalize_empty() {
        assert_eq!(None, Accumulator::new().finalize());
    }

    #[test]
    fn test_accumulator_finalize_average() {
        let acc = Accumulator {
            temperature_sum: 750,
            humidity_sum: 1500,
            count: 3,
        };

        let avg = acc.finalize().unwrap();
        assert_eq!(reading(250, 500), avg);
        assert_eq!("2.50", avg.temperature.hundredths().to_string());
        assert_eq!("5.00", avg.humidity.hundredths().to_string());
    }

    #[test]
    fn test_accumulator_finalize_truncates() {
        let mut acc = Accumulator::new();
        acc.add(&reading(2100, 5000));
        acc.add(&reading(2101, 5001));
        acc.add(&reading(2101, 5001));

        assert_eq!(Some(reading(2100, 5000)), acc.finalize());
    }

    #[test]
    fn test_accumulator_sums_past_i32() {
        let mut acc = Accumulator::new();
        for _ in 0..250_000 {
            acc.add(&reading(10_000, 9_999));
        }

        assert_eq!(250_000, acc.count());
        assert!(acc.temperature_sum > i64::from(i32::MAX));
        assert_eq!(Some(reading(10_000, 9_999)), acc.finalize());
    }
}
