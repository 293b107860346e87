// Dozer - Duty-cycled temperature and humidity reporter
//
// Copyright 2021-2022 Nick Pillitteri
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

use clap::{Parser, ValueEnum};
use dozer::config::{
    CycleConfig, RetryPolicy, DEFAULT_LINK_POLL_INTERVAL_MS, DEFAULT_MAX_MEASUREMENTS, DEFAULT_MEASUREMENT_INTERVAL_MS,
    DEFAULT_READ_ATTEMPTS, DEFAULT_RETRY_DELAY_MS, DEFAULT_SLEEP_DEADLINE_MS, DEFAULT_SLEEP_SECS,
};
use dozer::link::InterfaceLink;
use dozer::measure::Aggregator;
use dozer::network::{HttpCollector, DEFAULT_COLLECTOR_URL, DEFAULT_NETWORK_TIMEOUT_MS};
use dozer::orchestrator::Orchestrator;
use dozer::power::{DeepSleep, IdleSleep, RtcWakeSleep};
use dozer::scheduler::MonotonicClock;
use dozer::sensor::{open_pin, DHT22Sensor, SpinDelay};
use std::time::Duration;
use std::{io, process};
use tokio::runtime::Handle;
use tokio::signal::unix::{self, SignalKind};
use tokio::task;
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_INTERFACE: &str = "wlan0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SleepMode {
    /// Keep running, waiting for the next cycle
    Idle,
    /// Suspend the machine to RAM with `rtcwake` until the next cycle
    Rtcwake,
}

/// Report the average temperature and humidity from a DHT22 sensor, then sleep
///
/// Each cycle, read temperature and humidity from a DHT22 sensor connected to
/// a data pin of a local machine, usually a Raspberry PI, for as long as the
/// network link is coming up. Once the link is up, send the averaged readings to
/// a collector over HTTP and go to sleep until the next cycle. The node always
/// goes to sleep once the cycle deadline passes, even if nothing was sent.
///
/// The sensor must be connected to one of the General Purpose IO pins (GPIO). The
/// numbering of these pins (and how the pin number is provided to dozer) is based
/// on the Broadcom SOC channel.
#[derive(Debug, Parser)]
#[command(name = "dozer", version = clap::crate_version!())]
struct DozerApplication {
    /// BCM GPIO pin number the DHT22 sensor data line is connected to
    #[arg(long)]
    bcm_pin: u8,

    /// Network interface that must be up before readings are sent
    #[arg(long, default_value = DEFAULT_INTERFACE)]
    interface: String,

    /// URL readings are sent to as query parameters
    #[arg(long, default_value = DEFAULT_COLLECTOR_URL)]
    collector_url: String,

    /// API key sent to the collector along with readings
    #[arg(long, env = "DOZER_API_KEY")]
    api_key: String,

    /// Maximum number of measurements per cycle
    #[arg(long, default_value_t = DEFAULT_MAX_MEASUREMENTS)]
    max_measurements: u32,

    /// Delay between measurements, in milliseconds
    #[arg(long, default_value_t = DEFAULT_MEASUREMENT_INTERVAL_MS)]
    measure_interval_ms: u64,

    /// Check whether the network link is ready at this interval, in milliseconds
    #[arg(long, default_value_t = DEFAULT_LINK_POLL_INTERVAL_MS)]
    link_poll_ms: u64,

    /// Go to sleep this long after waking up no matter what, in milliseconds
    #[arg(long, default_value_t = DEFAULT_SLEEP_DEADLINE_MS)]
    sleep_deadline_ms: u64,

    /// Sleep for this long between cycles, in seconds
    #[arg(long, default_value_t = DEFAULT_SLEEP_SECS)]
    sleep_secs: u64,

    /// Attempts at reading the sensor per measurement
    #[arg(long, default_value_t = DEFAULT_READ_ATTEMPTS)]
    read_attempts: u32,

    /// Delay between attempts at reading the sensor, in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS)]
    retry_delay_ms: u64,

    /// Give up on the collector after this long, in milliseconds
    #[arg(long, default_value_t = DEFAULT_NETWORK_TIMEOUT_MS)]
    network_timeout_ms: u64,

    /// How to sleep between cycles
    #[arg(long, value_enum, default_value = "idle")]
    sleep_mode: SleepMode,

    /// Stop after this many cycles instead of running forever
    #[arg(long)]
    cycles: Option<u64>,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[arg(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,
}

impl DozerApplication {
    fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            max_measurements: self.max_measurements,
            measurement_interval: Duration::from_millis(self.measure_interval_ms),
            link_poll_interval: Duration::from_millis(self.link_poll_ms),
            sleep_deadline: Duration::from_millis(self.sleep_deadline_ms),
            sleep_duration: Duration::from_secs(self.sleep_secs),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.read_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    fn deep_sleep(&self) -> Box<dyn DeepSleep + Send> {
        match self.sleep_mode {
            SleepMode::Idle => Box::new(IdleSleep),
            SleepMode::Rtcwake => Box::new(RtcWakeSleep::new("mem")),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = DozerApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let pin = open_pin(opts.bcm_pin).unwrap_or_else(|e| {
        tracing::error!(message = "failed to initialize data pin", bcm_pin = opts.bcm_pin, error = %e);
        process::exit(1)
    });

    let collector = HttpCollector::new(
        &opts.collector_url,
        &opts.api_key,
        Duration::from_millis(opts.network_timeout_ms),
        Handle::current(),
    )
    .unwrap_or_else(|e| {
        tracing::error!(message = "failed to initialize collector", url = %opts.collector_url, error = %e);
        process::exit(1)
    });

    let aggregator = Aggregator::new(DHT22Sensor::from_pin(pin), SpinDelay, opts.retry_policy());
    let mut orchestrator = Orchestrator::new(
        opts.cycle_config(),
        aggregator,
        InterfaceLink::new(&opts.interface),
        collector,
        opts.deep_sleep(),
        MonotonicClock::new(),
    );

    tracing::info!(
        message = "starting",
        bcm_pin = opts.bcm_pin,
        interface = %opts.interface,
        collector = %opts.collector_url,
    );

    // Cycles block while reading the sensor and sleeping so they get their own
    // thread, leaving the runtime free to deliver payloads.
    let max_cycles = opts.cycles;
    let cycles = task::spawn_blocking(move || {
        let mut completed = 0;
        while max_cycles.map(|m| completed < m).unwrap_or(true) {
            let report = orchestrator.run_cycle();
            completed += 1;

            tracing::info!(
                message = "cycle complete",
                cycle = completed,
                reason = ?report.sleep_reason,
                measurements = report.state.measurements_done,
                successful = report.successful_measurements,
                payload = ?report.payload.map(|p| p.query()),
                awake_ms = report.slept_at.as_millis() as u64,
            );
        }
    });

    tokio::select! {
        res = cycles => {
            if let Err(e) = res {
                tracing::error!(message = "cycle loop failed", error = %e);
                process::exit(1);
            }
        }
        _ = sigterm() => {}
        _ = sigint() => {}
    }

    tracing::info!("shutdown");
    // A cycle might still be blocked on the sensor or sleeping, don't wait for it.
    process::exit(0)
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
