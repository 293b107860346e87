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

//! Sample a DHT22 sensor while the network comes up, report the averaged reading,
//! and go back to sleep.
//!
//! ## Features
//!
//! Dozer is meant for battery powered sensor nodes that spend most of their time
//! asleep. Each time the node wakes up it:
//!
//! * Reads temperature and humidity from a [DHT22 sensor](https://learn.adafruit.com/dht)
//!   every `300ms`, retrying failed reads a few times, for as long as the network
//!   isn't ready yet.
//! * Checks whether the network link is up every `500ms`.
//! * Once the link is up, sends the average of every successful reading to a
//!   collector as an HTTP `GET` request, for example `https://thingspeak.com`.
//! * Goes back to sleep once the collector answers or the request fails.
//!
//! No matter what happens (the sensor doesn't answer, the network never comes
//! up, the collector hangs) the node goes back to sleep `30s` after waking up.
//!
//! ## Build
//!
//! `dozer` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/)
//! . Since it's meant  to be run on a Raspberry PI, you will also likely need to cross-compile it.
//!
//! ```text
//! rustup target add armv7-unknown-linux-musleabihf
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Run
//!
//! The DHT22 data line must be connected to one of the General Purpose IO pins (GPIO),
//! numbered by the Broadcom SOC channel. In order to read and write the device
//! `/dev/gpiomem`, `dozer` must run as `root`.
//!
//! ```text
//! sudo dozer --bcm-pin 17 --interface wlan0 --api-key ABCDEF0123456789
//! ```
//!
//! By default `dozer` idles between cycles. Pass `--sleep-mode rtcwake` to suspend
//! the whole machine between cycles instead.
//!

pub mod config;
pub mod link;
pub mod measure;
pub mod network;
pub mod orchestrator;
pub mod power;
pub mod scheduler;
pub mod sensor;
