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

use std::process::Command;
use std::thread;
use std::time::Duration;

/// Puts the node into its low power state.
///
/// Once this returns the node is considered freshly woken: whatever happened
/// before the sleep is forgotten and a new cycle starts from scratch.
pub trait DeepSleep {
    fn enter_deep_sleep(&mut self, duration: Duration);
}

impl<T> DeepSleep for Box<T>
where
    T: DeepSleep + ?Sized,
{
    fn enter_deep_sleep(&mut self, duration: Duration) {
        self.as_mut().enter_deep_sleep(duration);
    }
}

/// Sleep by parking the current thread, for hosts without a real low power mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleSleep;

impl DeepSleep for IdleSleep {
    fn enter_deep_sleep(&mut self, duration: Duration) {
        tracing::info!(message = "idling until next cycle", secs = duration.as_secs());
        thread::sleep(duration);
    }
}

/// Suspend the whole machine with `rtcwake`, letting the RTC wake it up again.
#[derive(Debug, Clone)]
pub struct RtcWakeSleep {
    mode: String,
}

impl RtcWakeSleep {
    /// `mode` is passed to `rtcwake -m`, usually `mem` or `disk`.
    pub fn new(mode: &str) -> Self {
        Self { mode: mode.to_owned() }
    }

    fn command(&self, duration: Duration) -> Command {
        let mut cmd = Command::new("rtcwake");
        cmd.arg("-m")
            .arg(&self.mode)
            .arg("-s")
            .arg(duration.as_secs().max(1).to_string());
        cmd
    }
}

impl DeepSleep for RtcWakeSleep {
    fn enter_deep_sleep(&mut self, duration: Duration) {
        tracing::info!(message = "suspending until next cycle", mode = %self.mode, secs = duration.as_secs());

        match self.command(duration).status() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::error!(message = "rtcwake failed, idling instead", status = %status);
                IdleSleep.enter_deep_sleep(duration);
            }
            Err(e) => {
                tracing::error!(message = "unable to run rtcwake, idling instead", error = %e);
                IdleSleep.enter_deep_sleep(duration);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::RtcWakeSleep;
    use std::ffi::OsStr;
    use std::time::Duration;

    #[test]
    fn test_rtcwake_command() {
        let cmd = RtcWakeSleep::new("mem").command(Duration::from_secs(300));
        let args: Vec<&OsStr> = cmd.get_args().collect();

        assert_eq!(OsStr::new("rtcwake"), cmd.get_program());
        assert_eq!(vec!["-m", "mem", "-s", "300"], args);
    }

    #[test]
    fn test_rtcwake_command_minimum_one_second() {
        let cmd = RtcWakeSleep::new("disk").command(Duration::from_millis(10));
        let args: Vec<&OsStr> = cmd.get_args().collect();

        assert_eq!(vec!["-m", "disk", "-s", "1"], args);
    }
}
