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

//! Single threaded, cooperative timers.
//!
//! Timers are registered once with a task value and a priority and then armed
//! and disarmed through the returned `TimerHandle`. Nothing runs on its own: the
//! owner asks for the next due task with `Scheduler::pop_due` and runs it, so no
//! two tasks ever run at the same time. When several timers are due at the same
//! instant the one with the lowest priority value goes first.

use std::error::Error;
use std::fmt::{self, Formatter};
use std::thread;
use std::time::{Duration, Instant};

/// Source of the current time for a `Scheduler`, as an offset from an arbitrary start.
pub trait Clock {
    fn now(&self) -> Duration;

    /// Block until `deadline`. Returns immediately if it has already passed.
    fn sleep_until(&mut self, deadline: Duration);
}

/// `Clock` backed by `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep_until(&mut self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
    }
}

/// `Clock` that only moves when told to, for simulating a cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualClock {
    now: Duration,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now
    }

    fn sleep_until(&mut self, deadline: Duration) {
        if deadline > self.now {
            self.now = deadline;
        }
    }
}

/// Identifies a timer registered with a `Scheduler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(usize);

/// When an armed timer should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fire once, after the delay. The timer is disarmed when it fires.
    Once(Duration),
    /// Fire after every period until disarmed.
    Every(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    AlreadyArmed(TimerHandle),
    UnknownTimer(TimerHandle),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::AlreadyArmed(h) => write!(f, "timer {} is already armed", h.0),
            SchedulerError::UnknownTimer(h) => write!(f, "timer {} is not registered", h.0),
        }
    }
}

impl Error for SchedulerError {}

#[derive(Debug, Clone, Copy)]
struct Armed {
    deadline: Duration,
    period: Option<Duration>,
}

#[derive(Debug)]
struct Slot<T> {
    task: T,
    priority: u8,
    armed: Option<Armed>,
}

#[derive(Debug)]
pub struct Scheduler<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> Scheduler<T>
where
    T: Copy,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, disarmed, timer that yields `task` each time it fires.
    pub fn register(&mut self, task: T, priority: u8) -> TimerHandle {
        self.slots.push(Slot {
            task,
            priority,
            armed: None,
        });

        TimerHandle(self.slots.len() - 1)
    }

    /// Arm a timer relative to `now`. Arming a timer that is already armed is an
    /// error, it must be disarmed first.
    pub fn arm(&mut self, handle: TimerHandle, now: Duration, schedule: Schedule) -> Result<(), SchedulerError> {
        let slot = self
            .slots
            .get_mut(handle.0)
            .ok_or(SchedulerError::UnknownTimer(handle))?;

        if slot.armed.is_some() {
            return Err(SchedulerError::AlreadyArmed(handle));
        }

        slot.armed = Some(match schedule {
            Schedule::Once(delay) => Armed {
                deadline: now + delay,
                period: None,
            },
            Schedule::Every(period) => Armed {
                deadline: now + period,
                period: Some(period),
            },
        });

        Ok(())
    }

    /// Disarm a timer so it doesn't fire again, returning true if it was armed.
    pub fn disarm(&mut self, handle: TimerHandle) -> bool {
        self.slots
            .get_mut(handle.0)
            .and_then(|slot| slot.armed.take())
            .is_some()
    }

    pub fn disarm_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.armed = None;
        }
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.slots.get(handle.0).map(|s| s.armed.is_some()).unwrap_or(false)
    }

    /// Earliest deadline of any armed timer.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.slots.iter().filter_map(|s| s.armed).map(|a| a.deadline).min()
    }

    /// Remove and return the task of the timer that should run next if its
    /// deadline is at or before `now`.
    ///
    /// One-shot timers are disarmed. Periodic timers are moved to their next
    /// deadline, skipping any periods that were missed entirely.
    pub fn pop_due(&mut self, now: Duration) -> Option<(TimerHandle, T)> {
        let (idx, _) = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.armed.map(|a| (i, (a.deadline, s.priority, i))))
            .filter(|(_, (deadline, _, _))| *deadline <= now)
            .min_by_key(|(_, key)| *key)?;

        let slot = &mut self.slots[idx];
        slot.armed = slot.armed.and_then(|a| {
            a.period.map(|period| {
                let mut deadline = a.deadline + period;
                if deadline <= now {
                    deadline = now + period;
                }

                Armed {
                    deadline,
                    period: Some(period),
                }
            })
        });

        Some((TimerHandle(idx), slot.task))
    }
}

#[cfg(test)]
mod test {
    use super::{Clock, ManualClock, Schedule, Scheduler, SchedulerError};
    use std::time::Duration;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_manual_clock_only_moves_forward() {
        let mut clock = ManualClock::new();
        clock.sleep_until(ms(100));
        clock.sleep_until(ms(50));
        clock.advance(ms(5));

        assert_eq!(ms(105), clock.now());
    }

    #[test]
    fn test_arm_twice_rejected() {
        let mut sched = Scheduler::new();
        let h = sched.register('a', 0);

        sched.arm(h, ms(0), Schedule::Once(ms(10))).unwrap();
        assert_eq!(Err(SchedulerError::AlreadyArmed(h)), sched.arm(h, ms(0), Schedule::Once(ms(5))));

        assert!(sched.disarm(h));
        assert!(!sched.disarm(h));
        assert!(sched.arm(h, ms(0), Schedule::Once(ms(5))).is_ok());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut sched = Scheduler::new();
        let h = sched.register('a', 0);
        sched.arm(h, ms(0), Schedule::Once(ms(10))).unwrap();

        assert_eq!(None, sched.pop_due(ms(9)));
        assert_eq!(Some((h, 'a')), sched.pop_due(ms(10)));
        assert_eq!(None, sched.pop_due(ms(100)));
        assert!(!sched.is_armed(h));
        assert_eq!(None, sched.next_deadline());
    }

    #[test]
    fn test_periodic_rearms() {
        let mut sched = Scheduler::new();
        let h = sched.register('p', 0);
        sched.arm(h, ms(0), Schedule::Every(ms(500))).unwrap();

        assert_eq!(Some((h, 'p')), sched.pop_due(ms(500)));
        assert_eq!(Some(ms(1000)), sched.next_deadline());

        // Missed several periods, only fire once and schedule from now
        assert_eq!(Some((h, 'p')), sched.pop_due(ms(2700)));
        assert_eq!(None, sched.pop_due(ms(2700)));
        assert_eq!(Some(ms(3200)), sched.next_deadline());
    }

    #[test]
    fn test_earliest_deadline_first() {
        let mut sched = Scheduler::new();
        let late = sched.register("late", 0);
        let early = sched.register("early", 9);
        sched.arm(late, ms(0), Schedule::Once(ms(20))).unwrap();
        sched.arm(early, ms(0), Schedule::Once(ms(10))).unwrap();

        assert_eq!(Some((early, "early")), sched.pop_due(ms(30)));
        assert_eq!(Some((late, "late")), sched.pop_due(ms(30)));
    }

    #[test]
    fn test_priority_breaks_ties() {
        let mut sched = Scheduler::new();
        let low = sched.register("measure", 2);
        let high = sched.register("sleep", 0);
        let mid = sched.register("link", 1);
        for h in [low, high, mid] {
            sched.arm(h, ms(0), Schedule::Once(ms(10))).unwrap();
        }

        assert_eq!(Some((high, "sleep")), sched.pop_due(ms(10)));
        assert_eq!(Some((mid, "link")), sched.pop_due(ms(10)));
        assert_eq!(Some((low, "measure")), sched.pop_due(ms(10)));
    }

    #[test]
    fn test_disarm_all() {
        let mut sched = Scheduler::new();
        let a = sched.register(1, 0);
        let b = sched.register(2, 0);
        sched.arm(a, ms(0), Schedule::Every(ms(1))).unwrap();
        sched.arm(b, ms(0), Schedule::Once(ms(1))).unwrap();

        sched.disarm_all();

        assert_eq!(None, sched.next_deadline());
        assert_eq!(None, sched.pop_due(ms(10)));
    }
}
