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

//! Drives a single wake cycle: measure repeatedly while the link comes up, send
//! the average once it does, then sleep.
//!
//! Three timers run the cycle:
//!
//! * The sleep timer, armed first and once, puts the node to sleep at the cycle
//!   deadline no matter what else is going on.
//! * The link poll timer checks whether the network is usable and, the first time
//!   it is, stops measuring and hands the averaged reading to the network.
//! * The measurement timer takes one measurement per firing and re-arms itself
//!   until the measurement cap is reached or measuring is stopped.
//!
//! Timers due at the same instant run in that order.

use crate::config::CycleConfig;
use crate::link::LinkStatus;
use crate::measure::{Accumulator, Aggregator};
use crate::network::{event_channel, NetworkEvent, NetworkEvents, NetworkNotifier, NetworkSend, Payload};
use crate::power::DeepSleep;
use crate::scheduler::{Clock, Schedule, Scheduler, TimerHandle};
use crate::sensor::Decode;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::time::Duration;

const SLEEP_PRIORITY: u8 = 0;
const LINK_POLL_PRIORITY: u8 = 1;
const MEASURE_PRIORITY: u8 = 2;

/// Longest time to wait for a timer before checking for network events again.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleState {
    Initializing,
    Measuring,
    AwaitingLink,
    Finalizing,
    Sleeping,
}

/// Why a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SleepReason {
    /// The collector answered and the connection was closed.
    NetworkComplete,
    /// The payload could not be delivered.
    NetworkFailed,
    /// The link came up but there was nothing to send.
    NoData,
    /// The link never came up before the deadline.
    LinkTimeout,
    /// The deadline passed while the payload was still in flight.
    Deadline,
}

/// The link never became ready before the sleep deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeout {
    pub waited: Duration,
}

impl fmt::Display for LinkTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "link not ready after {}ms", self.waited.as_millis())
    }
}

impl Error for LinkTimeout {}

/// Control flow flags of a cycle.
///
/// Once `measuring_enabled` is cleared `measurements_done` never changes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorState {
    pub measurements_done: u32,
    pub max_measurements: u32,
    pub measuring_enabled: bool,
    pub link_ready: bool,
}

/// What happened during a cycle, available once the node is asleep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Every state the cycle went through, in order.
    pub transitions: Vec<CycleState>,
    /// Control flow flags as they were when the node went to sleep.
    pub state: OrchestratorState,
    pub successful_measurements: u32,
    /// Averaged values handed to the network, if any.
    pub payload: Option<Payload>,
    pub sleep_reason: SleepReason,
    /// Time from waking up to going back to sleep.
    pub slept_at: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Task {
    Sleep,
    LinkPoll,
    Measure,
}

#[derive(Debug, Clone, Copy)]
struct Timers {
    sleep: TimerHandle,
    link_poll: TimerHandle,
    measure: TimerHandle,
}

/// Everything mutable about a single wake cycle. Created when the node wakes up,
/// dropped when it goes to sleep.
#[derive(Debug)]
pub(crate) struct OrchestratorContext {
    phase: CycleState,
    state: OrchestratorState,
    accumulator: Accumulator,
    scheduler: Scheduler<Task>,
    timers: Timers,
    notifier: NetworkNotifier,
    events: NetworkEvents,
    started_at: Duration,
    pending_sleep: Option<SleepReason>,
    transitions: Vec<CycleState>,
    payload: Option<Payload>,
    slept: Option<(SleepReason, Duration)>,
}

impl OrchestratorContext {
    fn new(config: &CycleConfig, started_at: Duration) -> Self {
        let mut scheduler = Scheduler::new();
        let timers = Timers {
            sleep: scheduler.register(Task::Sleep, SLEEP_PRIORITY),
            link_poll: scheduler.register(Task::LinkPoll, LINK_POLL_PRIORITY),
            measure: scheduler.register(Task::Measure, MEASURE_PRIORITY),
        };
        let (notifier, events) = event_channel();

        Self {
            phase: CycleState::Initializing,
            state: OrchestratorState {
                measurements_done: 0,
                max_measurements: config.max_measurements,
                measuring_enabled: true,
                link_ready: false,
            },
            accumulator: Accumulator::new(),
            scheduler,
            timers,
            notifier,
            events,
            started_at,
            pending_sleep: None,
            transitions: vec![CycleState::Initializing],
            payload: None,
            slept: None,
        }
    }

    fn transition(&mut self, to: CycleState) {
        if self.phase == to {
            return;
        }

        tracing::info!(message = "cycle state change", from = ?self.phase, to = ?to);
        self.phase = to;
        self.transitions.push(to);
    }

    fn arm(&mut self, timer: TimerHandle, now: Duration, schedule: Schedule) {
        if let Err(e) = self.scheduler.arm(timer, now, schedule) {
            tracing::error!(message = "unable to arm timer", error = %e);
        }
    }

    fn into_report(self) -> CycleReport {
        let (sleep_reason, slept_at) = self.slept.unwrap_or((SleepReason::Deadline, Duration::ZERO));

        CycleReport {
            transitions: self.transitions,
            state: self.state,
            successful_measurements: self.accumulator.count(),
            payload: self.payload,
            sleep_reason,
            slept_at,
        }
    }
}

/// Runs wake cycles against a sensor, a link, a network, and a way to sleep.
pub struct Orchestrator<D, L, N, P, C> {
    config: CycleConfig,
    aggregator: Aggregator<D>,
    link: L,
    network: N,
    power: P,
    clock: C,
}

impl<D, L, N, P, C> Orchestrator<D, L, N, P, C>
where
    D: Decode,
    L: LinkStatus,
    N: NetworkSend,
    P: DeepSleep,
    C: Clock,
{
    pub fn new(config: CycleConfig, aggregator: Aggregator<D>, link: L, network: N, power: P, clock: C) -> Self {
        Self {
            config,
            aggregator,
            link,
            network,
            power,
            clock,
        }
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn power(&self) -> &P {
        &self.power
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Run one complete wake cycle, from waking up to going back to sleep.
    ///
    /// Every cycle starts from a fresh context, nothing carries over from the
    /// previous one.
    pub fn run_cycle(&mut self) -> CycleReport {
        let mut ctx = self.initialize();

        while ctx.phase != CycleState::Sleeping {
            self.drain_events(&mut ctx);
            if ctx.phase == CycleState::Sleeping {
                break;
            }

            let now = self.clock.now();
            match ctx.scheduler.pop_due(now) {
                Some((_, task)) => self.dispatch(&mut ctx, task),
                None => match ctx.scheduler.next_deadline() {
                    Some(deadline) => self.clock.sleep_until(deadline.min(now + EVENT_POLL_INTERVAL)),
                    None => self.enter_sleep(&mut ctx, SleepReason::Deadline),
                },
            }
        }

        ctx.into_report()
    }

    fn initialize(&mut self) -> OrchestratorContext {
        let now = self.clock.now();
        let mut ctx = OrchestratorContext::new(&self.config, now);

        tracing::info!(
            message = "waking up",
            version = env!("CARGO_PKG_VERSION"),
            max_measurements = self.config.max_measurements,
            measurement_interval_ms = self.config.measurement_interval.as_millis() as u64,
            link_poll_interval_ms = self.config.link_poll_interval.as_millis() as u64,
            sleep_deadline_ms = self.config.sleep_deadline.as_millis() as u64,
        );

        // The sleep timer is armed first and only disarmed when going to sleep.
        let timers = ctx.timers;
        ctx.arm(timers.sleep, now, Schedule::Once(self.config.sleep_deadline));
        ctx.arm(timers.link_poll, now, Schedule::Every(self.config.link_poll_interval));

        if ctx.state.max_measurements > 0 {
            ctx.arm(timers.measure, now, Schedule::Once(self.config.measurement_interval));
            ctx.transition(CycleState::Measuring);
        } else {
            ctx.transition(CycleState::AwaitingLink);
        }

        ctx
    }

    fn dispatch(&mut self, ctx: &mut OrchestratorContext, task: Task) {
        match task {
            Task::Sleep => self.on_sleep_timer(ctx),
            Task::LinkPoll => self.on_link_poll(ctx),
            Task::Measure => self.on_measure(ctx),
        }
    }

    fn on_measure(&mut self, ctx: &mut OrchestratorContext) {
        if !ctx.state.measuring_enabled || ctx.state.measurements_done >= ctx.state.max_measurements {
            tracing::debug!(message = "measuring stopped, not rescheduling measurement");
            return;
        }

        if let Err(e) = self.aggregator.measure_once(&mut ctx.accumulator) {
            tracing::warn!(message = "nothing measured", error = %e, kind = e.last.as_label());
        }

        ctx.state.measurements_done += 1;

        if ctx.state.measurements_done < ctx.state.max_measurements {
            // Measuring blocks, the next one is scheduled relative to when this one ended.
            let now = self.clock.now();
            let timer = ctx.timers.measure;
            ctx.arm(timer, now, Schedule::Once(self.config.measurement_interval));
        } else {
            tracing::info!(
                message = "measurement cap reached",
                measurements = ctx.state.measurements_done,
                successful = ctx.accumulator.count(),
            );

            if ctx.phase == CycleState::Measuring {
                ctx.transition(CycleState::AwaitingLink);
            }
        }
    }

    fn on_link_poll(&mut self, ctx: &mut OrchestratorContext) {
        if !self.link.is_link_ready() {
            tracing::debug!(message = "link not ready yet");
            return;
        }

        ctx.scheduler.disarm(ctx.timers.link_poll);
        ctx.scheduler.disarm(ctx.timers.measure);
        ctx.state.link_ready = true;
        ctx.state.measuring_enabled = false;

        tracing::info!(
            message = "link ready, sending measurements",
            measurements = ctx.state.measurements_done,
            successful = ctx.accumulator.count(),
        );

        self.finalize(ctx);
    }

    fn finalize(&mut self, ctx: &mut OrchestratorContext) {
        ctx.transition(CycleState::Finalizing);

        match ctx.accumulator.finalize() {
            Some(average) => {
                let payload = Payload::new(average);
                tracing::info!(
                    message = "final averages",
                    temperature = %average.temperature,
                    humidity = %average.humidity,
                    count = ctx.accumulator.count(),
                );

                ctx.payload = Some(payload);
                self.network.send(payload, ctx.notifier.clone());
            }
            None => {
                tracing::info!(message = "no successful measurements, nothing to send");
                self.enter_sleep(ctx, SleepReason::NoData);
            }
        }
    }

    fn drain_events(&mut self, ctx: &mut OrchestratorContext) {
        while let Some(event) = ctx.events.try_next() {
            match event {
                NetworkEvent::Response { status } => {
                    tracing::info!(message = "collector responded", status = status);
                }
                NetworkEvent::Disconnected => {
                    tracing::info!(message = "collector disconnected");
                    self.request_sleep(ctx, SleepReason::NetworkComplete);
                }
                NetworkEvent::Failed(e) => {
                    tracing::warn!(message = "unable to send measurements", error = %e, kind = e.kind().as_label());
                    self.request_sleep(ctx, SleepReason::NetworkFailed);
                }
            }
        }
    }

    /// Make the sleep timer fire right away instead of at the deadline.
    fn request_sleep(&mut self, ctx: &mut OrchestratorContext, reason: SleepReason) {
        if ctx.pending_sleep.is_some() {
            return;
        }

        let now = self.clock.now();
        let timer = ctx.timers.sleep;
        ctx.pending_sleep = Some(reason);
        ctx.scheduler.disarm(timer);
        ctx.arm(timer, now, Schedule::Once(Duration::ZERO));
    }

    fn on_sleep_timer(&mut self, ctx: &mut OrchestratorContext) {
        let reason = match ctx.pending_sleep.take() {
            Some(reason) => reason,
            None if !ctx.state.link_ready => {
                let err = LinkTimeout {
                    waited: self.clock.now().saturating_sub(ctx.started_at),
                };
                tracing::warn!(message = "giving up on network", error = %err);
                SleepReason::LinkTimeout
            }
            None => SleepReason::Deadline,
        };

        self.enter_sleep(ctx, reason);
    }

    fn enter_sleep(&mut self, ctx: &mut OrchestratorContext, reason: SleepReason) {
        let slept_at = self.clock.now().saturating_sub(ctx.started_at);
        ctx.scheduler.disarm_all();
        ctx.transition(CycleState::Sleeping);
        ctx.slept = Some((reason, slept_at));

        tracing::info!(
            message = "going to deep sleep",
            reason = ?reason,
            awake_ms = slept_at.as_millis() as u64,
            sleep_secs = self.config.sleep_duration.as_secs(),
        );

        self.power.enter_deep_sleep(self.config.sleep_duration);
    }
}
