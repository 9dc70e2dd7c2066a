// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness monitoring and subsystem restart.
//!
//! A restart is triggered either explicitly (a fault interrupt from the
//! device, an operator request, a rejected service table) or by the
//! liveness timer running out. Only one restart runs at a time; triggers
//! arriving while one is in progress are dropped.
//!
//! A restart captures a crash record, tears the service table down, puts
//! the device into reset and boots the cached firmware again. Explicit
//! restarts that follow each other closely are slowed down by a growing
//! backoff.

use crate::boot::BootError;
use crate::config::RestartConfig;
use crate::crash::{Counters, CrashRecord, DumpHeader};
use crate::lifecycle::{LifecycleError, LifecycleState};
use crate::platform::SinkError;
use crate::service;
use crate::util::{lock, poll_until};
use crate::Aoc;
use log::{debug, error, info, warn};
use retry::{delay::Fixed, retry, OperationResult};
use std::fmt;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum RestartError {
    #[error("could not reset the co-processor: {0}")]
    Reset(BootError),

    #[error("could not boot after reset: {0}")]
    Boot(BootError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// What the liveness timer is waiting for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TimerPurpose {
    /// The device has to report that it booted.
    Boot,
    /// The device has to answer a health check.
    HealthCheck,
}

/// Why a restart was requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    Explicit(String),
    LivenessTimeout(TimerPurpose),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Explicit(reason) => f.write_str(reason),
            Trigger::LivenessTimeout(purpose) => write!(f, "{purpose} liveness timeout"),
        }
    }
}

/// Backoff for explicit restarts that come in quick succession.
///
/// Each explicit restart within `window` of the previous one adds a step of
/// delay, up to `max_steps`; one outside the window starts over.
#[derive(Debug)]
pub struct Hysteresis {
    window: Duration,
    step: Duration,
    max_steps: u32,
    steps: u32,
    last: Option<Instant>,
}

impl Hysteresis {
    pub fn new(config: &RestartConfig) -> Hysteresis {
        Hysteresis {
            window: config.hysteresis_window(),
            step: config.backoff_step(),
            max_steps: config.backoff_max_steps,
            steps: 0,
            last: None,
        }
    }

    /// Record an explicit restart at `now` and return how long to wait first.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        let within = self
            .last
            .map_or(false, |last| now.saturating_duration_since(last) < self.window);
        self.last = Some(now);
        if within {
            self.steps = (self.steps + 1).min(self.max_steps);
        } else {
            self.steps = 0;
        }
        self.step.saturating_mul(self.steps)
    }
}

/// Deadlines the supervisor sleeps towards.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    liveness: Option<(Instant, TimerPurpose)>,
    health_due: Option<Instant>,
}

impl Timers {
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.liveness.map(|(at, _)| at), self.health_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Aoc {
    pub(crate) fn arm_timer(&self, purpose: TimerPurpose, at: Instant) {
        debug!("{purpose} timer armed");
        lock(&self.timers).liveness = Some((at, purpose));
        self.kick();
    }

    /// Disarm the liveness timer if it is waiting for `purpose`.
    pub(crate) fn disarm_timer(&self, purpose: TimerPurpose) -> bool {
        let mut timers = lock(&self.timers);
        match timers.liveness {
            Some((_, p)) if p == purpose => {
                timers.liveness = None;
                debug!("{purpose} timer disarmed");
                true
            }
            _ => false,
        }
    }

    pub(crate) fn disarm_timers(&self) {
        *lock(&self.timers) = Timers::default();
    }

    pub(crate) fn schedule_health_check(&self, from: Instant) {
        if let Some(interval) = self.config.restart.health_check_interval() {
            lock(&self.timers).health_due = from.checked_add(interval);
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        lock(&self.timers).next_deadline()
    }

    /// Fire whatever has expired by `now`.
    pub(crate) fn check_timers(&self, now: Instant) {
        let (expired, health) = {
            let mut timers = lock(&self.timers);
            let expired = match timers.liveness {
                Some((at, purpose)) if at <= now => {
                    timers.liveness = None;
                    Some(purpose)
                }
                _ => None,
            };
            let health = match timers.health_due {
                Some(at) if at <= now && expired.is_none() => {
                    timers.health_due = None;
                    true
                }
                _ => false,
            };
            (expired, health)
        };

        if let Some(purpose) = expired {
            warn!("AoC {purpose} liveness timer expired");
            if let Err(e) = self.restart(Trigger::LivenessTimeout(purpose)) {
                error!("{e}");
            }
        } else if health && self.state() == LifecycleState::Online {
            debug!("health check");
            self.platform.ping();
            match now.checked_add(self.config.restart.liveness_timeout()) {
                Some(deadline) => self.arm_timer(TimerPurpose::HealthCheck, deadline),
                None => warn!("liveness timeout out of range; not waiting for an answer"),
            }
            self.schedule_health_check(now);
        }
    }

    /// Run a subsystem restart.
    ///
    /// Returns once the device has been reset and the cached firmware booted
    /// again (or there was none). Triggers that arrive while a restart is
    /// already under way are ignored.
    pub(crate) fn restart(&self, trigger: Trigger) -> Result<(), RestartError> {
        if self.state() == LifecycleState::Restarting {
            info!("restart already in progress; ignoring {trigger}");
            return Ok(());
        }

        if let Trigger::Explicit(reason) = &trigger {
            let delay = lock(&self.hysteresis).next_delay(Instant::now());
            if !delay.is_zero() {
                warn!("restart ({reason}) within hysteresis window; waiting {delay:?}");
                thread::sleep(delay);
            }
        }

        let previous = {
            let mut table = lock(&self.table);
            if table.state == LifecycleState::Restarting {
                return Ok(());
            }
            if table.booting {
                info!("boot in progress; ignoring {trigger}");
                return Ok(());
            }
            table.transition(LifecycleState::Restarting, &self.state)?
        };
        self.mask_faults();
        self.disarm_timers();
        let count = Counters::bump(&self.counters.restarts);
        info!("restarting AoC (restart #{count}): {trigger}");

        if previous != LifecycleState::Offline {
            self.capture_crash(&trigger);
        }
        self.quiesce();

        if let Err(e) = self.reset_device() {
            error!("AoC reset failed; leaving it offline: {e}");
            self.finish_restart();
            self.platform.release_power();
            Counters::bump(&self.counters.failed_restarts);
            return Err(RestartError::Reset(e));
        }
        self.platform.release_power();
        self.finish_restart();

        match self.reboot_cached() {
            Ok(_) => Ok(()),
            Err(e) => {
                Counters::bump(&self.counters.failed_restarts);
                Err(RestartError::Boot(e))
            }
        }
    }

    /// Mask fault interrupts and close the current fault epoch, so faults
    /// still queued from before this point are dropped.
    pub(crate) fn mask_faults(&self) {
        self.platform.set_fault_interrupts(false);
        let epoch = self.state.next_fault_epoch();
        debug!("fault interrupts masked; fault epoch {epoch}");
    }

    fn finish_restart(&self) {
        let mut table = lock(&self.table);
        table.ipc_base = None;
        if let Err(e) = table.transition(LifecycleState::Offline, &self.state) {
            error!("{e}");
        }
    }

    /// Ask the device for a dump and hand the resulting record to the sink.
    fn capture_crash(&self, trigger: &Trigger) {
        let offset = self.config.memory.dump_header_offset as usize;
        let restart = &self.config.restart;

        if let Err(e) = DumpHeader::invalidate(&self.memory, offset) {
            warn!("could not clear diagnostic header: {e}");
        }
        self.platform.request_dump();

        let mut header = DumpHeader::default();
        let complete = poll_until(restart.dump_timeout(), self.config.boot.poll_interval(), || {
            match DumpHeader::read(&self.memory, offset) {
                Ok(h) => {
                    header = h;
                    header.is_valid()
                }
                Err(_) => false,
            }
        });
        if !complete {
            warn!("AoC did not complete its diagnostic header");
        }

        let record = CrashRecord::capture(&self.memory, &header, &trigger.to_string());
        info!("{}", record.reason);

        let delays = Fixed::from_millis(restart.sink_retry_delay_ms).take(restart.sink_retries as usize);
        let result = retry(delays, || match self.sink.submit(&record) {
            Ok(()) => OperationResult::Ok(()),
            Err(SinkError::NotReady) => {
                debug!("diagnostic sink not ready");
                OperationResult::Retry(SinkError::NotReady)
            }
            Err(e) => OperationResult::Err(e),
        });

        match result {
            Ok(()) => {
                Counters::bump(&self.counters.coredumps);
            }
            Err(retry::Error::Operation { error, tries, .. }) => {
                warn!("crash record dropped after {tries} tries: {error}");
            }
            Err(retry::Error::Internal(msg)) => warn!("crash record dropped: {msg}"),
        }
    }

    /// Tear down the service table once every in-flight operation is out,
    /// and clear the published control block so the next boot starts from
    /// an unpublished table.
    fn quiesce(&self) {
        let services = {
            let table = lock(&self.table);
            for service in &table.services {
                service.kill();
            }
            table.services.clone()
        };

        let mut waited = Duration::ZERO;
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            thread::sleep(Duration::from_millis(1));
            waited += Duration::from_millis(1);
            if waited.as_millis() % 1000 == 0 {
                warn!(
                    "still waiting for {} transport operations to finish",
                    self.in_flight.load(Ordering::SeqCst)
                );
            }
        }

        {
            let mut table = lock(&self.table);
            table.services.clear();
            if let Some(base) = table.ipc_base {
                if let Err(e) = service::retract(self.memory.dram(), base) {
                    warn!("could not retract the service table: {e}");
                }
            }
        }
        for service in &services {
            if let Some(driver) = service.driver() {
                driver.remove(service.descriptor());
            }
        }
        debug!("{} services torn down", services.len());
    }
}
