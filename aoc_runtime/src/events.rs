// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt events and the supervisor that consumes them.
//!
//! Interrupt handlers must not block, so they only enqueue an [`Event`] on
//! a bounded channel. A single supervisor thread drains the channel and
//! does all the work that changes the service table or lifecycle state:
//! bringing services online after boot, waking blocked callers on a
//! doorbell, handling faults, firing the liveness timer and running
//! restarts. Having exactly one consumer is what serializes restarts.
//!
//! Doorbells are not lost to a full queue: each one also sets a bit in a
//! pending mask that the supervisor swaps out after every event it handles.
//! Faults carry the fault epoch they were raised in, and a fault from an
//! epoch that a restart has since closed is dropped.

use crate::lifecycle::{LifecycleState, StateMirror};
use crate::service::{self, Direction};
use crate::transport::Service;
use crate::util::lock;
use crate::watchdog::{TimerPurpose, Trigger};
use crate::Aoc;
use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Progress the device reports through its liveness signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Milestone {
    /// Firmware is up and about to publish its service table.
    Booted,
    /// Answer to a health check.
    Heartbeat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Liveness(Milestone),
    /// The device rang the host doorbell; which services is in the
    /// pending mask.
    Doorbell,
    Fault { reason: String, epoch: u64 },
    /// Operator-requested restart.
    Reset(String),
    /// Load this firmware, restarting if something is running.
    Load(String),
    /// Timers changed; recompute the next deadline.
    Kick,
    Shutdown,
}

/// Doorbells rung since the supervisor last looked. Bit `i` stands for
/// service `i`; the top bit also stands for every service past it.
#[derive(Debug, Default)]
pub(crate) struct Doorbells(AtomicU64);

const OVERFLOW_BIT: usize = 63;

impl Doorbells {
    fn ring(&self, service: Option<usize>) {
        let bits = match service {
            Some(index) => 1 << index.min(OVERFLOW_BIT),
            None => u64::MAX,
        };
        self.0.fetch_or(bits, Ordering::SeqCst);
    }

    fn take(&self) -> u64 {
        self.0.swap(0, Ordering::SeqCst)
    }

    fn covers(rung: u64, index: usize) -> bool {
        rung & (1 << index.min(OVERFLOW_BIT)) != 0
    }
}

/// Non-blocking entry points for interrupt handlers.
#[derive(Clone)]
pub struct InterruptSender {
    tx: Sender<Event>,
    state: Arc<StateMirror>,
    doorbells: Arc<Doorbells>,
}

impl InterruptSender {
    pub(crate) fn new(
        tx: Sender<Event>,
        state: Arc<StateMirror>,
        doorbells: Arc<Doorbells>,
    ) -> InterruptSender {
        InterruptSender {
            tx,
            state,
            doorbells,
        }
    }

    fn send(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("event queue full; dropping {event:?}");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn liveness(&self, milestone: Milestone) -> bool {
        self.send(Event::Liveness(milestone))
    }

    /// `None` wakes every service. Never dropped while the supervisor is
    /// alive: if the queue is full the pending mask still holds it.
    pub fn doorbell(&self, service: Option<usize>) -> bool {
        self.doorbells.ring(service);
        match self.tx.try_send(Event::Doorbell) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// The device reported a fatal error. Ignored while a restart is
    /// already under way.
    pub fn fault(&self, reason: impl Into<String>) -> bool {
        if self.state.load() == LifecycleState::Restarting {
            debug!("fault while restarting; ignored");
            return false;
        }
        self.send(Event::Fault {
            reason: reason.into(),
            epoch: self.state.fault_epoch(),
        })
    }
}

/// Handle on a running supervisor thread. Dropping it stops the thread.
pub struct Supervisor {
    tx: Sender<Event>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Event::Shutdown);
            if handle.join().is_err() {
                error!("AoC supervisor panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Aoc {
    /// Spawn the supervisor thread.
    pub fn start(self: &Arc<Self>) -> std::io::Result<Supervisor> {
        let aoc = self.clone();
        let handle = thread::Builder::new()
            .name("aoc-supervisor".into())
            .spawn(move || aoc.run())?;
        Ok(Supervisor {
            tx: self.events_tx.clone(),
            handle: Some(handle),
        })
    }

    /// The supervisor loop. Returns on [`Supervisor::shutdown`].
    pub fn run(&self) {
        info!("AoC supervisor running");
        loop {
            let event = match self.next_deadline() {
                Some(deadline) => match self.events_rx.recv_deadline(deadline) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match self.events_rx.recv() {
                    Ok(event) => Some(event),
                    Err(_) => return,
                },
            };

            match event {
                Some(Event::Shutdown) => break,
                Some(event) => self.handle(event),
                None => self.check_timers(Instant::now()),
            }
        }
        info!("AoC supervisor stopped");
    }

    /// Handle every queued event and expired timer on the calling thread.
    /// Returns how many events were handled. For hosts that drive the
    /// runtime from their own loop instead of [`Aoc::start`].
    pub fn poll(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            if event == Event::Shutdown {
                break;
            }
            self.handle(event);
            handled += 1;
        }
        self.check_timers(Instant::now());
        handled
    }

    pub(crate) fn kick(&self) {
        let _ = self.events_tx.try_send(Event::Kick);
    }

    fn handle(&self, event: Event) {
        debug!("event: {event:?}");
        match event {
            Event::Liveness(Milestone::Booted) => self.on_booted(),
            Event::Liveness(Milestone::Heartbeat) => {
                if !self.disarm_timer(TimerPurpose::HealthCheck) {
                    debug!("unexpected heartbeat");
                }
            }
            Event::Fault { reason, epoch } => {
                if epoch == self.state.fault_epoch() {
                    self.trigger(Trigger::Explicit(format!("AoC fault: {reason}")));
                } else {
                    debug!("fault {reason:?} predates the last restart; ignored");
                }
            }
            Event::Reset(reason) => self.trigger(Trigger::Explicit(reason)),
            Event::Load(name) => self.on_load(&name),
            Event::Doorbell | Event::Kick | Event::Shutdown => {}
        }

        let rung = self.doorbells.take();
        if rung != 0 {
            self.on_doorbell(rung);
        }
    }

    fn trigger(&self, trigger: Trigger) {
        if let Err(e) = self.restart(trigger) {
            error!("{e}");
        }
    }

    fn on_booted(&self) {
        {
            let mut table = lock(&self.table);
            if table.state != LifecycleState::FirmwareLoaded {
                debug!("boot signal while {}; ignored", table.state);
                return;
            }
            if let Err(e) = table.transition(LifecycleState::Starting, &self.state) {
                error!("{e}");
                return;
            }
        }
        self.try_bring_online();
    }

    fn on_doorbell(&self, rung: u64) {
        if self.state() == LifecycleState::Starting {
            self.try_bring_online();
            return;
        }

        let services: Vec<Arc<Service>> = lock(&self.table).services.clone();
        for service in services
            .iter()
            .filter(|s| Doorbells::covers(rung, s.descriptor().index))
        {
            service.wake(Direction::DeviceToHost);
            service.wake(Direction::HostToDevice);
        }
    }

    fn on_load(&self, name: &str) {
        let bytes = match self.source.fetch(name) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("could not fetch firmware {name}: {e}");
                crate::crash::Counters::bump(&self.counters.failed_loads);
                return;
            }
        };

        if self.state() == LifecycleState::Offline {
            if let Err(e) = self.boot(name, bytes) {
                error!("{e}");
            }
            return;
        }

        // Checked again when the restart boots it; this only keeps an
        // unbootable image from taking down the running one.
        let version = match aoc_image::validate(&bytes, self.interfaces.as_ref()) {
            Ok(image) => image.version(),
            Err(e) => {
                error!("firmware {name} is not bootable; keeping the running firmware: {e}");
                crate::crash::Counters::bump(&self.counters.failed_loads);
                return;
            }
        };
        *lock(&self.firmware) = Some(crate::LoadedFirmware {
            name: name.to_string(),
            bytes: bytes.into(),
            version,
        });
        self.trigger(Trigger::Explicit(format!("firmware {name} requested")));
    }

    /// Scan the service table and go Online if the device has published it.
    fn try_bring_online(&self) {
        let online = {
            let mut table = lock(&self.table);
            if table.state != LifecycleState::Starting {
                return;
            }
            let Some(base) = table.ipc_base else {
                return;
            };

            match service::scan(self.memory.dram(), base) {
                Ok(None) => {
                    debug!("service table not published yet");
                    return;
                }
                Ok(Some(descriptors)) => {
                    table.services = descriptors
                        .into_iter()
                        .map(|d| {
                            let driver = self.registry.resolve(&d.name);
                            Arc::new(Service::new(d, driver))
                        })
                        .collect();
                    match table.transition(LifecycleState::Online, &self.state) {
                        Ok(_) => Ok(table.services.clone()),
                        Err(e) => Err(e.to_string()),
                    }
                }
                Err(e) => Err(format!("invalid service table: {e}")),
            }
        };

        match online {
            Ok(services) => {
                self.disarm_timer(TimerPurpose::Boot);
                self.schedule_health_check(Instant::now());
                self.kick();
                info!("AoC online with {} services", services.len());
                for service in &services {
                    if let Some(driver) = service.driver() {
                        driver.probe(service.descriptor());
                    }
                }
            }
            Err(reason) => {
                error!("{reason}");
                self.trigger(Trigger::Explicit(reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_keeps_doorbells() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let doorbells = Arc::new(Doorbells::default());
        let sender = InterruptSender::new(tx, Arc::new(StateMirror::new()), doorbells.clone());
        assert!(sender.liveness(Milestone::Heartbeat));
        assert!(!sender.liveness(Milestone::Booted));
        assert!(sender.doorbell(Some(3)));
        assert!(sender.doorbell(Some(70)));
        assert_eq!(rx.try_recv(), Ok(Event::Liveness(Milestone::Heartbeat)));
        assert!(rx.try_recv().is_err());

        let rung = doorbells.take();
        assert!(Doorbells::covers(rung, 3));
        assert!(!Doorbells::covers(rung, 4));
        assert!(Doorbells::covers(rung, 70));
        assert_eq!(doorbells.take(), 0);
    }

    #[test]
    fn doorbell_for_everyone() {
        let doorbells = Doorbells::default();
        doorbells.ring(None);
        let rung = doorbells.take();
        assert!((0..100).all(|i| Doorbells::covers(rung, i)));
    }

    #[test]
    fn faults_carry_their_epoch() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let state = Arc::new(StateMirror::new());
        let sender = InterruptSender::new(tx, state.clone(), Arc::default());
        assert!(sender.fault("one"));
        assert_eq!(state.next_fault_epoch(), 1);
        assert!(sender.fault("two"));
        assert_eq!(
            rx.try_recv(),
            Ok(Event::Fault {
                reason: "one".into(),
                epoch: 0
            })
        );
        assert_eq!(
            rx.try_recv(),
            Ok(Event::Fault {
                reason: "two".into(),
                epoch: 1
            })
        );
    }

    #[test]
    fn milestone_names() {
        assert_eq!(Milestone::Booted.to_string(), "booted");
        assert_eq!(Milestone::Heartbeat.to_string(), "heartbeat");
    }
}
