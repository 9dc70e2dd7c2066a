// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle of the co-processor as seen from the host.
//!
//! ```text
//!                 boot                booted            table ok
//!   Offline ───────────────▶ FirmwareLoaded ───▶ Starting ───────▶ Online
//!     ▲  ▲   boot failed           │                 │                │
//!     │  └─────────────────────────┘                 │                │
//!     │                                              ▼                │
//!     └──────────────────────────────────────── Restarting ◀──────────┘
//! ```
//!
//! Every state other than `Restarting` may enter `Restarting`. Only
//! `Offline` and `Online` mean anything to transport callers: `Online` is
//! the only state in which the service table may be used.

use crate::transport::Service;
use log::info;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    FromPrimitive,
    Serialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[repr(u8)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LifecycleState {
    Offline = 0,
    FirmwareLoaded = 1,
    Starting = 2,
    Online = 3,
    Restarting = 4,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Offline, FirmwareLoaded)
                | (FirmwareLoaded, Starting)
                | (Starting, Online)
                | (FirmwareLoaded, Offline)
                | (Offline | FirmwareLoaded | Starting | Online, Restarting)
                | (Restarting, Offline)
        )
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("illegal lifecycle transition {from} -> {to}")]
    IllegalTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Lock-free copy of the current state for wait predicates and interrupt
/// filtering. Written only with the service lock held.
///
/// Also carries the fault epoch: it advances whenever fault interrupts are
/// masked, so faults raised before that point can be told apart from ones
/// the next firmware raises.
#[derive(Debug)]
pub(crate) struct StateMirror {
    state: AtomicU8,
    fault_epoch: AtomicU64,
}

impl StateMirror {
    pub(crate) fn new() -> StateMirror {
        StateMirror {
            state: AtomicU8::new(LifecycleState::Offline as u8),
            fault_epoch: AtomicU64::new(0),
        }
    }

    pub(crate) fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst)).unwrap_or(LifecycleState::Offline)
    }

    fn store(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn fault_epoch(&self) -> u64 {
        self.fault_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn next_fault_epoch(&self) -> u64 {
        self.fault_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Everything guarded by the service lock.
#[derive(Default)]
pub(crate) struct ServiceTable {
    pub(crate) state: LifecycleState,
    pub(crate) services: Vec<Arc<Service>>,
    /// DRAM offset of the IPC control block of the loaded image.
    pub(crate) ipc_base: Option<usize>,
    /// A boot holds the device between its Offline check and its end.
    pub(crate) booting: bool,
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::Offline
    }
}

impl ServiceTable {
    /// Move to `next`, returning the previous state. Leaving `Online` marks
    /// every service dead and wakes its waiters before the lock is released.
    pub(crate) fn transition(
        &mut self,
        next: LifecycleState,
        mirror: &StateMirror,
    ) -> Result<LifecycleState, LifecycleError> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition { from, to: next });
        }

        info!("AoC state: {from} -> {next}");
        self.state = next;
        mirror.store(next);

        if from == LifecycleState::Online {
            for service in &self.services {
                service.kill();
            }
        }
        Ok(from)
    }

    pub(crate) fn find(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.iter().find(|s| s.name() == name)
    }
}
