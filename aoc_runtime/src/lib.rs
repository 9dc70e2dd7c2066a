// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side runtime for the always-on co-processor (AoC).
//!
//! An [`Aoc`] owns everything the host knows about one co-processor: the
//! shared memory arena, the lifecycle state, the table of services the
//! firmware published and the restart machinery. It is built once with
//! [`AocBuilder`] and shared behind an [`Arc`].
//!
//! Hardware-facing work is delegated to collaborators ([`Platform`],
//! [`Authenticator`], [`DiagnosticSink`], [`HostFault`],
//! [`FirmwareSource`]). Interrupt handlers talk to the runtime through an
//! [`InterruptSender`]; a single supervisor thread ([`Aoc::start`]) turns
//! those events into lifecycle changes.

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

pub mod boot;
pub mod config;
pub mod control;
pub mod crash;
pub mod events;
pub mod lifecycle;
pub mod memory;
pub mod params;
pub mod platform;
pub mod registry;
pub mod service;
pub mod source;
pub mod transport;
mod util;
pub mod watchdog;

pub use aoc_image::{InterfaceChecker, InterfaceId, KnownInterfaces};
pub use boot::BootError;
pub use config::{Config, ConfigBuilder, ConfigError};
pub use control::{Attribute, ControlError};
pub use crash::{CounterSnapshot, CrashRecord, Segment};
pub use events::{InterruptSender, Milestone, Supervisor};
pub use lifecycle::{LifecycleError, LifecycleState};
pub use memory::{DeviceMemory, MemoryError};
pub use platform::{
    AuthError, Authenticator, DiagnosticSink, HostFault, LogSink, PanicOnFault, Platform,
    PlatformError, SinkError,
};
pub use registry::{Pattern, Registry, ServiceDriver};
pub use service::{Direction, ServiceDescriptor};
pub use source::{DirectorySource, FirmwareSource};
pub use transport::{ServiceHandle, TransportError, Wait};
pub use watchdog::RestartError;

use crash::Counters;
use events::{Doorbells, Event};
use lifecycle::{ServiceTable, StateMirror};
use watchdog::{Hysteresis, Timers};

/// The image the runtime boots, and reboots after a restart.
#[derive(Clone, Debug)]
pub(crate) struct LoadedFirmware {
    pub(crate) name: String,
    pub(crate) bytes: Arc<[u8]>,
    pub(crate) version: String,
}

/// Runtime context for one co-processor.
pub struct Aoc {
    pub(crate) config: Config,
    pub(crate) memory: Arc<DeviceMemory>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) interfaces: Arc<dyn InterfaceChecker + Send + Sync>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) sink: Arc<dyn DiagnosticSink>,
    pub(crate) host_fault: Arc<dyn HostFault>,
    pub(crate) source: Arc<dyn FirmwareSource>,
    pub(crate) registry: Registry,

    /// The service lock: lifecycle state plus the service table.
    pub(crate) table: Mutex<ServiceTable>,
    pub(crate) state: Arc<StateMirror>,
    pub(crate) in_flight: AtomicUsize,

    pub(crate) firmware: Mutex<Option<LoadedFirmware>>,
    pub(crate) counters: Counters,
    pub(crate) hysteresis: Mutex<Hysteresis>,
    pub(crate) timers: Mutex<Timers>,
    pub(crate) operator_resets: std::sync::atomic::AtomicBool,

    pub(crate) events_tx: Sender<Event>,
    pub(crate) events_rx: Receiver<Event>,
    pub(crate) doorbells: Arc<Doorbells>,
}

impl Aoc {
    pub fn builder(config: Config, platform: Arc<dyn Platform>) -> AocBuilder {
        AocBuilder::new(config, platform)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    pub fn state(&self) -> LifecycleState {
        self.state.load()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Entry points for interrupt handlers.
    pub fn interrupts(&self) -> InterruptSender {
        InterruptSender::new(
            self.events_tx.clone(),
            self.state.clone(),
            self.doorbells.clone(),
        )
    }

    /// Name and version of the cached firmware, if any.
    pub fn firmware(&self) -> Option<(String, String)> {
        util::lock(&self.firmware)
            .as_ref()
            .map(|fw| (fw.name.clone(), fw.version.clone()))
    }
}

/// Builds an [`Aoc`]. Every collaborator except the platform has a stock
/// default.
pub struct AocBuilder {
    config: Config,
    platform: Arc<dyn Platform>,
    memory: Option<Arc<DeviceMemory>>,
    interfaces: Arc<dyn InterfaceChecker + Send + Sync>,
    authenticator: Option<Arc<dyn Authenticator>>,
    sink: Arc<dyn DiagnosticSink>,
    host_fault: Arc<dyn HostFault>,
    source: Option<Arc<dyn FirmwareSource>>,
    registry: Registry,
}

impl AocBuilder {
    pub fn new(config: Config, platform: Arc<dyn Platform>) -> Self {
        AocBuilder {
            config,
            platform,
            memory: None,
            interfaces: Arc::new(KnownInterfaces::default()),
            authenticator: None,
            sink: Arc::new(LogSink),
            host_fault: Arc::new(PanicOnFault),
            source: None,
            registry: Registry::new(),
        }
    }

    /// Share an existing arena, e.g. with a device model.
    pub fn memory(mut self, memory: Arc<DeviceMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn interfaces(mut self, checker: Arc<dyn InterfaceChecker + Send + Sync>) -> Self {
        self.interfaces = checker;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn host_fault(mut self, host_fault: Arc<dyn HostFault>) -> Self {
        self.host_fault = host_fault;
        self
    }

    pub fn source(mut self, source: Arc<dyn FirmwareSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn driver(mut self, pattern: Pattern, driver: Arc<dyn ServiceDriver>) -> Self {
        self.registry.bind(pattern, driver);
        self
    }

    pub fn build(self) -> Result<Arc<Aoc>, ConfigError> {
        self.config.check()?;
        if self.config.boot.secure && self.authenticator.is_none() {
            return Err(ConfigError::Invalid(
                "secure boot needs an authenticator".into(),
            ));
        }

        let memory = match self.memory {
            Some(memory) => memory,
            None => Arc::new(DeviceMemory::new(&self.config.memory)),
        };
        if memory.dram().len() != self.config.memory.dram_size as usize
            || memory.sram().len() != self.config.memory.sram_size as usize
        {
            return Err(ConfigError::Invalid(
                "shared memory does not match the configured sizes".into(),
            ));
        }

        let source = match self.source {
            Some(source) => source,
            None => Arc::new(DirectorySource::new(&self.config.firmware.directory)),
        };
        let (events_tx, events_rx) = crossbeam_channel::bounded(self.config.events.queue_depth);
        let hysteresis = Hysteresis::new(&self.config.restart);
        let operator_resets = self.config.restart.operator_resets;

        Ok(Arc::new(Aoc {
            memory,
            platform: self.platform,
            interfaces: self.interfaces,
            authenticator: self.authenticator,
            sink: self.sink,
            host_fault: self.host_fault,
            source,
            registry: self.registry,
            table: Mutex::new(ServiceTable::default()),
            state: Arc::new(StateMirror::new()),
            in_flight: AtomicUsize::new(0),
            firmware: Mutex::new(None),
            counters: Counters::default(),
            hysteresis: Mutex::new(hysteresis),
            timers: Mutex::new(Timers::default()),
            operator_resets: std::sync::atomic::AtomicBool::new(operator_resets),
            events_tx,
            events_rx,
            doorbells: Arc::default(),
            config: self.config,
        }))
    }
}
