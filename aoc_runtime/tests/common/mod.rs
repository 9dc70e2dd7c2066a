// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fake co-processor for driving the runtime end to end.

#![allow(dead_code)]

use aoc_image::{ImageBuilder, ProtectionEntry};
use aoc_runtime::crash::DumpHeader;
use aoc_runtime::service::TableWriter;
use aoc_runtime::{
    Aoc, AuthError, Authenticator, Config, ConfigBuilder, CrashRecord, DeviceMemory,
    DiagnosticSink, Direction, HostFault, LifecycleState, Milestone, Platform, PlatformError,
    SinkError,
};
use packed_struct::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DRAM_SIZE: u32 = 0x1_0000;
pub const SRAM_SIZE: u32 = 0x1000;
pub const PARAMS_OFFSET: u32 = 0xf00;
pub const DUMP_OFFSET: u32 = 0xff00;
/// Where test images put their IPC control block, relative to the payload.
pub const IPC_OFFSET: u32 = 0x400;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config() -> ConfigBuilder {
    ConfigBuilder::new()
        .memory_sizes(DRAM_SIZE, SRAM_SIZE)
        .params_offset(PARAMS_OFFSET)
        .dump_header_offset(DUMP_OFFSET)
        .power_on_timeout(Duration::from_millis(50))
        .boot_timeout(Duration::from_secs(10))
        .poll_interval(Duration::from_millis(1))
        .reset_ack_timeout(Duration::from_millis(10))
        .dump_timeout(Duration::from_millis(10))
        .sink_retries(3, Duration::from_millis(1))
        .hysteresis(Duration::ZERO, Duration::ZERO, 0)
}

pub fn image() -> Vec<u8> {
    ImageBuilder::new()
        .version("test-1.0")
        .bootloader(vec![0xb0; 16])
        .protection([ProtectionEntry {
            virt_start: 0,
            phys_start: 0x9000_0000,
            size: DRAM_SIZE,
        }])
        .body((0..0x800u32).map(|i| i as u8).collect::<Vec<_>>())
        .ipc_offset(IPC_OFFSET)
        .build()
        .unwrap()
}

/// Platform side of the fake: power, reset and doorbells.
#[derive(Default)]
pub struct FakeDevice {
    pub powers_on: AtomicBool,
    powered: AtomicBool,
    pub acks_reset: AtomicBool,
    in_reset: AtomicBool,
    pub power_requests: AtomicUsize,
    pub power_releases: AtomicUsize,
    pub reset_requests: AtomicUsize,
    pub reset_releases: AtomicUsize,
    pub fault_irqs: AtomicBool,
    pub pings: AtomicUsize,
    pub protection: Mutex<Vec<ProtectionEntry>>,
    pub doorbells: Mutex<Vec<(usize, Direction)>>,
    /// Diagnostic header written when a dump is requested.
    pub dump: Mutex<Option<DumpHeader>>,
    pub memory: Mutex<Option<Arc<DeviceMemory>>>,
}

impl FakeDevice {
    pub fn new() -> Arc<FakeDevice> {
        let device = FakeDevice::default();
        device.powers_on.store(true, Ordering::SeqCst);
        device.acks_reset.store(true, Ordering::SeqCst);
        Arc::new(device)
    }

    pub fn doorbells(&self) -> Vec<(usize, Direction)> {
        self.doorbells.lock().unwrap().clone()
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    /// Finish a power-on that `powers_on` held back.
    pub fn power_up(&self) {
        self.powered.store(true, Ordering::SeqCst);
    }
}

impl Platform for FakeDevice {
    fn request_power_on(&self) -> Result<(), PlatformError> {
        self.power_requests.fetch_add(1, Ordering::SeqCst);
        self.powered
            .store(self.powers_on.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    fn release_power(&self) {
        self.power_releases.fetch_add(1, Ordering::SeqCst);
        self.powered.store(false, Ordering::SeqCst);
    }

    fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn program_protection(&self, entries: &[ProtectionEntry]) -> Result<(), PlatformError> {
        *self.protection.lock().unwrap() = entries.to_vec();
        Ok(())
    }

    fn release_reset(&self) -> Result<(), PlatformError> {
        self.reset_releases.fetch_add(1, Ordering::SeqCst);
        self.in_reset.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn request_reset(&self) -> Result<(), PlatformError> {
        self.reset_requests.fetch_add(1, Ordering::SeqCst);
        self.in_reset
            .store(self.acks_reset.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    fn reset_acknowledged(&self) -> bool {
        self.in_reset.load(Ordering::SeqCst)
    }

    fn request_dump(&self) {
        let header = self.dump.lock().unwrap().clone();
        let memory = self.memory.lock().unwrap().clone();
        if let (Some(header), Some(memory)) = (header, memory) {
            memory
                .dram()
                .write(DUMP_OFFSET as usize, &header.pack().unwrap())
                .unwrap();
        }
    }

    fn set_fault_interrupts(&self, enabled: bool) {
        self.fault_irqs.store(enabled, Ordering::SeqCst);
    }

    fn signal_device(&self, index: usize, direction: Direction) {
        self.doorbells.lock().unwrap().push((index, direction));
    }

    fn ping(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records crash records; answers `NotReady` for the first `not_ready`
/// submissions.
#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<CrashRecord>>,
    pub answers: Mutex<VecDeque<SinkError>>,
    pub submissions: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<RecordingSink> {
        Arc::new(RecordingSink::default())
    }

    pub fn answer(&self, errors: impl IntoIterator<Item = SinkError>) {
        self.answers.lock().unwrap().extend(errors);
    }

    pub fn reasons(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.reason.clone())
            .collect()
    }
}

impl DiagnosticSink for RecordingSink {
    fn submit(&self, record: &CrashRecord) -> Result<(), SinkError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.answers.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingFault {
    pub reasons: Mutex<Vec<String>>,
}

impl HostFault for RecordingFault {
    fn escalate(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

#[derive(Default)]
pub struct FakeAuthenticator {
    pub headers: Mutex<Vec<Vec<u8>>>,
    pub started: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub reject: AtomicBool,
}

impl Authenticator for FakeAuthenticator {
    fn authenticate(&self, header: &[u8]) -> Result<(), AuthError> {
        self.headers.lock().unwrap().push(header.to_vec());
        if self.reject.load(Ordering::SeqCst) {
            Err(AuthError::Rejected("bad signature".into()))
        } else {
            Ok(())
        }
    }

    fn start(&self) -> Result<(), AuthError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), AuthError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A runtime wired to a fake device, a recording sink and a recording
/// host fault path.
pub struct Harness {
    pub aoc: Arc<Aoc>,
    pub device: Arc<FakeDevice>,
    pub sink: Arc<RecordingSink>,
    pub fault: Arc<RecordingFault>,
}

impl Harness {
    pub fn new(config: Config) -> Harness {
        Harness::with(config, |builder| builder)
    }

    pub fn with(
        config: Config,
        customize: impl FnOnce(aoc_runtime::AocBuilder) -> aoc_runtime::AocBuilder,
    ) -> Harness {
        init_logging();
        let device = FakeDevice::new();
        let sink = RecordingSink::new();
        let fault = Arc::new(RecordingFault::default());
        let memory = Arc::new(DeviceMemory::new(&config.memory));
        *device.memory.lock().unwrap() = Some(memory.clone());

        let builder = Aoc::builder(config, device.clone())
            .memory(memory)
            .interfaces(Arc::new(|_: &[aoc_runtime::InterfaceId]| true))
            .sink(sink.clone())
            .host_fault(fault.clone());
        let aoc = customize(builder).build().unwrap();

        Harness {
            aoc,
            device,
            sink,
            fault,
        }
    }

    pub fn dram(&self) -> &aoc_runtime::memory::Region {
        self.aoc.memory().dram()
    }

    pub fn ipc_base(&self) -> usize {
        (self.aoc.config().memory.image_offset + IPC_OFFSET) as usize
    }

    /// Publish `table` the way firmware does after boot, then report it.
    pub fn publish(&self, table: TableWriter) {
        table.write(self.dram(), self.ipc_base()).unwrap();
        self.aoc.interrupts().liveness(Milestone::Booted);
        self.aoc.poll();
    }

    /// Boot the test image and publish `table`.
    pub fn bring_online(&self, table: TableWriter) {
        self.aoc.boot("test.bin", image()).unwrap();
        assert_eq!(self.aoc.state(), LifecycleState::FirmwareLoaded);
        self.publish(table);
        assert_eq!(self.aoc.state(), LifecycleState::Online);
    }
}
