// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crash records and the counters that track restarts.

use crate::memory::{DeviceMemory, MemoryError};
use packed_struct::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// `"DUMP"`, little endian.
pub const DUMP_MAGIC: u32 = u32::from_le_bytes(*b"DUMP");
pub const DUMP_VALID: u32 = 1;
pub const DUMP_HEADER_SIZE: usize = 0x70;
const DUMP_VALID_OFFSET: usize = 4;

/// Written by the firmware when asked for a dump.
#[derive(Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "0x70", bit_numbering = "msb0", endian = "lsb")]
pub struct DumpHeader {
    pub magic: u32,
    pub valid: u32,
    pub breadcrumb_0: u32,
    pub breadcrumb_1: u32,
    // NUL padded, split to keep arrays packable
    pub reason_0: [u8; 32],
    pub reason_1: [u8; 32],
    pub reason_2: [u8; 32],
}

impl DumpHeader {
    /// A complete header: right magic and the valid marker set.
    pub fn is_valid(&self) -> bool {
        self.magic == DUMP_MAGIC && self.valid == DUMP_VALID
    }

    pub fn breadcrumbs(&self) -> [u32; 2] {
        [self.breadcrumb_0, self.breadcrumb_1]
    }

    pub fn reason(&self) -> String {
        let mut raw = Vec::with_capacity(96);
        raw.extend_from_slice(&self.reason_0);
        raw.extend_from_slice(&self.reason_1);
        raw.extend_from_slice(&self.reason_2);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).trim().to_string()
    }

    /// Build a header the way the firmware writes one.
    pub fn new(reason: &str, breadcrumbs: [u32; 2]) -> DumpHeader {
        let mut raw = [0u8; 96];
        let len = reason.len().min(raw.len() - 1);
        raw[..len].copy_from_slice(&reason.as_bytes()[..len]);

        let mut header = DumpHeader {
            magic: DUMP_MAGIC,
            valid: DUMP_VALID,
            breadcrumb_0: breadcrumbs[0],
            breadcrumb_1: breadcrumbs[1],
            ..Default::default()
        };
        header.reason_0.copy_from_slice(&raw[..32]);
        header.reason_1.copy_from_slice(&raw[32..64]);
        header.reason_2.copy_from_slice(&raw[64..]);
        header
    }

    pub(crate) fn read(memory: &DeviceMemory, offset: usize) -> Result<DumpHeader, MemoryError> {
        let mut bytes = [0u8; DUMP_HEADER_SIZE];
        memory.dram().read(offset, &mut bytes)?;
        // A header that does not unpack is as good as an incomplete one.
        Ok(DumpHeader::unpack(&bytes).unwrap_or_default())
    }

    /// Clear the valid marker so a stale header is not mistaken for a new one.
    pub(crate) fn invalidate(memory: &DeviceMemory, offset: usize) -> Result<(), MemoryError> {
        memory.dram().write_u32(offset + DUMP_VALID_OFFSET, 0)
    }
}

/// A copy of one shared memory region at crash time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub name: &'static str,
    /// Base in the co-processor's view.
    pub device_address: u32,
    pub phys_base: u64,
    pub bytes: Vec<u8>,
}

impl Segment {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// What gets handed to the diagnostic sink after a crash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashRecord {
    pub reason: String,
    pub breadcrumbs: [u32; 2],
    /// Whether the firmware finished writing its diagnostic header.
    pub complete: bool,
    pub segments: Vec<Segment>,
}

impl CrashRecord {
    pub(crate) fn capture(memory: &DeviceMemory, header: &DumpHeader, trigger: &str) -> CrashRecord {
        let (reason, complete) = match (header.is_valid(), header.reason()) {
            (true, reason) if !reason.is_empty() => (format!("AoC crash: {reason}"), true),
            (true, _) => (format!("AoC crash: {trigger}"), true),
            (false, _) => (
                format!(
                    "AoC watchdog: {trigger} (dump incomplete, breadcrumbs {:#010x} {:#010x})",
                    header.breadcrumb_0, header.breadcrumb_1
                ),
                false,
            ),
        };

        CrashRecord {
            reason,
            breadcrumbs: header.breadcrumbs(),
            complete,
            segments: memory
                .regions()
                .iter()
                .map(|region| Segment {
                    name: region.name(),
                    device_address: region.device_base(),
                    phys_base: region.phys_base(),
                    bytes: region.snapshot(),
                })
                .collect(),
        }
    }

    pub fn total_size(&self) -> usize {
        self.segments.iter().map(Segment::size).sum()
    }
}

/// Monotonic event counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) restarts: AtomicU64,
    pub(crate) coredumps: AtomicU64,
    pub(crate) failed_restarts: AtomicU64,
    pub(crate) failed_loads: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            restarts: self.restarts.load(Ordering::SeqCst),
            coredumps: self.coredumps.load(Ordering::SeqCst),
            failed_restarts: self.failed_restarts.load(Ordering::SeqCst),
            failed_loads: self.failed_loads.load(Ordering::SeqCst),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub restarts: u64,
    pub coredumps: u64,
    pub failed_restarts: u64,
    pub failed_loads: u64,
}
