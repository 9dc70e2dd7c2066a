// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The service table the firmware publishes in DRAM once it has booted.
//!
//! The IPC control block sits at `image_offset + ipc_offset` and points at
//! an array of fixed-size service entries. Each entry names a service and
//! describes its two directions. All offsets inside the table are relative
//! to the control block.

use crate::memory::{MemoryError, Region};
use bitfield::bitfield;
use log::{debug, trace, warn};
use packed_struct::prelude::*;
use serde::Serialize;
use std::collections::HashSet;

/// `"AOCC"`, little endian.
pub const CONTROL_MAGIC: u32 = u32::from_le_bytes(*b"AOCC");
pub const CONTROL_VERSION: u32 = 1;
pub const CONTROL_BLOCK_SIZE: usize = 0x20;
pub const SERVICE_ENTRY_SIZE: usize = 0x50;
pub const MAX_SERVICES: u32 = 256;
pub const NAME_LEN: usize = 32;

// Offsets of the directions and their counters inside a service entry.
pub const D2H_OFFSET: usize = 0x28;
pub const H2D_OFFSET: usize = 0x3c;
pub const TX_OFFSET: usize = 0x08;
pub const RX_OFFSET: usize = 0x0c;

#[derive(Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "0x20", bit_numbering = "msb0", endian = "lsb")]
pub struct ControlBlock {
    pub magic: u32,
    pub version: u32,
    pub service_count: u32,
    pub entry_stride: u32,
    pub services_offset: u32,
    pub reserved: [u8; 12],
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "20", bit_numbering = "msb0", endian = "lsb")]
pub struct DirectionEntry {
    pub slot_size: u32,
    pub slot_count: u32,
    pub tx: u32,
    pub rx: u32,
    pub data_offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "0x50", bit_numbering = "msb0", endian = "lsb")]
pub struct ServiceEntry {
    pub name: [u8; 32],
    pub flags: u32,
    pub reserved: u32,
    #[packed_field(size_bytes = "20")]
    pub d2h: DirectionEntry,
    #[packed_field(size_bytes = "20")]
    pub h2d: DirectionEntry,
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct ServiceFlags(u32);
    impl Debug;
    pub d2h_ring, set_d2h_ring: 0;
    pub h2d_ring, set_h2d_ring: 1;
    /// The device polls this direction; writes do not ring its doorbell.
    pub h2d_push, set_h2d_push: 2;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[strum(serialize = "device-to-host")]
    DeviceToHost = 0,
    #[strum(serialize = "host-to-device")]
    HostToDevice = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Mode {
    /// Discrete length-prefixed messages, one per slot.
    Message,
    /// A byte stream in a single slot.
    Ring,
}

/// One direction of a service, resolved to absolute DRAM offsets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub mode: Mode,
    pub slot_size: u32,
    pub slot_count: u32,
    /// DRAM offset of the producer counter.
    pub tx_at: usize,
    /// DRAM offset of the consumer counter.
    pub rx_at: usize,
    /// DRAM offset of the first slot.
    pub data_at: usize,
}

impl Channel {
    /// A direction with no slots or zero-sized slots is not configured.
    pub fn is_configured(&self) -> bool {
        self.slot_size > 0 && self.slot_count > 0
    }

    /// Distance between message slots: a length word plus the payload,
    /// rounded up to a word.
    pub fn slot_stride(&self) -> usize {
        4 + (self.slot_size as usize + 3) / 4 * 4
    }

    /// Bytes of DRAM the data area covers.
    pub fn data_len(&self) -> Option<usize> {
        match self.mode {
            Mode::Ring => Some(self.slot_size as usize),
            Mode::Message => self.slot_stride().checked_mul(self.slot_count as usize),
        }
    }
}

/// A named service as published by the firmware.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    /// Position in the published table; doorbells are addressed by it.
    pub index: usize,
    pub name: String,
    #[serde(skip)]
    pub flags: ServiceFlags,
    pub d2h: Channel,
    pub h2d: Channel,
}

impl ServiceDescriptor {
    pub fn channel(&self, direction: Direction) -> &Channel {
        match direction {
            Direction::DeviceToHost => &self.d2h,
            Direction::HostToDevice => &self.h2d,
        }
    }

    /// True when host writes are picked up by device polling.
    pub fn is_push(&self) -> bool {
        self.h2d.mode == Mode::Ring && self.flags.h2d_push()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScanError {
    #[error("control block version {0} is not supported")]
    UnsupportedVersion(u32),

    #[error("control block lists {0} services, more than {MAX_SERVICES}")]
    TooManyServices(u32),

    #[error("service entry stride {0:#x} is smaller than an entry")]
    BadStride(u32),

    #[error("service {index} has no valid name")]
    BadName { index: usize },

    #[error("service name {0:?} is published twice")]
    DuplicateName(String),

    #[error("{direction} data of service {name:?} lies outside DRAM")]
    RegionOutOfBounds { name: String, direction: Direction },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("could not decode service table: {0}")]
    Packing(String),
}

impl From<PackingError> for ScanError {
    fn from(e: PackingError) -> Self {
        ScanError::Packing(e.to_string())
    }
}

/// Names are 1..=31 bytes followed by at least one NUL.
fn parse_name(raw: &[u8; NAME_LEN]) -> Option<String> {
    let len = raw.iter().position(|&b| b == 0)?;
    if len == 0 {
        return None;
    }
    std::str::from_utf8(&raw[..len]).ok().map(str::to_owned)
}

fn channel(
    dram: &Region,
    base: usize,
    entry_at: usize,
    dir_offset: usize,
    entry: &DirectionEntry,
    ring: bool,
) -> Option<Channel> {
    let channel = Channel {
        mode: if ring { Mode::Ring } else { Mode::Message },
        slot_size: entry.slot_size,
        slot_count: entry.slot_count,
        tx_at: entry_at + dir_offset + TX_OFFSET,
        rx_at: entry_at + dir_offset + RX_OFFSET,
        data_at: base.checked_add(entry.data_offset as usize)?,
    };
    if channel.is_configured() {
        let end = channel.data_at.checked_add(channel.data_len()?)?;
        if end > dram.len() {
            return None;
        }
    }
    Some(channel)
}

/// Read the service table whose control block is at DRAM offset `base`.
///
/// Returns `Ok(None)` while the firmware has not published a control block
/// yet. A malformed table is rejected as a whole; a ring direction with
/// more than one slot only drops the service that declares it.
pub fn scan(dram: &Region, base: usize) -> Result<Option<Vec<ServiceDescriptor>>, ScanError> {
    let control = dram.view(base, CONTROL_BLOCK_SIZE, ControlBlock::unpack_from_slice)??;
    if control.magic != CONTROL_MAGIC {
        trace!("no control block at {base:#x} yet ({:#010x})", control.magic);
        return Ok(None);
    }
    if control.version != CONTROL_VERSION {
        return Err(ScanError::UnsupportedVersion(control.version));
    }
    if control.service_count > MAX_SERVICES {
        return Err(ScanError::TooManyServices(control.service_count));
    }
    if (control.entry_stride as usize) < SERVICE_ENTRY_SIZE {
        return Err(ScanError::BadStride(control.entry_stride));
    }

    let stride = control.entry_stride as usize;
    let table_at = base + control.services_offset as usize;
    let mut names = HashSet::new();
    let mut services = Vec::new();

    for index in 0..control.service_count as usize {
        let entry_at = table_at + index * stride;
        let entry = dram.view(entry_at, SERVICE_ENTRY_SIZE, ServiceEntry::unpack_from_slice)??;

        let name = parse_name(&entry.name).ok_or(ScanError::BadName { index })?;
        if !names.insert(name.clone()) {
            return Err(ScanError::DuplicateName(name));
        }

        let flags = ServiceFlags(entry.flags);
        let rings = [
            (flags.d2h_ring(), &entry.d2h, Direction::DeviceToHost),
            (flags.h2d_ring(), &entry.h2d, Direction::HostToDevice),
        ];
        if let Some((_, d, direction)) = rings.iter().find(|(ring, d, _)| *ring && d.slot_count > 1) {
            warn!(
                "service {name:?}: {direction} ring declares {} slots; skipping service",
                d.slot_count
            );
            continue;
        }

        let d2h = channel(dram, base, entry_at, D2H_OFFSET, &entry.d2h, flags.d2h_ring()).ok_or(
            ScanError::RegionOutOfBounds {
                name: name.clone(),
                direction: Direction::DeviceToHost,
            },
        )?;
        let h2d = channel(dram, base, entry_at, H2D_OFFSET, &entry.h2d, flags.h2d_ring()).ok_or(
            ScanError::RegionOutOfBounds {
                name: name.clone(),
                direction: Direction::HostToDevice,
            },
        )?;

        debug!(
            "service {index}: {name:?} d2h {}x{} h2d {}x{}",
            d2h.slot_count, d2h.slot_size, h2d.slot_count, h2d.slot_size
        );
        services.push(ServiceDescriptor {
            index,
            name,
            flags,
            d2h,
            h2d,
        });
    }

    Ok(Some(services))
}

/// Clear the control block magic at `base` so a stale table is never
/// mistaken for one the next firmware published.
pub fn retract(dram: &Region, base: usize) -> Result<(), MemoryError> {
    dram.write_u32(base, 0)
}

/// Builds a control block and service table in DRAM the way firmware does.
/// Used by device models and tests.
#[derive(Clone, Debug, Default)]
pub struct TableWriter {
    services: Vec<ServiceEntry>,
}

impl TableWriter {
    pub fn new() -> TableWriter {
        TableWriter::default()
    }

    /// Add a service; `d2h` and `h2d` are `(slot_size, slot_count)`. Data
    /// areas are laid out after the table.
    pub fn service(mut self, name: &str, flags: ServiceFlags, d2h: (u32, u32), h2d: (u32, u32)) -> Self {
        let mut entry = ServiceEntry {
            flags: flags.0,
            ..Default::default()
        };
        let len = name.len().min(NAME_LEN);
        entry.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        entry.d2h.slot_size = d2h.0;
        entry.d2h.slot_count = d2h.1;
        entry.h2d.slot_size = h2d.0;
        entry.h2d.slot_count = h2d.1;
        self.services.push(entry);
        self
    }

    /// Write the table at DRAM offset `base`. Returns the entries as
    /// written, data offsets filled in.
    pub fn write(mut self, dram: &Region, base: usize) -> Result<Vec<ServiceEntry>, ScanError> {
        let table_offset = CONTROL_BLOCK_SIZE;
        let mut data_offset = table_offset + self.services.len() * SERVICE_ENTRY_SIZE;

        for entry in &mut self.services {
            let flags = ServiceFlags(entry.flags);
            for (dir, ring) in [(&mut entry.d2h, flags.d2h_ring()), (&mut entry.h2d, flags.h2d_ring())] {
                dir.data_offset = data_offset as u32;
                let channel = Channel {
                    mode: if ring { Mode::Ring } else { Mode::Message },
                    slot_size: dir.slot_size,
                    slot_count: dir.slot_count,
                    tx_at: 0,
                    rx_at: 0,
                    data_at: 0,
                };
                if channel.is_configured() {
                    data_offset += channel.data_len().unwrap_or(0);
                }
            }
        }

        for (index, entry) in self.services.iter().enumerate() {
            dram.write(base + table_offset + index * SERVICE_ENTRY_SIZE, &entry.pack()?)?;
        }

        // Publish the control block last.
        let control = ControlBlock {
            magic: CONTROL_MAGIC,
            version: CONTROL_VERSION,
            service_count: self.services.len() as u32,
            entry_stride: SERVICE_ENTRY_SIZE as u32,
            services_offset: table_offset as u32,
            reserved: [0; 12],
        };
        dram.write(base, &control.pack()?)?;
        Ok(self.services)
    }
}

pub fn flags(d2h_ring: bool, h2d_ring: bool, h2d_push: bool) -> ServiceFlags {
    let mut flags = ServiceFlags(0);
    flags.set_d2h_ring(d2h_ring);
    flags.set_h2d_ring(h2d_ring);
    flags.set_h2d_push(h2d_push);
    flags
}
