// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory shared with the co-processor.
//!
//! The host sees two regions: the DRAM carveout holding the firmware image,
//! the IPC control block and the service buffers, and on-chip SRAM holding
//! the reset trampoline and the parameter block. Every access goes through
//! a bounds-checked accessor; nothing hands out raw pointers.

use crate::config::MemoryConfig;
use crate::util::lock;
use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use std::sync::Mutex;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MemoryError {
    #[error("{region} access at {offset:#x} (+{len:#x}) is outside the {size:#x}-byte region")]
    OutOfBounds {
        region: &'static str,
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// One contiguous shared region.
#[derive(Debug)]
pub struct Region {
    name: &'static str,
    phys_base: u64,
    device_base: u32,
    bytes: Mutex<Vec<u8>>,
}

impl Region {
    pub fn new(name: &'static str, phys_base: u64, device_base: u32, size: usize) -> Region {
        Region {
            name,
            phys_base,
            device_base,
            bytes: Mutex::new(vec![0; size]),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Base address in the co-processor's view.
    pub fn device_base(&self) -> u32 {
        self.device_base
    }

    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, offset: usize, len: usize, size: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset..end),
            _ => Err(MemoryError::OutOfBounds {
                region: self.name,
                offset,
                len,
                size,
            }),
        }
    }

    /// Run `f` over `len` bytes at `offset` while the region is locked.
    pub fn view<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R, MemoryError> {
        let bytes = lock(&self.bytes);
        let range = self.check(offset, len, bytes.len())?;
        Ok(f(&bytes[range]))
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.view(offset, buf.len(), |src| buf.copy_from_slice(src))
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = lock(&self.bytes);
        let range = self.check(offset, data.len(), bytes.len())?;
        trace!("{}: write {:#x} bytes at {:#x}", self.name, data.len(), offset);
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<(), MemoryError> {
        let mut bytes = lock(&self.bytes);
        let range = self.check(offset, len, bytes.len())?;
        bytes[range].fill(value);
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, MemoryError> {
        self.view(offset, 4, LittleEndian::read_u32)
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), MemoryError> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(offset, &buf)
    }

    /// A copy of the whole region.
    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.bytes).clone()
    }
}

/// The DRAM and SRAM regions of one co-processor.
#[derive(Debug)]
pub struct DeviceMemory {
    dram: Region,
    sram: Region,
}

impl DeviceMemory {
    pub fn new(config: &MemoryConfig) -> DeviceMemory {
        DeviceMemory {
            dram: Region::new(
                "dram",
                config.dram_base,
                config.device_dram_base,
                config.dram_size as usize,
            ),
            sram: Region::new(
                "sram",
                config.sram_base,
                config.device_sram_base,
                config.sram_size as usize,
            ),
        }
    }

    pub fn dram(&self) -> &Region {
        &self.dram
    }

    pub fn sram(&self) -> &Region {
        &self.sram
    }

    pub fn regions(&self) -> [&Region; 2] {
        [&self.dram, &self.sram]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_are_bounds_checked() {
        let region = Region::new("sram", 0, 0, 16);
        region.write_u32(12, 0x1122_3344).unwrap();
        assert_eq!(region.read_u32(12).unwrap(), 0x1122_3344);
        assert_eq!(region.snapshot()[12..], [0x44, 0x33, 0x22, 0x11]);

        assert_eq!(
            region.read_u32(13),
            Err(MemoryError::OutOfBounds {
                region: "sram",
                offset: 13,
                len: 4,
                size: 16
            })
        );
        assert!(region.write(usize::MAX, &[1]).is_err());
        assert!(region.fill(8, 9, 0).is_err());
    }

    #[test]
    fn regions_follow_config() {
        let config = MemoryConfig {
            dram_size: 0x100,
            sram_size: 0x80,
            ..Default::default()
        };
        let memory = DeviceMemory::new(&config);
        assert_eq!(memory.dram().len(), 0x100);
        assert_eq!(memory.sram().len(), 0x80);
        assert_eq!(memory.dram().phys_base(), config.dram_base);
        assert_eq!(memory.sram().device_base(), config.device_sram_base);
    }
}
