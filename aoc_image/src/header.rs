// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_derive::{FromPrimitive, ToPrimitive};
use packed_struct::prelude::*;
use std::ops::Range;

/// Expected value of [`FirmwareHeader::magic`].
pub const IMAGE_MAGIC: u32 = 0xaabb_ccdd;

/// Packed size of [`FirmwareHeader`].
pub const HEADER_SIZE: usize = 0x60;

// Byte ranges of individual header fields, relative to the payload.
pub const HEADER_MAGIC: Range<usize> = 0x00..0x04;
pub const HEADER_RELEASE_TYPE: Range<usize> = 0x04..0x08;
pub const HEADER_IMAGE_SIZE: Range<usize> = 0x10..0x14;
pub const HEADER_BOOTLOADER_OFFSET: Range<usize> = 0x14..0x18;
pub const HEADER_UUID_TABLE_OFFSET: Range<usize> = 0x1c..0x20;
pub const HEADER_UUID_TABLE_SIZE: Range<usize> = 0x20..0x24;
pub const HEADER_VERSION: Range<usize> = 0x30..0x50;

/// Whether an image was built for development or for release. Release
/// images must additionally pass the interface compatibility check.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReleaseType {
    Development = 0,
    Release = 1,
}

/// The fixed header at the start of every payload. All fields are little
/// endian; offsets are relative to the start of the payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "0x60", bit_numbering = "msb0", endian = "lsb")]
pub struct FirmwareHeader {
    pub magic: u32,
    pub release_type: u32,
    pub container_version: u32,
    pub firmware_version: u32,
    pub image_size: u32,
    pub bootloader_offset: u32,
    pub bootloader_size: u32,
    pub uuid_table_offset: u32,
    pub uuid_table_size: u32,
    pub protection_table_offset: u32,
    pub protection_table_size: u32,
    pub ipc_offset: u32,
    /// NUL padded, not necessarily NUL terminated.
    pub version: [u8; 32],
    pub reserved: [u8; 16],
}

impl FirmwareHeader {
    pub fn bootloader(&self) -> Region {
        Region::new(RegionKind::Bootloader, self.bootloader_offset, self.bootloader_size)
    }

    pub fn uuid_table(&self) -> Region {
        Region::new(
            RegionKind::InterfaceTable,
            self.uuid_table_offset,
            self.uuid_table_size,
        )
    }

    pub fn protection_table(&self) -> Region {
        Region::new(
            RegionKind::ProtectionTable,
            self.protection_table_offset,
            self.protection_table_size,
        )
    }

    /// `None` for values other than the two known release types.
    pub fn release(&self) -> Option<ReleaseType> {
        num_traits::FromPrimitive::from_u32(self.release_type)
    }

    /// The version string up to the first NUL.
    pub fn version_string(&self) -> String {
        let end = self
            .version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.version.len());
        String::from_utf8_lossy(&self.version[..end]).into_owned()
    }
}

/// One entry of the per-processor memory protection table: map
/// `size` bytes at device-virtual `virt_start` onto `phys_start`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "12", bit_numbering = "msb0", endian = "lsb")]
pub struct ProtectionEntry {
    pub virt_start: u32,
    pub phys_start: u32,
    pub size: u32,
}

pub const PROTECTION_ENTRY_SIZE: usize = 12;

/// Size of one message-interface identifier in the UUID table.
pub const INTERFACE_ID_SIZE: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RegionKind {
    Bootloader,
    InterfaceTable,
    ProtectionTable,
}

/// A sub-region of the payload, as described by a header offset/size pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub offset: u32,
    pub size: u32,
}

impl Region {
    pub fn new(kind: RegionKind, offset: u32, size: u32) -> Region {
        Region { kind, offset, size }
    }

    /// One past the last byte, or `None` if `offset + size` overflows.
    pub fn end(&self) -> Option<u32> {
        self.offset.checked_add(self.size)
    }

    /// True if `[offset, offset + size)` lies within a buffer of `len` bytes.
    pub fn fits_in(&self, len: usize) -> bool {
        match self.end() {
            Some(end) => (end as usize) <= len,
            None => false,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.offset as usize..self.offset as usize + self.size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_to_documented_offsets() {
        let mut header = FirmwareHeader {
            magic: IMAGE_MAGIC,
            release_type: ReleaseType::Release as u32,
            image_size: 0x1234,
            bootloader_offset: 0x60,
            uuid_table_offset: 0x80,
            uuid_table_size: 0x20,
            ..Default::default()
        };
        header.version[..5].copy_from_slice(b"1.2.3");
        let bytes = header.pack().unwrap();

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[HEADER_MAGIC], IMAGE_MAGIC.to_le_bytes());
        assert_eq!(bytes[HEADER_RELEASE_TYPE], 1u32.to_le_bytes());
        assert_eq!(bytes[HEADER_IMAGE_SIZE], 0x1234u32.to_le_bytes());
        assert_eq!(bytes[HEADER_BOOTLOADER_OFFSET], 0x60u32.to_le_bytes());
        assert_eq!(bytes[HEADER_UUID_TABLE_OFFSET], 0x80u32.to_le_bytes());
        assert_eq!(bytes[HEADER_UUID_TABLE_SIZE], 0x20u32.to_le_bytes());
        assert_eq!(&bytes[HEADER_VERSION][..6], b"1.2.3\0");

        let back = FirmwareHeader::unpack(&bytes).unwrap();
        assert_eq!(back, header);
        assert_eq!(back.version_string(), "1.2.3");
        assert_eq!(back.release(), Some(ReleaseType::Release));
    }

    #[test]
    fn region_bounds_are_overflow_safe() {
        let r = Region::new(RegionKind::Bootloader, 0x10, 0x10);
        assert!(r.fits_in(0x20));
        assert!(!r.fits_in(0x1f));

        let wrapping = Region::new(RegionKind::InterfaceTable, u32::MAX - 3, 8);
        assert_eq!(wrapping.end(), None);
        assert!(!wrapping.fits_in(usize::MAX));
    }

    #[test]
    fn unknown_release_type() {
        let header = FirmwareHeader {
            release_type: 7,
            ..Default::default()
        };
        assert_eq!(header.release(), None);
    }
}
