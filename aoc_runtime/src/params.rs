// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot parameter block the firmware reads from SRAM before it looks at
//! anything else.

use crate::config::Config;
use crc_any::CRCu32;
use packed_struct::prelude::*;

/// `"AOCP"`, little endian.
pub const PARAMS_MAGIC: u32 = u32::from_le_bytes(*b"AOCP");
pub const PARAMS_VERSION: u32 = 1;
pub const PARAMS_SIZE: usize = 0x40;

// The CRC covers everything before the `crc` field.
const CRC_COVERED: usize = 0x30;

#[derive(Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "0x40", bit_numbering = "msb0", endian = "lsb")]
pub struct ParameterBlock {
    pub magic: u32,
    pub version: u32,
    pub board_id: u32,
    pub board_revision: u32,
    /// Device view of DRAM.
    pub dram_base: u64,
    pub dram_size: u32,
    /// Device view of SRAM.
    pub sram_base: u32,
    pub sram_size: u32,
    pub feature_flags: u32,
    pub random_seed: u64,
    pub crc: u32,
    pub reserved: [u8; 12],
}

impl ParameterBlock {
    pub fn new(config: &Config, random_seed: u64) -> ParameterBlock {
        ParameterBlock {
            magic: PARAMS_MAGIC,
            version: PARAMS_VERSION,
            board_id: config.board.id,
            board_revision: config.board.revision,
            dram_base: config.memory.device_dram_base as u64,
            dram_size: config.memory.dram_size,
            sram_base: config.memory.device_sram_base,
            sram_size: config.memory.sram_size,
            feature_flags: config.board.feature_flags,
            random_seed,
            crc: 0,
            reserved: [0; 12],
        }
    }

    /// Pack with the CRC filled in.
    pub fn to_bytes(&self) -> Result<[u8; PARAMS_SIZE], PackingError> {
        let mut bytes = self.pack()?;
        let crc = crc32(&bytes);
        bytes[CRC_COVERED..CRC_COVERED + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    /// Whether `bytes` hold a block with a matching CRC.
    pub fn crc_ok(bytes: &[u8; PARAMS_SIZE]) -> bool {
        let recorded = u32::from_le_bytes([bytes[0x30], bytes[0x31], bytes[0x32], bytes[0x33]]);
        recorded == crc32(bytes)
    }
}

fn crc32(bytes: &[u8; PARAMS_SIZE]) -> u32 {
    let mut crc = CRCu32::crc32mpeg2();
    crc.digest(&bytes[..CRC_COVERED]);
    crc.get_crc()
}
