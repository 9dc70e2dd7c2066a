// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware image layout for the always-on co-processor (AoC).
//!
//! An image is an optional 4 KiB authentication header followed by the
//! payload. The payload starts with a fixed [`FirmwareHeader`] that locates
//! the bootloader stub, the message-interface UUID table, the memory
//! protection table and the IPC control block.
//!
//! [`validate`] checks an image before anything is written to device memory;
//! [`ImageBuilder`] produces images for tooling and tests.

pub mod auth;
pub mod build;
pub mod header;
pub mod validate;

pub use auth::{classify, AuthGeneration};
pub use build::ImageBuilder;
pub use header::{FirmwareHeader, ProtectionEntry, Region, RegionKind, ReleaseType};
pub use validate::{validate, InterfaceChecker, InterfaceId, KnownInterfaces, ValidatedImage};

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("image payload is {len} bytes, too small for a {needed}-byte header")]
    Truncated { len: usize, needed: usize },

    #[error("bad image magic: expected {expected:#010x}, got {got:#010x}")]
    BadMagic { expected: u32, got: u32 },

    #[error(
        "{region} region at {offset:#x} (+{size:#x}) does not fit \
         in the {len:#x}-byte payload"
    )]
    RegionOutOfBounds {
        region: RegionKind,
        offset: u32,
        size: u32,
        len: usize,
    },

    #[error("message interface table rejected: {0}")]
    BadInterfaceTable(String),

    #[error("protection table is {0} bytes, not a whole number of entries")]
    BadProtectionTable(u32),

    #[error("image carries no authentication header")]
    Unsigned,

    #[error("struct packing error: {0}")]
    PackingError(#[from] packed_struct::PackingError),

    #[error("could not fit {0} in a `u32` image field")]
    FieldOverflow(&'static str),
}
