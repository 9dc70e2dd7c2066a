// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authentication header detection.
//!
//! A signed image is prefixed with a fixed 4 KiB header consumed by the
//! secure authentication collaborator. The host never checks the signature
//! itself; it only needs to know whether the header is present (and so where
//! the payload starts) and which generation it is.
//!
//! Both generations put their descriptor at [`DESCRIPTOR_OFFSET`], right
//! after the opaque signature block. Generation 1 carries a SHA-256 of the
//! payload, generation 2 a SHA-512, so the magic/generation pair lands at a
//! different offset for each.

use log::{trace, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use packed_struct::prelude::*;
use sha2::{Digest as _, Sha256, Sha512};

/// Size of the authentication header prepended to signed images.
pub const AUTH_HEADER_SIZE: usize = 0x1000;

/// `"AOCA"`, little endian.
pub const AUTH_MAGIC: u32 = u32::from_le_bytes(*b"AOCA");

/// Start of the generation-specific descriptor.
pub const DESCRIPTOR_OFFSET: usize = 0x200;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive, strum_macros::Display)]
pub enum AuthGeneration {
    #[strum(serialize = "gen1")]
    Gen1 = 1,
    #[strum(serialize = "gen2")]
    Gen2 = 2,
}

impl AuthGeneration {
    /// Size of the integrity hash carried by this generation.
    pub fn hash_len(self) -> usize {
        match self {
            AuthGeneration::Gen1 => 32,
            AuthGeneration::Gen2 => 64,
        }
    }

    /// Digest of `payload` in the form this generation records it.
    pub fn digest(self, payload: &[u8]) -> Vec<u8> {
        match self {
            AuthGeneration::Gen1 => Sha256::digest(payload).to_vec(),
            AuthGeneration::Gen2 => Sha512::digest(payload).to_vec(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "48", bit_numbering = "msb0", endian = "lsb")]
pub struct DescriptorV1 {
    pub hash: [u8; 32],
    pub magic: u32,
    pub generation: u32,
    pub rollback: u32,
    pub reserved: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "80", bit_numbering = "msb0", endian = "lsb")]
pub struct DescriptorV2 {
    pub hash_lo: [u8; 32],
    pub hash_hi: [u8; 32],
    pub magic: u32,
    pub generation: u32,
    pub rollback: u32,
    pub reserved: u32,
}

fn descriptor_bytes<const N: usize>(image: &[u8]) -> Option<&[u8; N]> {
    image
        .get(DESCRIPTOR_OFFSET..DESCRIPTOR_OFFSET + N)
        .and_then(|s| s.try_into().ok())
}

fn v1(image: &[u8]) -> Option<DescriptorV1> {
    DescriptorV1::unpack(descriptor_bytes::<48>(image)?).ok()
}

fn v2(image: &[u8]) -> Option<DescriptorV2> {
    DescriptorV2::unpack(descriptor_bytes::<80>(image)?).ok()
}

/// Classify the authentication header of `image`.
///
/// Each generation is checked on its own; the result does not depend on
/// the order of the checks. An image where both layouts match is
/// ambiguous and is treated as unsigned.
pub fn classify(image: &[u8]) -> Option<AuthGeneration> {
    if image.len() < AUTH_HEADER_SIZE {
        return None;
    }

    let gen1 = v1(image)
        .map(|d| d.magic == AUTH_MAGIC && d.generation == AuthGeneration::Gen1 as u32)
        .unwrap_or(false);
    let gen2 = v2(image)
        .map(|d| d.magic == AUTH_MAGIC && d.generation == AuthGeneration::Gen2 as u32)
        .unwrap_or(false);

    match (gen1, gen2) {
        (true, false) => Some(AuthGeneration::Gen1),
        (false, true) => Some(AuthGeneration::Gen2),
        (true, true) => {
            warn!("authentication header matches both generations; treating image as unsigned");
            None
        }
        (false, false) => {
            trace!("no authentication header found");
            None
        }
    }
}

/// The integrity hash recorded in a header of the given generation.
pub fn recorded_hash(image: &[u8], generation: AuthGeneration) -> Option<Vec<u8>> {
    match generation {
        AuthGeneration::Gen1 => v1(image).map(|d| d.hash.to_vec()),
        AuthGeneration::Gen2 => v2(image).map(|d| {
            let mut hash = d.hash_lo.to_vec();
            hash.extend_from_slice(&d.hash_hi);
            hash
        }),
    }
}

/// Build a 4 KiB authentication header for `payload`. The signature block
/// is left zeroed; it is filled in by the signing service.
pub fn make_header(
    generation: AuthGeneration,
    payload: &[u8],
    rollback: u32,
) -> Result<Vec<u8>, packed_struct::PackingError> {
    let digest = generation.digest(payload);
    let mut header = vec![0u8; AUTH_HEADER_SIZE];

    match generation {
        AuthGeneration::Gen1 => {
            let mut d = DescriptorV1 {
                magic: AUTH_MAGIC,
                generation: generation as u32,
                rollback,
                ..Default::default()
            };
            d.hash.copy_from_slice(&digest);
            header[DESCRIPTOR_OFFSET..][..48].copy_from_slice(&d.pack()?);
        }
        AuthGeneration::Gen2 => {
            let mut d = DescriptorV2 {
                magic: AUTH_MAGIC,
                generation: generation as u32,
                rollback,
                ..Default::default()
            };
            d.hash_lo.copy_from_slice(&digest[..32]);
            d.hash_hi.copy_from_slice(&digest[32..]);
            header[DESCRIPTOR_OFFSET..][..80].copy_from_slice(&d.pack()?);
        }
    }

    Ok(header)
}
