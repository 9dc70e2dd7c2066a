// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::auth::{self, AuthGeneration, AUTH_HEADER_SIZE};
use crate::header::{
    FirmwareHeader, ProtectionEntry, Region, ReleaseType, HEADER_SIZE, IMAGE_MAGIC,
    INTERFACE_ID_SIZE, PROTECTION_ENTRY_SIZE,
};
use crate::ImageError;
use log::{debug, trace};
use packed_struct::prelude::*;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A 16-byte message interface identifier from the image's UUID table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(pub [u8; INTERFACE_ID_SIZE]);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&b[0..4]),
            hex::encode(&b[4..6]),
            hex::encode(&b[6..8]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

impl FromStr for InterfaceId {
    type Err = hex::FromHexError;

    /// Accepts 32 hex digits, with or without dashes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.trim().chars().filter(|&c| c != '-').collect();
        let mut id = [0u8; INTERFACE_ID_SIZE];
        hex::decode_to_slice(digits, &mut id)?;
        Ok(InterfaceId(id))
    }
}

/// Decides whether a release image speaks the message interfaces this host
/// was built against.
pub trait InterfaceChecker {
    fn is_compatible(&self, table: &[InterfaceId]) -> bool;
}

impl<F> InterfaceChecker for F
where
    F: Fn(&[InterfaceId]) -> bool,
{
    fn is_compatible(&self, table: &[InterfaceId]) -> bool {
        self(table)
    }
}

/// The stock checker: the image must publish exactly the known set of
/// interfaces, no more and no fewer.
#[derive(Clone, Debug, Default)]
pub struct KnownInterfaces {
    ids: BTreeSet<InterfaceId>,
}

impl KnownInterfaces {
    pub fn new(ids: impl IntoIterator<Item = InterfaceId>) -> KnownInterfaces {
        KnownInterfaces {
            ids: ids.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl InterfaceChecker for KnownInterfaces {
    fn is_compatible(&self, table: &[InterfaceId]) -> bool {
        let published: BTreeSet<InterfaceId> = table.iter().copied().collect();
        if published.len() != table.len() {
            debug!("interface table contains duplicate entries");
            return false;
        }
        for missing in self.ids.difference(&published) {
            debug!("interface {missing} is not published by the image");
        }
        for unknown in published.difference(&self.ids) {
            debug!("interface {unknown} is not known to this host");
        }
        published == self.ids
    }
}

/// A firmware image that passed [`validate`]: an immutable view over the
/// caller's bytes plus the decoded header.
#[derive(Clone, Debug)]
pub struct ValidatedImage<'a> {
    bytes: &'a [u8],
    generation: Option<AuthGeneration>,
    header: FirmwareHeader,
}

impl<'a> ValidatedImage<'a> {
    /// The whole image as supplied, including any authentication header.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Everything after the authentication header (the whole image when
    /// unsigned). This is what gets committed to device DRAM.
    pub fn payload(&self) -> &'a [u8] {
        match self.generation {
            Some(_) => &self.bytes[AUTH_HEADER_SIZE..],
            None => self.bytes,
        }
    }

    pub fn generation(&self) -> Option<AuthGeneration> {
        self.generation
    }

    pub fn header(&self) -> &FirmwareHeader {
        &self.header
    }

    pub fn magic(&self) -> u32 {
        self.header.magic
    }

    pub fn is_release(&self) -> bool {
        self.header.release() == Some(ReleaseType::Release)
    }

    pub fn image_size(&self) -> u32 {
        self.header.image_size
    }

    pub fn version(&self) -> String {
        self.header.version_string()
    }

    pub fn ipc_offset(&self) -> u32 {
        self.header.ipc_offset
    }

    /// The authentication header, or [`ImageError::Unsigned`] when the
    /// image has none. Used when secure authentication is required.
    pub fn require_signed(&self) -> Result<&'a [u8], ImageError> {
        match self.generation {
            Some(_) => Ok(&self.bytes[..AUTH_HEADER_SIZE]),
            None => Err(ImageError::Unsigned),
        }
    }

    /// The reset trampoline copied into on-chip memory on the
    /// unauthenticated boot path.
    pub fn bootloader(&self) -> &'a [u8] {
        &self.payload()[self.header.bootloader().range()]
    }

    pub fn interface_ids(&self) -> Result<Vec<InterfaceId>, ImageError> {
        interface_ids(self.payload(), &self.header)
    }

    /// Decode the memory protection table. The table region is only
    /// required to be well formed when it is actually used.
    pub fn protection_table(&self) -> Result<Vec<ProtectionEntry>, ImageError> {
        let payload = self.payload();
        let region = self.header.protection_table();
        check_region(&region, payload.len())?;
        if region.size as usize % PROTECTION_ENTRY_SIZE != 0 {
            return Err(ImageError::BadProtectionTable(region.size));
        }

        payload[region.range()]
            .chunks_exact(PROTECTION_ENTRY_SIZE)
            .map(|chunk| Ok(ProtectionEntry::unpack_from_slice(chunk)?))
            .collect()
    }

    /// Whether the recorded integrity hash matches the payload. `None` for
    /// unsigned images.
    pub fn digest_matches(&self) -> Option<bool> {
        let generation = self.generation?;
        let recorded = auth::recorded_hash(self.bytes, generation)?;
        Some(recorded == generation.digest(self.payload()))
    }
}

fn check_region(region: &Region, len: usize) -> Result<(), ImageError> {
    if region.fits_in(len) {
        Ok(())
    } else {
        Err(ImageError::RegionOutOfBounds {
            region: region.kind,
            offset: region.offset,
            size: region.size,
            len,
        })
    }
}

fn interface_ids(payload: &[u8], header: &FirmwareHeader) -> Result<Vec<InterfaceId>, ImageError> {
    let region = header.uuid_table();
    check_region(&region, payload.len())?;
    if region.size as usize % INTERFACE_ID_SIZE != 0 {
        return Err(ImageError::BadInterfaceTable(format!(
            "table size {:#x} is not a multiple of {INTERFACE_ID_SIZE}",
            region.size
        )));
    }

    Ok(payload[region.range()]
        .chunks_exact(INTERFACE_ID_SIZE)
        .map(|chunk| {
            let mut id = [0u8; INTERFACE_ID_SIZE];
            id.copy_from_slice(chunk);
            InterfaceId(id)
        })
        .collect())
}

/// Check that `image` is safe to load.
///
/// Succeeds iff the magic matches, the bootloader and UUID table regions lie
/// within the payload, and (for release images) `checker` accepts the UUID
/// table. Pure: nothing outside the returned value is touched.
pub fn validate<'a>(
    image: &'a [u8],
    checker: &dyn InterfaceChecker,
) -> Result<ValidatedImage<'a>, ImageError> {
    let generation = auth::classify(image);
    let payload = match generation {
        Some(_) => &image[AUTH_HEADER_SIZE..],
        None => image,
    };
    trace!(
        "image: {} bytes, authentication header: {}",
        image.len(),
        generation.map_or("none".to_string(), |g| g.to_string())
    );

    if payload.len() < HEADER_SIZE {
        return Err(ImageError::Truncated {
            len: payload.len(),
            needed: HEADER_SIZE,
        });
    }
    let header = FirmwareHeader::unpack_from_slice(&payload[..HEADER_SIZE])?;

    if header.magic != IMAGE_MAGIC {
        return Err(ImageError::BadMagic {
            expected: IMAGE_MAGIC,
            got: header.magic,
        });
    }

    check_region(&header.bootloader(), payload.len())?;
    check_region(&header.uuid_table(), payload.len())?;

    let image = ValidatedImage {
        bytes: image,
        generation,
        header,
    };

    if image.is_release() {
        let ids = interface_ids(payload, &image.header)?;
        if !checker.is_compatible(&ids) {
            return Err(ImageError::BadInterfaceTable(format!(
                "{} published interfaces do not match this host",
                ids.len()
            )));
        }
        debug!("release image interface table is compatible");
    }

    if image.image_size() as usize != payload.len() {
        debug!(
            "header image size {:#x} differs from payload length {:#x}",
            image.image_size(),
            payload.len()
        );
    }

    Ok(image)
}
