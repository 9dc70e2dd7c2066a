// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::auth::{self, AuthGeneration};
use crate::header::{FirmwareHeader, ProtectionEntry, ReleaseType, HEADER_SIZE, IMAGE_MAGIC};
use crate::validate::InterfaceId;
use crate::ImageError;
use packed_struct::prelude::*;

/// Assembles a firmware image: header, bootloader stub, UUID table,
/// protection table and body, each section 4-byte aligned, optionally
/// prefixed with an authentication header.
#[derive(Clone, Debug, Default)]
pub struct ImageBuilder {
    release: bool,
    container_version: u32,
    firmware_version: u32,
    version: String,
    bootloader: Vec<u8>,
    interfaces: Vec<InterfaceId>,
    protection: Vec<ProtectionEntry>,
    body: Vec<u8>,
    ipc_offset: Option<u32>,
    sign: Option<AuthGeneration>,
    rollback: u32,
}

// Pad to a 4-byte boundary.
fn pad(val: usize) -> usize {
    match val.checked_rem(4) {
        Some(s) if s > 0 => 4 - s,
        _ => 0,
    }
}

fn to_u32(val: usize, what: &'static str) -> Result<u32, ImageError> {
    val.try_into().map_err(|_| ImageError::FieldOverflow(what))
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder {
            container_version: 1,
            ..Default::default()
        }
    }

    pub fn release(mut self, release: bool) -> Self {
        self.release = release;
        self
    }

    pub fn container_version(mut self, version: u32) -> Self {
        self.container_version = version;
        self
    }

    pub fn firmware_version(mut self, version: u32) -> Self {
        self.firmware_version = version;
        self
    }

    /// Human-readable version; truncated to the 32-byte header field.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn bootloader(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.bootloader = bytes.into();
        self
    }

    pub fn interfaces(mut self, ids: impl IntoIterator<Item = InterfaceId>) -> Self {
        self.interfaces = ids.into_iter().collect();
        self
    }

    pub fn protection(mut self, entries: impl IntoIterator<Item = ProtectionEntry>) -> Self {
        self.protection = entries.into_iter().collect();
        self
    }

    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = bytes.into();
        self
    }

    /// Offset of the IPC control block within the payload. Defaults to the
    /// start of the body.
    pub fn ipc_offset(mut self, offset: u32) -> Self {
        self.ipc_offset = Some(offset);
        self
    }

    pub fn sign(mut self, generation: AuthGeneration) -> Self {
        self.sign = Some(generation);
        self
    }

    pub fn rollback(mut self, rollback: u32) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn build(&self) -> Result<Vec<u8>, ImageError> {
        let mut payload = vec![0u8; HEADER_SIZE];

        let bootloader_offset = payload.len();
        payload.extend_from_slice(&self.bootloader);
        payload.resize(payload.len() + pad(payload.len()), 0);

        let uuid_table_offset = payload.len();
        for id in &self.interfaces {
            payload.extend_from_slice(&id.0);
        }
        let uuid_table_size = payload.len() - uuid_table_offset;

        let protection_table_offset = payload.len();
        for entry in &self.protection {
            payload.extend_from_slice(&entry.pack()?);
        }
        let protection_table_size = payload.len() - protection_table_offset;
        payload.resize(payload.len() + pad(payload.len()), 0);

        let body_offset = payload.len();
        payload.extend_from_slice(&self.body);
        payload.resize(payload.len() + pad(payload.len()), 0);

        let mut version = [0u8; 32];
        let len = self.version.len().min(version.len());
        version[..len].copy_from_slice(&self.version.as_bytes()[..len]);

        let header = FirmwareHeader {
            magic: IMAGE_MAGIC,
            release_type: if self.release {
                ReleaseType::Release as u32
            } else {
                ReleaseType::Development as u32
            },
            container_version: self.container_version,
            firmware_version: self.firmware_version,
            image_size: to_u32(payload.len(), "image size")?,
            bootloader_offset: to_u32(bootloader_offset, "bootloader offset")?,
            bootloader_size: to_u32(self.bootloader.len(), "bootloader size")?,
            uuid_table_offset: to_u32(uuid_table_offset, "uuid table offset")?,
            uuid_table_size: to_u32(uuid_table_size, "uuid table size")?,
            protection_table_offset: to_u32(protection_table_offset, "protection table offset")?,
            protection_table_size: to_u32(protection_table_size, "protection table size")?,
            ipc_offset: match self.ipc_offset {
                Some(offset) => offset,
                None => to_u32(body_offset, "ipc offset")?,
            },
            version,
            reserved: [0; 16],
        };
        payload[..HEADER_SIZE].copy_from_slice(&header.pack()?);

        match self.sign {
            Some(generation) => {
                let mut image = auth::make_header(generation, &payload, self.rollback)?;
                image.extend_from_slice(&payload);
                Ok(image)
            }
            None => Ok(payload),
        }
    }
}
