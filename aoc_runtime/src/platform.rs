// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collaborators the runtime drives but does not implement: the SoC
//! platform (power, reset, protection unit, doorbells), the secure
//! authentication service, the diagnostic pipeline and the host's own
//! fault path.

use crate::crash::CrashRecord;
use crate::service::Direction;
use aoc_image::ProtectionEntry;
use log::info;

#[derive(thiserror::Error, Debug)]
pub enum PlatformError {
    #[error("{0} is not supported by this platform")]
    Unsupported(&'static str),

    #[error("platform operation failed: {0}")]
    Failed(String),
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    /// The service looked at the header and refused it.
    #[error("authentication rejected the image: {0}")]
    Rejected(String),

    #[error("authentication service unavailable")]
    Unavailable,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SinkError {
    /// The pipeline is not up yet; the submission may be retried.
    #[error("diagnostic sink not ready")]
    NotReady,

    #[error("diagnostic sink failed: {0}")]
    Failed(String),
}

/// Power, reset and signalling for one co-processor.
pub trait Platform: Send + Sync {
    /// Ask for the co-processor power domain. Completion is observed
    /// through [`Platform::is_powered`].
    fn request_power_on(&self) -> Result<(), PlatformError>;

    /// Drop the power request made by [`Platform::request_power_on`].
    fn release_power(&self);

    fn is_powered(&self) -> bool;

    /// Program the memory protection unit from the image's table.
    fn program_protection(&self, entries: &[ProtectionEntry]) -> Result<(), PlatformError>;

    /// Let the co-processor run from the trampoline.
    fn release_reset(&self) -> Result<(), PlatformError>;

    /// Ask the co-processor to enter reset. Completion is observed through
    /// [`Platform::reset_acknowledged`].
    fn request_reset(&self) -> Result<(), PlatformError>;

    fn reset_acknowledged(&self) -> bool;

    /// Ask the co-processor to write its diagnostic header.
    fn request_dump(&self);

    fn set_fault_interrupts(&self, enabled: bool);

    /// Ring the doorbell of service `index` for `direction`.
    fn signal_device(&self, index: usize, direction: Direction);

    /// Ask the co-processor for a heartbeat.
    fn ping(&self) {}
}

/// The secure authentication service used when images are signed.
pub trait Authenticator: Send + Sync {
    /// Check the 4 KiB authentication header of the image just loaded.
    fn authenticate(&self, header: &[u8]) -> Result<(), AuthError>;

    /// Start the authenticated image.
    fn start(&self) -> Result<(), AuthError>;

    /// Stop a running authenticated image ahead of a reset.
    fn shutdown(&self) -> Result<(), AuthError>;
}

/// Receives crash records for upload.
pub trait DiagnosticSink: Send + Sync {
    fn submit(&self, record: &CrashRecord) -> Result<(), SinkError>;
}

/// The host's own fault path.
pub trait HostFault: Send + Sync {
    fn escalate(&self, reason: &str);
}

/// Stock [`HostFault`]: take the host down with the co-processor.
#[derive(Debug, Default)]
pub struct PanicOnFault;

impl HostFault for PanicOnFault {
    fn escalate(&self, reason: &str) {
        panic!("AoC fault escalated to host: {reason}");
    }
}

/// Stock [`DiagnosticSink`]: log the record and drop the memory snapshot.
#[derive(Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn submit(&self, record: &CrashRecord) -> Result<(), SinkError> {
        info!(
            "crash record: {} (breadcrumbs {:#010x} {:#010x}, {} segments, {} bytes)",
            record.reason,
            record.breadcrumbs[0],
            record.breadcrumbs[1],
            record.segments.len(),
            record.total_size()
        );
        Ok(())
    }
}
