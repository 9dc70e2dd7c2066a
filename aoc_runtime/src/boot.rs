// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bringing the co-processor from power-off to running firmware, and
//! putting it back into reset.
//!
//! A boot powers the device up, validates the image, hands it to the
//! authentication service (secure) or programs the protection unit and
//! copies the trampoline (non-secure), copies the payload into DRAM, writes
//! the parameter block and releases the device. Completion is reported
//! asynchronously by the device's liveness signal; the boot timer covers
//! the case where that never comes.
//!
//! Any failure releases the power request and leaves the device Offline.
//! Partial writes to shared memory are not rolled back.

use crate::crash::Counters;
use crate::lifecycle::{LifecycleError, LifecycleState};
use crate::memory::MemoryError;
use crate::params::ParameterBlock;
use crate::platform::{AuthError, PlatformError};
use crate::util::{lock, poll_until};
use crate::watchdog::TimerPurpose;
use crate::{Aoc, LoadedFirmware};
use aoc_image::{validate, ImageError};
use log::{debug, error, info, warn};
use retry::{delay::NoDelay, retry, OperationResult};
use std::sync::Arc;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum BootError {
    #[error("cannot boot while {0}")]
    NotOffline(LifecycleState),

    #[error("another boot is in progress")]
    Busy,

    #[error("co-processor did not power on within {0} ms")]
    PowerOnTimeout(u64),

    #[error("invalid firmware image: {0}")]
    Image(#[from] ImageError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("could not build parameter block: {0}")]
    Params(#[from] packed_struct::PackingError),

    #[error("IPC control block offset {0:#x} is outside DRAM")]
    BadIpcOffset(u64),

    #[error("reset not acknowledged after {tries} tries")]
    ResetTimeout { tries: u32 },

    #[error("reset timeout escalated to a host fault")]
    Escalated,

    #[error("could not fetch firmware {name:?}: {source}")]
    Fetch {
        name: String,
        source: std::io::Error,
    },
}

/// The right to run a boot, held from the Offline check to the end of the
/// boot. Released on drop.
struct BootClaim<'a>(&'a Aoc);

impl Drop for BootClaim<'_> {
    fn drop(&mut self) {
        lock(&self.0.table).booting = false;
    }
}

impl Aoc {
    /// Fetch `name` from the firmware source and boot it.
    pub fn load_firmware(&self, name: &str) -> Result<(), BootError> {
        let bytes = self.source.fetch(name).map_err(|source| {
            Counters::bump(&self.counters.failed_loads);
            BootError::Fetch {
                name: name.to_string(),
                source,
            }
        })?;
        self.boot(name, bytes)
    }

    /// Boot `image`. The device must be Offline and no other boot may be
    /// running.
    ///
    /// On success the device is in `FirmwareLoaded` and the boot timer is
    /// armed; it moves on once the device reports that it has booted.
    pub fn boot(&self, name: &str, image: impl Into<Arc<[u8]>>) -> Result<(), BootError> {
        let image = image.into();
        let _claim = self.claim_boot()?;

        info!("booting AoC firmware {name} ({} bytes)", image.len());
        let mut loaded = false;
        let result = self
            .power_on()
            .and_then(|()| self.load_and_start(name, &image, &mut loaded));
        if let Err(e) = &result {
            error!("boot of {name} failed: {e}");
            self.abort_boot(loaded);
        }
        result
    }

    fn claim_boot(&self) -> Result<BootClaim<'_>, BootError> {
        let mut table = lock(&self.table);
        if table.state != LifecycleState::Offline {
            return Err(BootError::NotOffline(table.state));
        }
        if table.booting {
            return Err(BootError::Busy);
        }
        table.booting = true;
        Ok(BootClaim(self))
    }

    /// Boot whatever firmware was booted last.
    pub(crate) fn reboot_cached(&self) -> Result<bool, BootError> {
        let cached = lock(&self.firmware).clone();
        match cached {
            Some(fw) => self.boot(&fw.name, fw.bytes).map(|()| true),
            None => {
                info!("no firmware cached; staying offline");
                Ok(false)
            }
        }
    }

    fn power_on(&self) -> Result<(), BootError> {
        self.platform.request_power_on()?;
        let boot = &self.config.boot;
        if !poll_until(boot.power_on_timeout(), boot.poll_interval(), || {
            self.platform.is_powered()
        }) {
            return Err(BootError::PowerOnTimeout(boot.power_on_timeout_ms));
        }
        debug!("power domain is up");
        Ok(())
    }

    /// Sets `loaded` once this boot has moved the device to
    /// `FirmwareLoaded`.
    fn load_and_start(&self, name: &str, bytes: &Arc<[u8]>, loaded: &mut bool) -> Result<(), BootError> {
        let image = validate(bytes, self.interfaces.as_ref())?;
        info!(
            "firmware {name}: version {:?}, {} build, {}",
            image.version(),
            if image.is_release() { "release" } else { "development" },
            image
                .generation()
                .map_or("unsigned".to_string(), |g| format!("signed ({g})"))
        );
        *lock(&self.firmware) = Some(LoadedFirmware {
            name: name.to_string(),
            bytes: bytes.clone(),
            version: image.version(),
        });

        let memory = &self.config.memory;
        let authenticator = self.authenticator.as_ref().filter(|_| self.config.boot.secure);

        match authenticator {
            Some(auth) => {
                let scratch = image.require_signed()?.to_vec();
                auth.authenticate(&scratch)?;
                debug!("authentication header accepted");
            }
            None => {
                let entries = image.protection_table()?;
                self.platform.program_protection(&entries)?;
                self.memory
                    .sram()
                    .write(memory.trampoline_offset as usize, image.bootloader())?;
                debug!(
                    "{} protection entries, {}-byte trampoline",
                    entries.len(),
                    image.bootloader().len()
                );
            }
        }

        self.memory
            .dram()
            .write(memory.image_offset as usize, image.payload())?;

        let params = ParameterBlock::new(&self.config, rand::random());
        self.memory
            .sram()
            .write(memory.params_offset as usize, &params.to_bytes()?)?;

        let ipc_base = memory.image_offset as u64 + image.ipc_offset() as u64;
        if ipc_base >= memory.dram_size as u64 {
            return Err(BootError::BadIpcOffset(ipc_base));
        }

        {
            let mut table = lock(&self.table);
            table.transition(LifecycleState::FirmwareLoaded, &self.state)?;
            table.ipc_base = Some(ipc_base as usize);
            *loaded = true;
        }
        self.platform.set_fault_interrupts(true);
        match authenticator {
            Some(auth) => auth.start()?,
            None => self.platform.release_reset()?,
        }

        match Instant::now().checked_add(self.config.boot.boot_timeout()) {
            Some(deadline) => self.arm_timer(TimerPurpose::Boot, deadline),
            None => warn!("boot timeout out of range; boot timer not armed"),
        }
        Ok(())
    }

    /// Undo a failed boot. Only a `FirmwareLoaded` this boot entered is
    /// rolled back.
    fn abort_boot(&self, loaded: bool) {
        if loaded {
            let mut table = lock(&self.table);
            if table.state == LifecycleState::FirmwareLoaded {
                if let Err(e) = table.transition(LifecycleState::Offline, &self.state) {
                    error!("{e}");
                }
                table.ipc_base = None;
            }
        }
        self.disarm_timers();
        self.mask_faults();
        self.platform.release_power();
        Counters::bump(&self.counters.failed_loads);
    }

    /// Put the device into reset, retrying unacknowledged requests.
    pub(crate) fn reset_device(&self) -> Result<(), BootError> {
        let restart = &self.config.restart;
        let tries = restart.reset_tries.max(1);
        let mut attempt = 0;

        let result = retry(NoDelay.take(tries as usize - 1), || {
            attempt += 1;
            match self.reset_attempt() {
                Ok(()) => OperationResult::Ok(()),
                Err(BootError::ResetTimeout { .. }) if restart.panic_on_timeout => {
                    error!("reset attempt {attempt} not acknowledged; escalating");
                    self.host_fault.escalate("AoC did not acknowledge reset");
                    OperationResult::Err(BootError::Escalated)
                }
                Err(e) => {
                    warn!("reset attempt {attempt}/{tries} failed: {e}");
                    OperationResult::Retry(e)
                }
            }
        });

        match result {
            Ok(()) => {
                info!("AoC is in reset");
                Ok(())
            }
            Err(retry::Error::Operation {
                error: BootError::ResetTimeout { .. },
                ..
            }) => Err(BootError::ResetTimeout { tries }),
            Err(retry::Error::Operation { error, .. }) => Err(error),
            Err(retry::Error::Internal(msg)) => Err(BootError::Platform(PlatformError::Failed(msg))),
        }
    }

    fn reset_attempt(&self) -> Result<(), BootError> {
        if self.config.boot.secure {
            if let Some(auth) = &self.authenticator {
                auth.shutdown()?;
            }
        }
        self.platform.request_reset()?;

        let restart = &self.config.restart;
        if poll_until(
            restart.reset_ack_timeout(),
            self.config.boot.poll_interval(),
            || self.platform.reset_acknowledged(),
        ) {
            Ok(())
        } else {
            Err(BootError::ResetTimeout { tries: 1 })
        }
    }
}
