// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator-facing attributes.
//!
//! A small text interface over the runtime, one value per attribute, as a
//! management daemon or a debug shell would expose it. Writes that need
//! the supervisor (loading firmware, resetting) are queued to it and take
//! effect asynchronously.

use crate::events::Event;
use crate::util::lock;
use crate::Aoc;
use crossbeam_channel::TrySendError;
use log::info;
use std::str::FromStr;
use std::sync::atomic::Ordering;

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum Attribute {
    /// Name of the cached firmware. Write a name to load it.
    Firmware,
    FirmwareVersion,
    /// Write a reason to request a restart.
    Reset,
    State,
    /// Comma-separated names of the online services.
    Services,
    RestartCount,
    CoredumpCount,
    FailedRestartCount,
    FailedLoadCount,
    /// `1` or `0`.
    OperatorResets,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    #[error("no attribute named {0:?}")]
    UnknownAttribute(String),

    #[error("{0} is read-only")]
    ReadOnly(Attribute),

    #[error("{0} is write-only")]
    WriteOnly(Attribute),

    #[error("operator resets are disabled")]
    ResetsDisabled,

    #[error("invalid value {value:?} for {attribute}")]
    InvalidValue { attribute: Attribute, value: String },

    #[error("the supervisor is busy; try again")]
    Busy,
}

fn parse_bool(attribute: Attribute, value: &str) -> Result<bool, ControlError> {
    match value.trim() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err(ControlError::InvalidValue {
            attribute,
            value: value.to_string(),
        }),
    }
}

impl Aoc {
    pub fn read_attribute(&self, name: &str) -> Result<String, ControlError> {
        let attribute = Attribute::from_str(name)
            .map_err(|_| ControlError::UnknownAttribute(name.to_string()))?;
        let counters = self.counters();

        Ok(match attribute {
            Attribute::Firmware => self.firmware().map(|(name, _)| name).unwrap_or_default(),
            Attribute::FirmwareVersion => {
                self.firmware().map(|(_, version)| version).unwrap_or_default()
            }
            Attribute::Reset => return Err(ControlError::WriteOnly(attribute)),
            Attribute::State => self.state().to_string(),
            Attribute::Services => lock(&self.table)
                .services
                .iter()
                .map(|s| s.name().to_string())
                .collect::<Vec<_>>()
                .join(","),
            Attribute::RestartCount => counters.restarts.to_string(),
            Attribute::CoredumpCount => counters.coredumps.to_string(),
            Attribute::FailedRestartCount => counters.failed_restarts.to_string(),
            Attribute::FailedLoadCount => counters.failed_loads.to_string(),
            Attribute::OperatorResets => {
                u8::from(self.operator_resets.load(Ordering::SeqCst)).to_string()
            }
        })
    }

    pub fn write_attribute(&self, name: &str, value: &str) -> Result<(), ControlError> {
        let attribute = Attribute::from_str(name)
            .map_err(|_| ControlError::UnknownAttribute(name.to_string()))?;

        match attribute {
            Attribute::Firmware => {
                let firmware = value.trim();
                if firmware.is_empty() {
                    return Err(ControlError::InvalidValue {
                        attribute,
                        value: value.to_string(),
                    });
                }
                self.request_firmware(firmware)
            }
            Attribute::Reset => self.request_reset(value.trim()),
            Attribute::OperatorResets => {
                self.set_operator_resets(parse_bool(attribute, value)?);
                Ok(())
            }
            _ => Err(ControlError::ReadOnly(attribute)),
        }
    }

    /// Queue a restart on behalf of an operator.
    pub fn request_reset(&self, reason: &str) -> Result<(), ControlError> {
        if !self.operator_resets.load(Ordering::SeqCst) {
            return Err(ControlError::ResetsDisabled);
        }
        let reason = match reason {
            "" => "operator reset".to_string(),
            r => format!("operator reset: {r}"),
        };
        info!("{reason} requested");
        self.queue(Event::Reset(reason))
    }

    /// Queue a firmware load. A running device is restarted into it.
    pub fn request_firmware(&self, name: &str) -> Result<(), ControlError> {
        info!("firmware {name} requested");
        self.queue(Event::Load(name.to_string()))
    }

    pub fn set_operator_resets(&self, enabled: bool) {
        info!("operator resets {}", if enabled { "enabled" } else { "disabled" });
        self.operator_resets.store(enabled, Ordering::SeqCst);
    }

    fn queue(&self, event: Event) -> Result<(), ControlError> {
        self.events_tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) | TrySendError::Disconnected(_) => ControlError::Busy,
        })
    }
}
