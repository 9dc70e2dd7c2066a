// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime configuration.
//!
//! Every value has a default, so an empty TOML document is a valid
//! configuration. Durations are whole milliseconds. Programmatic users can
//! start from [`ConfigBuilder`] instead of a file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Public Interface
// =============================================================================

/// Longest duration any setting may name: one day.
pub const MAX_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    pub firmware: FirmwareConfig,
    pub board: BoardConfig,
    pub memory: MemoryConfig,
    pub boot: BootConfig,
    pub restart: RestartConfig,
    pub events: EventConfig,
}

/// Where firmware images come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct FirmwareConfig {
    /// Image loaded when no other name is requested.
    pub name: String,
    /// Directory searched by the stock firmware source.
    pub directory: PathBuf,
}

/// Board identity passed to the firmware in the parameter block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BoardConfig {
    pub id: u32,
    pub revision: u32,
    pub feature_flags: u32,
}

/// Shared memory layout. Offsets are relative to the start of the region
/// they name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct MemoryConfig {
    /// Host physical address of the DRAM carveout.
    pub dram_base: u64,
    pub dram_size: u32,
    /// Host physical address of on-chip SRAM.
    pub sram_base: u64,
    pub sram_size: u32,
    /// Where DRAM appears in the co-processor's own address space.
    pub device_dram_base: u32,
    /// Where SRAM appears in the co-processor's own address space.
    pub device_sram_base: u32,
    /// DRAM offset the payload is copied to.
    pub image_offset: u32,
    /// SRAM offset of the reset trampoline.
    pub trampoline_offset: u32,
    /// SRAM offset of the boot parameter block.
    pub params_offset: u32,
    /// DRAM offset of the diagnostic header written on a crash.
    pub dump_header_offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BootConfig {
    /// Hand signed images to the authentication service instead of
    /// releasing reset directly.
    pub secure: bool,
    pub power_on_timeout_ms: u64,
    /// How long the device has to report that it booted.
    pub boot_timeout_ms: u64,
    /// Status polling period for power and reset handshakes.
    pub poll_interval_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct RestartConfig {
    pub reset_tries: u32,
    pub reset_ack_timeout_ms: u64,
    /// Escalate to a host fault when a reset is not acknowledged.
    pub panic_on_timeout: bool,
    pub hysteresis_window_ms: u64,
    pub backoff_step_ms: u64,
    pub backoff_max_steps: u32,
    pub dump_timeout_ms: u64,
    pub sink_retries: u32,
    pub sink_retry_delay_ms: u64,
    /// Whether operators may request resets when the runtime starts.
    pub operator_resets: bool,
    /// Zero disables periodic health checks.
    pub health_check_interval_ms: u64,
    /// How long the device has to answer a health check.
    pub liveness_timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct EventConfig {
    /// Capacity of the interrupt event queue.
    pub queue_depth: usize,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        FirmwareConfig {
            name: "aoc.bin".to_string(),
            directory: PathBuf::from("/vendor/firmware"),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            dram_base: 0x9000_0000,
            dram_size: 0x0100_0000,
            sram_base: 0x1900_0000,
            sram_size: 0x0004_0000,
            device_dram_base: 0x9800_0000,
            device_sram_base: 0x0000_0000,
            image_offset: 0,
            trampoline_offset: 0,
            params_offset: 0x0003_f000,
            dump_header_offset: 0x00ff_f000,
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            secure: false,
            power_on_timeout_ms: 5_000,
            boot_timeout_ms: 5_000,
            poll_interval_ms: 10,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        RestartConfig {
            reset_tries: 3,
            reset_ack_timeout_ms: 1_000,
            panic_on_timeout: false,
            hysteresis_window_ms: 10_000,
            backoff_step_ms: 500,
            backoff_max_steps: 5,
            dump_timeout_ms: 1_000,
            sink_retries: 5,
            sink_retry_delay_ms: 500,
            operator_resets: true,
            health_check_interval_ms: 0,
            liveness_timeout_ms: 2_000,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig { queue_depth: 64 }
    }
}

impl Config {
    /// Parse and check a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Config::from_toml_str(&text)
    }

    /// Reject layouts the runtime cannot honour.
    pub fn check(&self) -> Result<(), ConfigError> {
        let m = &self.memory;
        fits(
            "parameter block",
            m.params_offset,
            crate::params::PARAMS_SIZE,
            m.sram_size,
            "SRAM",
        )?;
        fits(
            "diagnostic header",
            m.dump_header_offset,
            crate::crash::DUMP_HEADER_SIZE,
            m.dram_size,
            "DRAM",
        )?;
        if m.image_offset >= m.dram_size {
            return Err(ConfigError::Invalid(format!(
                "image offset {:#x} is outside {:#x} bytes of DRAM",
                m.image_offset, m.dram_size
            )));
        }
        if m.trampoline_offset >= m.sram_size {
            return Err(ConfigError::Invalid(format!(
                "trampoline offset {:#x} is outside {:#x} bytes of SRAM",
                m.trampoline_offset, m.sram_size
            )));
        }
        if self.boot.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll interval must be non-zero".into()));
        }
        if self.restart.reset_tries == 0 {
            return Err(ConfigError::Invalid("at least one reset try is required".into()));
        }
        if self.events.queue_depth == 0 {
            return Err(ConfigError::Invalid("event queue depth must be non-zero".into()));
        }

        let b = &self.boot;
        let r = &self.restart;
        for (what, ms) in [
            ("power-on-timeout-ms", b.power_on_timeout_ms),
            ("boot-timeout-ms", b.boot_timeout_ms),
            ("poll-interval-ms", b.poll_interval_ms),
            ("reset-ack-timeout-ms", r.reset_ack_timeout_ms),
            ("hysteresis-window-ms", r.hysteresis_window_ms),
            ("dump-timeout-ms", r.dump_timeout_ms),
            ("sink-retry-delay-ms", r.sink_retry_delay_ms),
            ("health-check-interval-ms", r.health_check_interval_ms),
            ("liveness-timeout-ms", r.liveness_timeout_ms),
            (
                "backoff-step-ms times backoff-max-steps",
                r.backoff_step_ms
                    .checked_mul(u64::from(r.backoff_max_steps))
                    .unwrap_or(u64::MAX),
            ),
        ] {
            if ms > MAX_DURATION_MS {
                return Err(ConfigError::Invalid(format!(
                    "{what} is {ms}; the limit is {MAX_DURATION_MS}"
                )));
            }
        }
        Ok(())
    }
}

fn fits(what: &str, offset: u32, size: usize, limit: u32, region: &str) -> Result<(), ConfigError> {
    match (offset as usize).checked_add(size) {
        Some(end) if end <= limit as usize => Ok(()),
        _ => Err(ConfigError::Invalid(format!(
            "{what} at {offset:#x} (+{size:#x}) does not fit in {limit:#x} bytes of {region}"
        ))),
    }
}

impl BootConfig {
    pub fn power_on_timeout(&self) -> Duration {
        Duration::from_millis(self.power_on_timeout_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RestartConfig {
    pub fn reset_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_ack_timeout_ms)
    }

    pub fn hysteresis_window(&self) -> Duration {
        Duration::from_millis(self.hysteresis_window_ms)
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }

    pub fn dump_timeout(&self) -> Duration {
        Duration::from_millis(self.dump_timeout_ms)
    }

    pub fn sink_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sink_retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        match self.health_check_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

/// The builder for [`Config`] values.
///
/// All values are optional and fall back to the defaults.
///
/// **Example**
///
/// ```ignore
/// let config = ConfigBuilder::new().secure(true).reset_tries(5).finalize();
/// ```
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Set the default firmware image name
    pub fn firmware<'a>(mut self, name: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.config.firmware.name = name.into().into_owned();
        self
    }

    /// Set the directory searched for firmware images
    pub fn firmware_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.firmware.directory = dir.into();
        self
    }

    /// Set the board id and revision reported to the firmware
    pub fn board(mut self, id: u32, revision: u32) -> Self {
        self.config.board.id = id;
        self.config.board.revision = revision;
        self
    }

    /// Set the DRAM and SRAM sizes
    pub fn memory_sizes(mut self, dram: u32, sram: u32) -> Self {
        self.config.memory.dram_size = dram;
        self.config.memory.sram_size = sram;
        self
    }

    pub fn params_offset(mut self, offset: u32) -> Self {
        self.config.memory.params_offset = offset;
        self
    }

    pub fn dump_header_offset(mut self, offset: u32) -> Self {
        self.config.memory.dump_header_offset = offset;
        self
    }

    pub fn image_offset(mut self, offset: u32) -> Self {
        self.config.memory.image_offset = offset;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.config.boot.secure = secure;
        self
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.config.boot.boot_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn power_on_timeout(mut self, timeout: Duration) -> Self {
        self.config.boot.power_on_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.boot.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn reset_tries(mut self, tries: u32) -> Self {
        self.config.restart.reset_tries = tries;
        self
    }

    pub fn reset_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.restart.reset_ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn panic_on_timeout(mut self, panic: bool) -> Self {
        self.config.restart.panic_on_timeout = panic;
        self
    }

    /// Set the restart hysteresis window, backoff step and step cap
    pub fn hysteresis(mut self, window: Duration, step: Duration, max_steps: u32) -> Self {
        self.config.restart.hysteresis_window_ms = window.as_millis() as u64;
        self.config.restart.backoff_step_ms = step.as_millis() as u64;
        self.config.restart.backoff_max_steps = max_steps;
        self
    }

    pub fn dump_timeout(mut self, timeout: Duration) -> Self {
        self.config.restart.dump_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how often and how long to retry a diagnostic sink that is not ready
    pub fn sink_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.config.restart.sink_retries = retries;
        self.config.restart.sink_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn operator_resets(mut self, enabled: bool) -> Self {
        self.config.restart.operator_resets = enabled;
        self
    }

    /// Enable periodic health checks
    pub fn health_checks(mut self, interval: Duration, liveness_timeout: Duration) -> Self {
        self.config.restart.health_check_interval_ms = interval.as_millis() as u64;
        self.config.restart.liveness_timeout_ms = liveness_timeout.as_millis() as u64;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.events.queue_depth = depth;
        self
    }

    pub fn finalize(self) -> Config {
        self.config
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.restart.reset_tries, 3);
        assert_eq!(config.restart.health_check_interval(), None);
    }

    #[test]
    fn every_field_overrides_its_default() {
        let text = r#"
            [firmware]
            name = "aoc-test.bin"
            directory = "/tmp/fw"

            [board]
            id = 0x2b
            revision = 4
            feature-flags = 0x10

            [memory]
            dram-base = 0x80000000
            dram-size = 0x100000
            sram-base = 0x10000000
            sram-size = 0x10000
            device-dram-base = 0x98000000
            device-sram-base = 0x20000
            image-offset = 0x1000
            trampoline-offset = 0x100
            params-offset = 0xf000
            dump-header-offset = 0xff000

            [boot]
            secure = true
            power-on-timeout-ms = 100
            boot-timeout-ms = 200
            poll-interval-ms = 2

            [restart]
            reset-tries = 5
            reset-ack-timeout-ms = 300
            panic-on-timeout = true
            hysteresis-window-ms = 400
            backoff-step-ms = 50
            backoff-max-steps = 2
            dump-timeout-ms = 60
            sink-retries = 1
            sink-retry-delay-ms = 7
            operator-resets = false
            health-check-interval-ms = 1000
            liveness-timeout-ms = 90

            [events]
            queue-depth = 8
        "#;
        let config = Config::from_toml_str(text).unwrap();

        assert_eq!(config.firmware.name, "aoc-test.bin");
        assert_eq!(config.firmware.directory, PathBuf::from("/tmp/fw"));
        assert_eq!(config.board.id, 0x2b);
        assert_eq!(config.board.revision, 4);
        assert_eq!(config.board.feature_flags, 0x10);
        assert_eq!(config.memory.dram_base, 0x8000_0000);
        assert_eq!(config.memory.dram_size, 0x10_0000);
        assert_eq!(config.memory.sram_base, 0x1000_0000);
        assert_eq!(config.memory.sram_size, 0x1_0000);
        assert_eq!(config.memory.device_dram_base, 0x9800_0000);
        assert_eq!(config.memory.device_sram_base, 0x2_0000);
        assert_eq!(config.memory.image_offset, 0x1000);
        assert_eq!(config.memory.trampoline_offset, 0x100);
        assert_eq!(config.memory.params_offset, 0xf000);
        assert_eq!(config.memory.dump_header_offset, 0xf_f000);
        assert!(config.boot.secure);
        assert_eq!(config.boot.power_on_timeout(), Duration::from_millis(100));
        assert_eq!(config.boot.boot_timeout(), Duration::from_millis(200));
        assert_eq!(config.boot.poll_interval(), Duration::from_millis(2));
        assert_eq!(config.restart.reset_tries, 5);
        assert_eq!(config.restart.reset_ack_timeout(), Duration::from_millis(300));
        assert!(config.restart.panic_on_timeout);
        assert_eq!(config.restart.hysteresis_window(), Duration::from_millis(400));
        assert_eq!(config.restart.backoff_step(), Duration::from_millis(50));
        assert_eq!(config.restart.backoff_max_steps, 2);
        assert_eq!(config.restart.dump_timeout(), Duration::from_millis(60));
        assert_eq!(config.restart.sink_retries, 1);
        assert_eq!(config.restart.sink_retry_delay(), Duration::from_millis(7));
        assert!(!config.restart.operator_resets);
        assert_eq!(
            config.restart.health_check_interval(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(config.restart.liveness_timeout(), Duration::from_millis(90));
        assert_eq!(config.events.queue_depth, 8);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Config::from_toml_str("[boot]\nsecure-boot = true\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[watchdog]\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn layout_must_fit() {
        let err = Config::from_toml_str("[memory]\nsram-size = 0x100\nparams-offset = 0xe0\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let config = ConfigBuilder::new().memory_sizes(0x1000, 0x1000).finalize();
        assert!(config.check().is_err());
    }

    #[test]
    fn durations_are_bounded() {
        assert!(matches!(
            Config::from_toml_str("[boot]\nboot-timeout-ms = 9223372036854775807\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[restart]\nbackoff-step-ms = 86400000\nbackoff-max-steps = 2\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(Config::from_toml_str("[restart]\nliveness-timeout-ms = 86400000\n").is_ok());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aoc.toml");
        std::fs::write(&path, "[restart]\nreset-tries = 7\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().restart.reset_tries, 7);
        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn builder_defaults() {
        assert_eq!(ConfigBuilder::new().finalize(), Config::default());
    }

    #[test]
    fn builder_secure() {
        let config = ConfigBuilder::new().secure(true).finalize();
        assert!(config.boot.secure);
    }

    #[test]
    fn builder_hysteresis() {
        let config = ConfigBuilder::new()
            .hysteresis(Duration::from_secs(2), Duration::from_millis(20), 4)
            .finalize();
        assert_eq!(config.restart.hysteresis_window_ms, 2_000);
        assert_eq!(config.restart.backoff_step_ms, 20);
        assert_eq!(config.restart.backoff_max_steps, 4);
    }

    #[test]
    fn builder_firmware() {
        let config = ConfigBuilder::new()
            .firmware("other.bin")
            .firmware_directory("/srv/fw")
            .finalize();
        assert_eq!(config.firmware.name, "other.bin");
        assert_eq!(config.firmware.directory, PathBuf::from("/srv/fw"));
    }
}
