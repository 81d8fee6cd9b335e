//! Configuration management for dsme
//!
//! Loads, validates, and documents defaults for the daemon configuration:
//! the runtime feature-flag record described in the design notes, the named
//! timer durations, filesystem paths, D-Bus naming, and logging options.

use crate::error::{DsmeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Runtime equivalents of the original compile-time feature flags
    pub runtime: RuntimeOptions,

    /// Named timer durations
    pub timers: TimerDurations,

    /// Filesystem paths the engine's collaborators read/write
    pub paths: PathsConfig,

    /// D-Bus bus naming
    pub dbus: DbusConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Group membership that counts as privileged, besides root
    pub privileged_group: String,

    /// R&D mode suppresses automatic entry into MALF during bootstrap
    pub rnd_mode: bool,
}

/// Runtime equivalents of `DSME_SUPPORT_DIRECT_USER_ACTDEAD`,
/// `DSME_VIBRA_FEEDBACK`, and `DSME_USEWHEEL`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Use direct ACTDEAD<->USER timer-based transitions instead of
    /// routing the request through a reboot.
    pub direct_transitions: bool,

    /// Carried for parity with the original build; no in-scope behavior
    /// reads it, since vibration feedback is a hardware side-effect
    /// outside the state-selection engine.
    pub vibra_feedback: bool,

    /// Carried for parity with the original build; this handset class has
    /// no physical lock-switch wheel group to special-case.
    pub wheel_group_privileged: bool,
}

/// Named timer durations, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerDurations {
    pub shutdown_delay_secs: u64,
    pub user_timer_min_secs: u64,
    pub user_timer_max_secs: u64,
    pub actdead_timer_min_secs: u64,
    pub actdead_timer_max_secs: u64,
    pub thermal_shutdown_secs: u64,
    pub battery_empty_shutdown_secs: u64,
    pub charger_discovery_secs: u64,
    pub charger_disconnect_secs: u64,
}

/// Filesystem paths used by the Transition Controller's collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `reboot-to-<target>-<charger>.param` files
    pub reboot_param_source_dir: String,

    /// Path `reboot-param` contents are written to before a reboot
    pub reboot_param_sink: String,

    /// Block device probed to decide whether the home partition is
    /// LUKS-encrypted
    pub home_device: String,
}

/// D-Bus bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbusConfig {
    /// Well-known bus name requested for `com.nokia.dsme.request`
    pub well_known_name: String,

    /// Prefer the session bus (used in tests); production always prefers
    /// the system bus first and falls back to session only if configured.
    pub prefer_session_bus: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Path to log file (directory is derived if this has no extension)
    pub file: String,

    /// Number of rotated backup files to keep
    pub backup_count: u32,

    /// Whether to also log to console when file logging is active
    #[serde(default = "default_true")]
    pub console_output: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            direct_transitions: false,
            vibra_feedback: true,
            wheel_group_privileged: false,
        }
    }
}

impl Default for TimerDurations {
    fn default() -> Self {
        Self {
            shutdown_delay_secs: 2,
            user_timer_min_secs: 2,
            user_timer_max_secs: 45,
            actdead_timer_min_secs: 2,
            actdead_timer_max_secs: 45,
            thermal_shutdown_secs: 8,
            battery_empty_shutdown_secs: 8,
            charger_discovery_secs: 5,
            charger_disconnect_secs: 15,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            reboot_param_source_dir: "/etc/dsme".to_string(),
            reboot_param_sink: "/run/systemd/reboot-param".to_string(),
            home_device: "/dev/sailfish/home".to_string(),
        }
    }
}

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            well_known_name: "com.nokia.dsme".to_string(),
            prefer_session_bus: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/var/log/dsme/dsme.log".to_string(),
            backup_count: 5,
            console_output: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeOptions::default(),
            timers: TimerDurations::default(),
            paths: PathsConfig::default(),
            dbus: DbusConfig::default(),
            logging: LoggingConfig::default(),
            privileged_group: "privileged".to_string(),
            rnd_mode: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration, preferring an explicit path, then the default
    /// filesystem locations, falling back to documented defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        let default_paths = ["/etc/dsme/dsme.yaml", "/etc/dsme/config.yaml"];
        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dbus.well_known_name.is_empty() {
            return Err(DsmeError::config("dbus.well_known_name cannot be empty"));
        }

        if self.privileged_group.is_empty() {
            return Err(DsmeError::config("privileged_group cannot be empty"));
        }

        let t = &self.timers;
        let durations = [
            ("timers.shutdown_delay_secs", t.shutdown_delay_secs),
            ("timers.user_timer_min_secs", t.user_timer_min_secs),
            ("timers.user_timer_max_secs", t.user_timer_max_secs),
            ("timers.actdead_timer_min_secs", t.actdead_timer_min_secs),
            ("timers.actdead_timer_max_secs", t.actdead_timer_max_secs),
            ("timers.thermal_shutdown_secs", t.thermal_shutdown_secs),
            (
                "timers.battery_empty_shutdown_secs",
                t.battery_empty_shutdown_secs,
            ),
            ("timers.charger_discovery_secs", t.charger_discovery_secs),
            ("timers.charger_disconnect_secs", t.charger_disconnect_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(DsmeError::config(format!("{name} must be greater than 0")));
            }
        }

        Ok(())
    }
}
