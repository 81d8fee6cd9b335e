//! The device state enum, runlevel mapping, charger tri-state, and the
//! Input Model: the single process-owned record of every asynchronous
//! input bit the Policy Evaluator reads.

use crate::logging::StructuredLogger;
use serde::{Deserialize, Serialize};

/// Top-level device state the engine tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    NotSet,
    Boot,
    User,
    Actdead,
    Shutdown,
    Reboot,
    Test,
    Malf,
    Local,
}

/// Fixed integer runlevel codes exposed on the wire to the init system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Runlevel {
    Shutdown = 0,
    Malf = 2,
    Test = 3,
    Actdead = 4,
    User = 5,
    Reboot = 6,
}

impl Runlevel {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl DeviceState {
    /// Map a device state to the runlevel code broadcast to the init
    /// system. Total: unknown/`NotSet`/`Boot` map to `Shutdown`.
    ///
    /// `Local` falls through to `Actdead` here rather than getting its own
    /// `Runlevel` value: the original source's `state2runlevel` switch gives
    /// `LOCAL` and `TEST` the same case label (numeric code 3) with no
    /// `break` before the `Actdead` handling, so `LOCAL` observably maps to
    /// runlevel 4, not 3. Reproduced literally per the preserved design
    /// decision rather than "fixed", since it is unclear whether fielded
    /// devices depend on it.
    pub fn to_runlevel(self) -> Runlevel {
        match self {
            DeviceState::Shutdown => Runlevel::Shutdown,
            DeviceState::Malf => Runlevel::Malf,
            DeviceState::Test => Runlevel::Test,
            DeviceState::Local => Runlevel::Actdead,
            DeviceState::Actdead => Runlevel::Actdead,
            DeviceState::User => Runlevel::User,
            DeviceState::Reboot => Runlevel::Reboot,
            DeviceState::NotSet | DeviceState::Boot => Runlevel::Shutdown,
        }
    }
}

/// Charger connection tri-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerState {
    Unknown,
    Connected,
    Disconnected,
}

/// Battery level: a reported percentage, or `Unknown` before the first
/// `SET_BATTERY_LEVEL` message arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryLevel {
    Unknown,
    Percent(u8),
}

impl BatteryLevel {
    /// `Unknown` and any level below the minimum both block ACTDEAD->USER
    /// promotion.
    pub fn below_minimum_to_user(self, minimum: u8) -> bool {
        match self {
            BatteryLevel::Unknown => true,
            BatteryLevel::Percent(p) => p < minimum,
        }
    }
}

/// The process-wide record of every input bit the Policy Evaluator reads.
///
/// Owned directly by `Engine` (see engine.rs) rather than wrapped in a
/// lock: the single-threaded event loop is the only thing that ever
/// touches it, so ordinary field access is sufficient.
#[derive(Debug, Clone)]
pub struct InputModel {
    pub charger: ChargerState,
    pub alarm_pending: bool,
    pub device_overheated: bool,
    pub emergency_call_ongoing: bool,
    pub shutdown_blocked: bool,
    pub mounted_to_pc: bool,
    pub battery_empty: bool,
    pub shutdown_requested: bool,
    pub actdead_requested: bool,
    pub reboot_requested: bool,
    pub testmode_requested: bool,
    pub actdead_switch_done: bool,
    pub user_switch_done: bool,
    pub battery_level: BatteryLevel,
    pub current_state: DeviceState,
}

impl Default for InputModel {
    fn default() -> Self {
        Self {
            charger: ChargerState::Unknown,
            alarm_pending: false,
            device_overheated: false,
            emergency_call_ongoing: false,
            shutdown_blocked: false,
            mounted_to_pc: false,
            battery_empty: false,
            shutdown_requested: false,
            actdead_requested: false,
            reboot_requested: false,
            testmode_requested: false,
            actdead_switch_done: false,
            user_switch_done: false,
            battery_level: BatteryLevel::Unknown,
            current_state: DeviceState::NotSet,
        }
    }
}

impl InputModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// `charger`, `battery_level`, and the `*_switch_done` flags log at
    /// debug on change; this is the setter for the charger tri-state.
    pub fn set_charger(&mut self, new: ChargerState, log: &StructuredLogger) {
        if self.charger == new {
            return;
        }
        log.debug(&format!("charger: {:?} -> {:?}", self.charger, new));
        self.charger = new;
    }

    pub fn set_battery_level(&mut self, new: BatteryLevel, log: &StructuredLogger) {
        if self.battery_level == new {
            return;
        }
        log.debug(&format!(
            "battery_level: {:?} -> {:?}",
            self.battery_level, new
        ));
        self.battery_level = new;
    }

    pub fn set_actdead_switch_done(&mut self, new: bool, log: &StructuredLogger) {
        if self.actdead_switch_done == new {
            return;
        }
        log.debug(&format!("actdead_switch_done: {} -> {}", self.actdead_switch_done, new));
        self.actdead_switch_done = new;
    }

    pub fn set_user_switch_done(&mut self, new: bool, log: &StructuredLogger) {
        if self.user_switch_done == new {
            return;
        }
        log.debug(&format!("user_switch_done: {} -> {}", self.user_switch_done, new));
        self.user_switch_done = new;
    }

    /// `alarm_pending`, `mounted_to_pc`, `shutdown_blocked`, and the sticky
    /// request bits log at info on change.
    pub fn set_alarm_pending(&mut self, new: bool, log: &StructuredLogger) {
        if self.alarm_pending == new {
            return;
        }
        log.info(&format!("alarm_pending: {} -> {}", self.alarm_pending, new));
        self.alarm_pending = new;
    }

    pub fn set_mounted_to_pc(&mut self, new: bool, log: &StructuredLogger) {
        if self.mounted_to_pc == new {
            return;
        }
        log.info(&format!("mounted_to_pc: {} -> {}", self.mounted_to_pc, new));
        self.mounted_to_pc = new;
    }

    /// Plain logged setter: per the original source, toggling USB
    /// mass-storage mode does not itself re-run the Policy Evaluator. The
    /// USB gate in the Request Surface is consulted only when a fresh
    /// shutdown/reboot request arrives.
    pub fn set_shutdown_blocked_raw(&mut self, new: bool, log: &StructuredLogger) {
        if self.shutdown_blocked == new {
            return;
        }
        log.info(&format!(
            "shutdown_blocked: {} -> {}",
            self.shutdown_blocked, new
        ));
        self.shutdown_blocked = new;
    }

    pub fn set_shutdown_requested(&mut self, new: bool, log: &StructuredLogger) {
        if self.shutdown_requested == new {
            return;
        }
        log.info(&format!(
            "shutdown_requested: {} -> {}",
            self.shutdown_requested, new
        ));
        self.shutdown_requested = new;
    }

    pub fn set_actdead_requested(&mut self, new: bool, log: &StructuredLogger) {
        if self.actdead_requested == new {
            return;
        }
        log.info(&format!(
            "actdead_requested: {} -> {}",
            self.actdead_requested, new
        ));
        self.actdead_requested = new;
    }

    pub fn set_reboot_requested(&mut self, new: bool, log: &StructuredLogger) {
        if self.reboot_requested == new {
            return;
        }
        log.info(&format!(
            "reboot_requested: {} -> {}",
            self.reboot_requested, new
        ));
        self.reboot_requested = new;
    }

    pub fn set_testmode_requested(&mut self, new: bool, log: &StructuredLogger) {
        if self.testmode_requested == new {
            return;
        }
        log.info(&format!(
            "testmode_requested: {} -> {}",
            self.testmode_requested, new
        ));
        self.testmode_requested = new;
    }

    /// One-way latches; log at warn when they engage. Never unlatch.
    pub fn latch_device_overheated(&mut self, log: &StructuredLogger) {
        if self.device_overheated {
            return;
        }
        log.warn("device_overheated: false -> true (latched)");
        self.device_overheated = true;
    }

    pub fn latch_battery_empty(&mut self, log: &StructuredLogger) {
        if self.battery_empty {
            return;
        }
        log.warn("battery_empty: false -> true (latched)");
        self.battery_empty = true;
    }
}
