//! Inbound/outbound message shapes and the internal engine event type.
//!
//! Replaces the original plugin/module-table dispatch with a single tagged
//! `Message` enum and a single dispatch site in `Engine::handle_message`.
//! Outbound broadcasts become `OutboundEvent`s passed to an injected
//! `EventSink`.

use crate::model::{DeviceState, Runlevel};
use tokio::sync::oneshot;

/// Caller identity captured at the Request Surface, used by the
/// `PrivilegeChecker` and by the in-process D-Bus-proxy-only gate on
/// `BLOCK_SHUTDOWN`/`ALLOW_SHUTDOWN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerIdentity {
    /// A local caller identified by uid/gid, typically resolved from a
    /// peer-credentials lookup on a Unix socket.
    Local { uid: u32, gid: u32 },

    /// The in-process D-Bus bridge task itself, trusted unconditionally
    /// for `BLOCK_SHUTDOWN`/`ALLOW_SHUTDOWN` per the Request Surface's
    /// identity check.
    DbusProxy,

    /// A caller reached over D-Bus, identified by unique bus name.
    DbusPeer { unique_name: String },
}

impl CallerIdentity {
    pub fn is_dbus_proxy(&self) -> bool {
        matches!(self, CallerIdentity::DbusProxy)
    }
}

/// Thermal status reported by `SET_THERMAL_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalStatus {
    Normal,
    LowTemp,
    Overheated,
}

/// Which of the six timer slots fired. One method on `Engine` per
/// variant replaces the original `void*`-callback pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ShutdownDelay,
    ActdeadDelay,
    UserDelay,
    OverheatToShutdown,
    ChargerDisconnectGrace,
    BatteryEmptyToShutdown,
}

/// Inbound messages delivered over the engine's mpsc channel, either from
/// the D-Bus bridge task, from in-process request surfaces, or from the
/// timer service.
#[derive(Debug)]
pub enum Message {
    Telinit {
        runlevel: String,
        caller: CallerIdentity,
    },
    ShutdownReq {
        caller: CallerIdentity,
    },
    RebootReq {
        caller: CallerIdentity,
    },
    PowerupReq {
        caller: CallerIdentity,
    },
    StateQuery {
        reply: oneshot::Sender<DeviceState>,
    },
    SetAlarmState {
        alarm_set: bool,
    },
    SetUsbState {
        mounted_to_pc: bool,
    },
    SetChargerState {
        connected: bool,
    },
    SetThermalStatus {
        status: ThermalStatus,
    },
    SetEmergencyCallState {
        ongoing: bool,
    },
    SetBatteryState {
        empty: bool,
    },
    SetBatteryLevel {
        level: u8,
    },
    BlockShutdown {
        caller: CallerIdentity,
    },
    AllowShutdown {
        caller: CallerIdentity,
    },
    DbusConnected,
    DbusDisconnect,
    /// Carries the D-Bus `runlevel_switch_done` signal payload.
    RunlevelSwitchDone {
        runlevel: i32,
    },
}

/// Internal events produced only by `TimerService` implementations,
/// delivered on a channel separate from `Message` so the timer-vs-message
/// arms of the engine's `select!` loop are independently fair.
#[derive(Debug, Clone, Copy)]
pub enum EngineEvent {
    TimerFired(TimerKind),
}

/// Outbound broadcasts. The production `EventSink` forwards
/// `ChangeRunlevel`/`Shutdown` onto the D-Bus bridge and logs everything
/// else, since no further in-process consumer exists for it in this
/// crate's scope.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    SaveDataInd,
    StateChangeInd { state: DeviceState },
    StateReqDeniedInd { state: DeviceState, reason: String },
    BatteryEmptyInd,
    ChangeRunlevel { runlevel: Runlevel },
    Shutdown { runlevel: Runlevel },
    SetEmergencyCallState { ongoing: bool },
    EnterMalf {
        reason: String,
        component: String,
        details: String,
    },
}
