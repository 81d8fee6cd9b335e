//! Injected capability traits the engine depends on instead of touching
//! `std::fs`/D-Bus/process credentials directly: `TimerService`,
//! `HomeEncryptionProbe`, `PrivilegeChecker`, `RebootParamStore`, and
//! `EventSink`. Each has a production implementation here and a recording
//! fake used by tests (see the `tests` submodule and `engine.rs`'s own
//! tests).
//!
//! Grounded in the teacher's `ModbusLike` trait
//! (`driver/modbus_like.rs`): abstract the one genuinely blocking or
//! hardware-touching dependency behind a narrow `#[async_trait]` so the
//! core logic stays unit-testable with a mock.

use crate::config::PathsConfig;
use crate::error::DsmeError;
use crate::messages::{CallerIdentity, OutboundEvent, TimerKind};
use crate::model::{ChargerState, DeviceState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// An opaque, cloneable, comparable token identifying a scheduled timer.
/// Cancellation compares the stored generation so a `sleep` that already
/// elapsed before `cancel()` returns is discarded by the consumer instead
/// of acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub kind: TimerKind,
    generation: u64,
}

/// Schedules one-shot, second-resolution callbacks. Implementations post
/// `EngineEvent::TimerFired(kind)` back onto the engine's event channel
/// rather than invoking an arbitrary closure off-thread, keeping every
/// observable mutation on the engine's single logical thread.
#[async_trait::async_trait]
pub trait TimerService: Send + Sync {
    fn schedule(&self, after: Duration, kind: TimerKind) -> Result<TimerHandle, DsmeError>;
    fn cancel(&self, handle: TimerHandle);
}

/// Production `TimerService` built on `tokio::time::sleep`. Cheaply
/// cloneable; the generation map is shared via `Arc` so spawned sleep
/// tasks can re-check it without borrowing `self`.
#[derive(Clone)]
pub struct TokioTimerService {
    generations: Arc<Mutex<HashMap<TimerKind, u64>>>,
    events_tx: mpsc::UnboundedSender<crate::messages::EngineEvent>,
}

impl TokioTimerService {
    pub fn new(events_tx: mpsc::UnboundedSender<crate::messages::EngineEvent>) -> Self {
        Self {
            generations: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
        }
    }
}

#[async_trait::async_trait]
impl TimerService for TokioTimerService {
    fn schedule(&self, after: Duration, kind: TimerKind) -> Result<TimerHandle, DsmeError> {
        let generation = {
            let mut generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
            let entry = generations.entry(kind).or_insert(0);
            *entry += 1;
            *entry
        };

        let tx = self.events_tx.clone();
        let generations = Arc::clone(&self.generations);

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let still_current = {
                let guard = generations.lock().unwrap_or_else(|e| e.into_inner());
                guard.get(&kind).copied() == Some(generation)
            };
            if still_current {
                let _ = tx.send(crate::messages::EngineEvent::TimerFired(kind));
            }
        });

        Ok(TimerHandle { kind, generation })
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
        let entry = generations.entry(handle.kind).or_insert(0);
        if *entry == handle.generation {
            *entry += 1;
        }
    }
}

/// One-time probe for whether the home partition is LUKS-encrypted. The
/// result is cached for the process lifetime by the caller (see
/// `engine.rs`'s `OnceCell<bool>`), not by this trait.
#[async_trait::async_trait]
pub trait HomeEncryptionProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Production probe: treats the presence of a LUKS-mapped device node at
/// the configured path as "encrypted". Absence is treated as "not
/// encrypted" per the documented transient-failure fallback in §7
/// (LUKS not available -> treat home as unencrypted), rather than as an
/// error.
pub struct DeviceMapperEncryptionProbe {
    device_path: PathBuf,
}

impl DeviceMapperEncryptionProbe {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            device_path: PathBuf::from(&paths.home_device),
        }
    }
}

#[async_trait::async_trait]
impl HomeEncryptionProbe for DeviceMapperEncryptionProbe {
    async fn probe(&self) -> bool {
        tokio::fs::metadata(&self.device_path).await.is_ok()
    }
}

/// Checks whether a caller is privileged (root, or a member of the
/// configured privileged group).
#[async_trait::async_trait]
pub trait PrivilegeChecker: Send + Sync {
    async fn is_privileged(&self, caller: &CallerIdentity, privileged_group: &str) -> bool;
}

/// Production checker: root is always privileged; otherwise the caller's
/// gid is compared against the numeric gid of `privileged_group` as
/// resolved from `/etc/group`. Supplementary group membership beyond the
/// caller's reported primary gid is not consulted -- see DESIGN.md.
pub struct EtcGroupPrivilegeChecker {
    group_file: PathBuf,
}

impl EtcGroupPrivilegeChecker {
    pub fn new() -> Self {
        Self {
            group_file: PathBuf::from("/etc/group"),
        }
    }

    #[cfg(test)]
    pub fn with_group_file(path: PathBuf) -> Self {
        Self { group_file: path }
    }

    async fn resolve_gid(&self, group_name: &str) -> Option<u32> {
        let contents = tokio::fs::read_to_string(&self.group_file).await.ok()?;
        for line in contents.lines() {
            let mut fields = line.splitn(4, ':');
            let name = fields.next()?;
            let _password = fields.next();
            let gid = fields.next()?;
            if name == group_name {
                return gid.parse().ok();
            }
        }
        None
    }
}

impl Default for EtcGroupPrivilegeChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PrivilegeChecker for EtcGroupPrivilegeChecker {
    async fn is_privileged(&self, caller: &CallerIdentity, privileged_group: &str) -> bool {
        match caller {
            CallerIdentity::DbusProxy => true,
            CallerIdentity::Local { uid, gid } => {
                if *uid == 0 {
                    return true;
                }
                match self.resolve_gid(privileged_group).await {
                    Some(privileged_gid) => *gid == privileged_gid,
                    None => false,
                }
            }
            CallerIdentity::DbusPeer { .. } => false,
        }
    }
}

/// Reads the per-target `reboot-to-<target>-<charger>.param` config file
/// and writes/clears `/run/systemd/reboot-param`.
#[async_trait::async_trait]
pub trait RebootParamStore: Send + Sync {
    /// Returns the first line of the matching param file, if present and
    /// readable.
    async fn read_param(&self, target: DeviceState, charger: ChargerState) -> Option<String>;

    async fn write_param(&self, contents: &str) -> Result<(), DsmeError>;

    async fn clear_param(&self) -> Result<(), DsmeError>;
}

pub struct FilesystemRebootParamStore {
    source_dir: PathBuf,
    sink_path: PathBuf,
}

impl FilesystemRebootParamStore {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            source_dir: PathBuf::from(&paths.reboot_param_source_dir),
            sink_path: PathBuf::from(&paths.reboot_param_sink),
        }
    }

    fn param_file_name(target: DeviceState, charger: ChargerState) -> String {
        let target_name = match target {
            DeviceState::Actdead => "actdead",
            DeviceState::Shutdown => "shutdown",
            DeviceState::Reboot => "reboot",
            _ => "user",
        };
        let charger_name = match charger {
            ChargerState::Connected => "with-charger",
            _ => "without-charger",
        };
        format!("reboot-to-{target_name}-{charger_name}.param")
    }
}

#[async_trait::async_trait]
impl RebootParamStore for FilesystemRebootParamStore {
    async fn read_param(&self, target: DeviceState, charger: ChargerState) -> Option<String> {
        let path = self.source_dir.join(Self::param_file_name(target, charger));
        let contents = tokio::fs::read_to_string(&path).await.ok()?;
        contents.lines().next().map(|s| s.to_string())
    }

    async fn write_param(&self, contents: &str) -> Result<(), DsmeError> {
        tokio::fs::write(&self.sink_path, contents)
            .await
            .map_err(|e| DsmeError::transient(format!("writing reboot-param failed: {e}")))
    }

    async fn clear_param(&self) -> Result<(), DsmeError> {
        match tokio::fs::remove_file(&self.sink_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DsmeError::transient(format!(
                "removing stale reboot-param failed: {e}"
            ))),
        }
    }
}

/// Receives every outbound broadcast the Transition Controller produces.
/// The production sink forwards `ChangeRunlevel`/`Shutdown` onto the
/// D-Bus bridge and logs everything else; a `RecordingSink` (see
/// `engine.rs` tests) pushes every event into a `Vec` for assertions,
/// directly realizing the "mock sink" called for in the design notes.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: OutboundEvent);
}
