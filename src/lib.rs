//! # dsme - Device State Manager
//!
//! A device state manager daemon for an embedded Linux handset: a single
//! async engine that owns every asynchronous input bit affecting the
//! device's top-level runlevel (`USER`, `ACTDEAD`, `SHUTDOWN`, `REBOOT`,
//! `TEST`), arbitrates them against an ordered policy, and drives the
//! transitions (with their associated delay timers) through an injected
//! `EventSink`.
//!
//! ## Architecture
//!
//! - `model`: the device-state/runlevel/charger/battery types and the
//!   `InputModel` record the Policy Evaluator reads.
//! - `policy`: the pure eight-rule Policy Evaluator.
//! - `engine`: the Transition Controller and Request Surface, fused into a
//!   single `Engine` task with no locking.
//! - `messages`: inbound `Message`, outbound `OutboundEvent`, and the
//!   internal `EngineEvent` timer-fired notification.
//! - `collaborators`: injected capability traits (`TimerService`,
//!   `HomeEncryptionProbe`, `PrivilegeChecker`, `RebootParamStore`,
//!   `EventSink`) and their production implementations.
//! - `dbus`: the D-Bus bridge (signal subscriptions, request interface,
//!   production `EventSink`).
//! - `config`: layered YAML configuration.
//! - `logging`: structured logging and tracing setup.
//! - `error`: the four-kind `DsmeError`.

pub mod collaborators;
pub mod config;
pub mod dbus;
pub mod engine;
pub mod error;
pub mod logging;
pub mod messages;
pub mod model;
pub mod policy;

pub use config::Config;
pub use engine::Engine;
pub use error::{DsmeError, Result};
