//! Error types and handling for dsme
//!
//! This module defines the error types used throughout the daemon, matching
//! the four error kinds the state engine distinguishes: recoverable policy
//! denials, transient system-call failures, timer-allocation failures, and
//! fatal conditions that end the main loop.

use thiserror::Error;

/// Result type alias for dsme operations
pub type Result<T> = std::result::Result<T, DsmeError>;

/// Main error type for dsme
#[derive(Debug, Error)]
pub enum DsmeError {
    /// A request was denied by policy (unprivileged caller, USB-mounted
    /// shutdown, sub-minimum battery). Recoverable: the caller continues.
    #[error("policy denied: {message}")]
    PolicyDenied { message: String },

    /// A system call failed in a way the engine has a documented fallback
    /// for (missing reboot-param file, LUKS probe unavailable, pid lookup
    /// failed).
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// A non-critical timer (overheat, battery-empty) could not be
    /// allocated; the caller should invoke its callback inline.
    #[error("timer allocation failed: {message}")]
    TimerAllocation { message: String },

    /// The shutdown-delay timer could not be allocated, or MALF fork
    /// failed. The main loop exits with EXIT_FAILURE.
    #[error("fatal: {message}")]
    Fatal { message: String },

    /// Configuration-related errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// D-Bus communication errors
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serialization/deserialization errors
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl DsmeError {
    /// Create a new policy-denial error
    pub fn policy_denied<S: Into<String>>(message: S) -> Self {
        DsmeError::PolicyDenied {
            message: message.into(),
        }
    }

    /// Create a new transient error
    pub fn transient<S: Into<String>>(message: S) -> Self {
        DsmeError::Transient {
            message: message.into(),
        }
    }

    /// Create a new timer-allocation error
    pub fn timer_allocation<S: Into<String>>(message: S) -> Self {
        DsmeError::TimerAllocation {
            message: message.into(),
        }
    }

    /// Create a new fatal error
    pub fn fatal<S: Into<String>>(message: S) -> Self {
        DsmeError::Fatal {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        DsmeError::Config {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        DsmeError::Io {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for DsmeError {
    fn from(err: std::io::Error) -> Self {
        DsmeError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for DsmeError {
    fn from(err: serde_yaml::Error) -> Self {
        DsmeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DsmeError {
    fn from(err: serde_json::Error) -> Self {
        DsmeError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DsmeError::policy_denied("usb mounted");
        assert!(matches!(err, DsmeError::PolicyDenied { .. }));

        let err = DsmeError::fatal("shutdown timer alloc failed");
        assert!(matches!(err, DsmeError::Fatal { .. }));

        let err = DsmeError::config("bad timers.shutdown_delay_secs");
        assert!(matches!(err, DsmeError::Config { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = DsmeError::policy_denied("mounted_to_pc");
        assert_eq!(format!("{}", err), "policy denied: mounted_to_pc");

        let err = DsmeError::transient("reboot-param missing");
        assert_eq!(
            format!("{}", err),
            "transient failure: reboot-param missing"
        );
    }
}
