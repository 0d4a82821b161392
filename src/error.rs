use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Exit status used when the user interrupts a mirroring session.
pub const EXIT_USER_INTERRUPT: i32 = 130;

/// Closed failure taxonomy shared by the core and the CLI.
///
/// The `Display` text is the canonical message for each code. The same value
/// doubles as the process exit status through [`ErrorCode::exit_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("required dependency is not installed")]
    MissingDependency,
    #[error("no Android devices connected")]
    NoDevices,
    #[error("device disconnected or not responding")]
    DeviceDisconnected,
    #[error("screen mirroring failed")]
    MirrorFailed,
    #[error("external command failed")]
    CommandError,
    #[error("operation cancelled by user")]
    UserCancelled,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation timed out")]
    Timeout,
    #[error("invalid input")]
    InvalidInput,
    #[error("unknown error")]
    Unknown,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 10] = [
        ErrorCode::MissingDependency,
        ErrorCode::NoDevices,
        ErrorCode::DeviceDisconnected,
        ErrorCode::MirrorFailed,
        ErrorCode::CommandError,
        ErrorCode::UserCancelled,
        ErrorCode::PermissionDenied,
        ErrorCode::Timeout,
        ErrorCode::InvalidInput,
        ErrorCode::Unknown,
    ];

    /// Process exit status for this code.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::MissingDependency => 10,
            ErrorCode::NoDevices => 11,
            ErrorCode::DeviceDisconnected => 12,
            ErrorCode::MirrorFailed => 13,
            ErrorCode::CommandError => 14,
            ErrorCode::UserCancelled => 15,
            ErrorCode::PermissionDenied => 16,
            ErrorCode::Timeout => 17,
            ErrorCode::InvalidInput => 18,
            ErrorCode::Unknown => 1,
        }
    }

    /// Remediation hints shown next to the message by the CLI.
    pub fn suggestions(self) -> &'static [&'static str] {
        match self {
            ErrorCode::MissingDependency => &[
                "Install adb: brew install android-platform-tools",
                "Install scrcpy: brew install scrcpy",
                "Run `droid-mirror doctor` to check your setup",
            ],
            ErrorCode::NoDevices => &[
                "Connect the device with a USB cable that carries data",
                "Enable USB debugging under Settings > Developer options",
                "Accept the 'Allow USB debugging' prompt on the device",
            ],
            ErrorCode::DeviceDisconnected => &[
                "Reconnect the USB cable",
                "Run `droid-mirror doctor --fix` to restart the adb server",
            ],
            ErrorCode::MirrorFailed => &[
                "Check that the device screen is unlocked",
                "Try a lower resolution with --max-size 1024",
            ],
            ErrorCode::CommandError => &["Re-run with --log-level debug for details"],
            ErrorCode::PermissionDenied => &[
                "Check file permissions of the state directory",
                "Revoke and re-grant USB debugging authorizations on the device",
            ],
            ErrorCode::Timeout => &[
                "The device may be busy; try again",
                "Raise command_timeout_secs in the config file",
            ],
            ErrorCode::InvalidInput => &["Run `droid-mirror list` to see valid device serials"],
            ErrorCode::UserCancelled | ErrorCode::Unknown => &[],
        }
    }

    /// Failures worth repeating automatically.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::CommandError)
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            std::io::ErrorKind::NotFound => ErrorCode::MissingDependency,
            std::io::ErrorKind::TimedOut => ErrorCode::Timeout,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Warning and error tally for a single invocation.
///
/// Created by the caller and threaded through scan and watch code; dropped
/// when the invocation returns.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: AtomicU32,
    errors: AtomicU32,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&self, message: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        warn!("{message}");
    }

    pub fn error(&self, code: ErrorCode, message: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        error!(code = ?code, "{message}");
    }

    pub fn warnings(&self) -> u32 {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn is_clean(&self) -> bool {
        self.warnings() == 0 && self.errors() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn exit_codes_are_distinct_and_in_range() {
        let codes: HashSet<i32> = ErrorCode::ALL.iter().map(|c| c.exit_code()).collect();
        assert_eq!(codes.len(), ErrorCode::ALL.len());
        for code in ErrorCode::ALL {
            if code != ErrorCode::Unknown {
                assert!((10..=18).contains(&code.exit_code()), "{code:?}");
            }
        }
        assert_eq!(ErrorCode::MissingDependency.exit_code(), 10);
        assert_eq!(ErrorCode::InvalidInput.exit_code(), 18);
    }

    #[test]
    fn every_code_has_a_message() {
        for code in ErrorCode::ALL {
            assert!(!code.to_string().is_empty());
        }
        assert_eq!(ErrorCode::NoDevices.to_string(), "no Android devices connected");
    }

    #[test]
    fn only_timeout_and_command_error_are_transient() {
        let transient: Vec<_> = ErrorCode::ALL.into_iter().filter(|c| c.is_transient()).collect();
        assert_eq!(transient, vec![ErrorCode::CommandError, ErrorCode::Timeout]);
    }

    #[test]
    fn diagnostics_count_per_instance() {
        let first = Diagnostics::new();
        first.warn("dropped line");
        first.warn("dropped line");
        first.error(ErrorCode::CommandError, "adb failed");

        let second = Diagnostics::new();
        assert_eq!(first.warnings(), 2);
        assert_eq!(first.errors(), 1);
        assert!(second.is_clean());
    }
}
