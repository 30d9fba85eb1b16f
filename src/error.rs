//! Error kinds for elaboration, configuration and backend handling
//!
//! Transaction-level failures (unmapped address, ROM write, ...) are not
//! errors in this sense: they travel back to the initiator as a
//! [`TlmStatus`](crate::payload::TlmStatus).

use std::panic::Location;

use crate::time::SimTime;

/// Errors raised while building or driving the platform.
#[derive(Debug, thiserror::Error)]
pub enum VpError {
    /// A caller handed in a value that violates an API contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An address computation wrapped around the 64-bit space.
    #[error("address overflow: {0}")]
    Overflow(String),

    /// The platform description is inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A parameter change was scheduled before the current simulation time.
    #[error("appointment at {date} is in the past (now {now})")]
    PastAppointment { date: SimTime, now: SimTime },

    /// The ISS backend could not be found, loaded or initialised.
    #[error("backend error: {0}")]
    Backend(String),

    /// A kernel wait was issued outside of a simulation process.
    #[error("kernel wait called outside of a simulation process")]
    NotInProcess,

    /// The kernel was shut down while the caller was suspended.
    #[error("simulation stopped")]
    Stopped,

    /// Snapshot encoding or decoding failed.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for simulator operations.
pub type Result<T> = std::result::Result<T, VpError>;

impl VpError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        VpError::InvalidArgument(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        VpError::Configuration(msg.into())
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        VpError::Overflow(msg.into())
    }
}

/// Format the stable one-line diagnostic for a fatal error.
///
/// Shape: `FATAL [<time>] <module>: <error> (at <file>:<line>)`.
#[track_caller]
pub fn fatal_line(err: &VpError, module: &str, time: SimTime) -> String {
    let loc = Location::caller();
    format!("FATAL [{}] {}: {} (at {}:{})", time, module, err, loc.file(), loc.line())
}

/// Emit a fatal diagnostic on the log and hand the line back to the caller,
/// which decides how to terminate.
#[track_caller]
pub fn fatal(err: &VpError, module: &str, time: SimTime) -> String {
    let line = fatal_line(err, module, time);
    tracing::error!(target: "vpsim::fatal", "{}", line);
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_line_format() {
        let err = VpError::config("memory map overlap at 0x1000");
        let line = fatal_line(&err, "noc0", SimTime::from_ns(10));
        assert!(line.starts_with("FATAL [10 ns] noc0: configuration error: memory map overlap at 0x1000 (at "));
        assert!(line.contains("error.rs:"));
    }
}
