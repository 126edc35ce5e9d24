//! The error taxonomy shared by the engine and every backend driver.
//!
//! A single [`Error`] enum carries the kind; drivers produce
//! [`Error::SystemError`] for native failures and the engine never rewraps
//! what a driver returns. Warnings are ordinary `Err` values whose observable
//! effect on the stream is nil.

use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong talking to the engine or a backend.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A recoverable condition. The stream state is unchanged; the call had
    /// no effect (e.g. starting a stream that is already running).
    #[error("warning: {0}")]
    Warning(String),

    /// The caller violated the stream state machine or passed malformed
    /// parameters. The stream state is unchanged.
    #[error("invalid use: {0}")]
    InvalidUse(String),

    /// The dispatcher has no backend driver instantiated, or the requested
    /// backend is not compiled into this build.
    #[error("no backend driver available")]
    NoDriver,

    /// The native audio subsystem failed in a way the engine cannot recover
    /// from. If the stream was running it has been forced to `stopped`.
    #[error("system error: {0}")]
    SystemError(String),

    /// An internal guard detected a corrupt stream state.
    #[error("internal verification failure: {0}")]
    Fail(String),
}

impl Error {
    /// True for [`Error::Warning`]: the operation was refused but harmless.
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::Warning(_))
    }

    pub(crate) fn warning(msg: impl Into<String>) -> Error {
        Error::Warning(msg.into())
    }

    pub(crate) fn invalid_use(msg: impl Into<String>) -> Error {
        Error::InvalidUse(msg.into())
    }

    pub(crate) fn system(msg: impl fmt::Display) -> Error {
        Error::SystemError(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_is_distinguishable() {
        assert!(Error::warning("already running").is_warning());
        assert!(!Error::invalid_use("no stream").is_warning());
        assert!(!Error::NoDriver.is_warning());
    }

    #[test]
    fn display_carries_description() {
        let err = Error::system("snd_pcm_open failed");
        assert_eq!(err.to_string(), "system error: snd_pcm_open failed");
    }
}
