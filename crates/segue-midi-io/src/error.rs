//! Error taxonomy for MIDI I/O operations.
//!
//! Fatal problems are returned as [`Error`] values. Non-fatal problems
//! (decode glitches, capability no-ops) are *warnings*: they are routed to
//! the session's error callback when one is registered, otherwise logged,
//! and never surface as `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An operation required at least one port and the directory was empty.
    #[error("no MIDI devices found")]
    NoDevicesFound,

    /// An out-of-range index or otherwise malformed argument.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A call that is not valid in the session's current state.
    #[error("invalid use: {0}")]
    InvalidUse(String),

    /// The OS transport rejected an operation.
    #[error("driver error: {0}")]
    Driver(String),

    /// The engine's background thread could not be started.
    #[error("thread error: {0}")]
    Thread(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoDevicesFound => ErrorKind::NoDevicesFound,
            Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::InvalidUse(_) => ErrorKind::InvalidUse,
            Error::Driver(_) => ErrorKind::Driver,
            Error::Thread(_) => ErrorKind::Thread,
        }
    }
}

/// Classification carried to error callbacks. `Warning` never appears on a
/// returned [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Warning,
    NoDevicesFound,
    InvalidParameter,
    InvalidUse,
    Driver,
    Thread,
}

/// Receives warnings and errors a session cannot return through a `Result`,
/// such as decode problems seen on the input thread.
pub type ErrorCallback = Box<dyn FnMut(ErrorKind, &str) + Send>;

#[cfg(all(feature = "native", target_os = "linux"))]
impl From<alsa::Error> for Error {
    fn from(e: alsa::Error) -> Self {
        Error::Driver(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(Error::NoDevicesFound.kind(), ErrorKind::NoDevicesFound);
        assert_eq!(Error::InvalidParameter("x".into()).kind(), ErrorKind::InvalidParameter);
        assert_eq!(Error::InvalidUse("x".into()).kind(), ErrorKind::InvalidUse);
        assert_eq!(Error::Driver("x".into()).kind(), ErrorKind::Driver);
        assert_eq!(Error::Thread("x".into()).kind(), ErrorKind::Thread);
    }

    #[test]
    fn messages_carry_context() {
        let err = Error::InvalidParameter("port index 9 out of range (0..2)".into());
        assert!(err.to_string().contains("port index 9"));
    }
}
