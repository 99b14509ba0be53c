// src/error.rs

//! Central error type for the resolver.
//!
//! Failures local to one device or network candidate are absorbed by the
//! mount orchestrator's retry loop; everything else propagates to the
//! caller. The numeric codes mirror the installer's wire protocol for
//! operator-visible diagnostics: 101 destination open, 102 progress abort,
//! 103 decompressor failure, 104 close failure, 105 invalid address.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Error from the transport collaborator (HTTP status, curl-style code).
    #[error("transport error {code}: {message}")]
    Transport { code: i32, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("open: {path}: {message}")]
    OpenDestination { path: String, message: String },

    /// Progress callback vetoed the transfer.
    #[error("transfer aborted")]
    Aborted,

    /// External decompressor exited with a real error (not 0 or 2).
    #[error("gzip: {0}")]
    Decompress(String),

    #[error("close failed: {0}")]
    CloseFailed(String),

    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("mount: {0}")]
    Mount(String),

    /// Loopback or tunnel pseudo-device offered for network bootstrap.
    #[error("not a usable network device: {0}")]
    BadDevice(String),

    /// No (or incomplete) DHCP/BOOTP answer within the transport timeout.
    #[error("no answer to {0} request")]
    NoAnswer(&'static str),

    #[error("network setup failed: {0}")]
    ActivationFailed(String),

    #[error("SLP discovery failed on {0}")]
    SlpFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Operator-visible error code, printed alongside the message.
    pub fn code(&self) -> i32 {
        match self {
            Error::Transport { code, .. } => *code,
            Error::OpenDestination { .. } => 101,
            Error::Aborted => 102,
            Error::Decompress(_) => 103,
            Error::CloseFailed(_) => 104,
            Error::InvalidAddress(_) => 105,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Aborted.code(), 102);
        assert_eq!(Error::Decompress("broken".into()).code(), 103);
        assert_eq!(Error::InvalidAddress("nowhere".into()).code(), 105);
        assert_eq!(
            Error::Transport {
                code: 404,
                message: "not found".into()
            }
            .code(),
            404
        );
        assert_eq!(Error::Mount("ext4".into()).code(), 1);
    }
}
