//! # Error types for the minidrone protocol
//!
//! Every fallible operation in this crate returns [`Error`]. Transport
//! failures reported by the BLE adapter are carried through unchanged as
//! [`Error::Transport`]; all other variants originate in this crate.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the piloting, telemetry and file-transfer protocol.
#[derive(Debug, Error)]
pub enum Error {
    /// A command argument is outside the range accepted by the vehicle.
    ///
    /// Raised before any write is attempted, so a rejected command never
    /// reaches the link.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A GATT service or characteristic required for the operation was not
    /// present in the discovered directory.
    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying BLE transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound bytes could not be decoded as a protocol frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The operation conflicts with one already in progress on the vehicle.
    #[error("busy: {0}")]
    Busy(String),

    /// A file transfer completed but its MD5 digest did not match the
    /// digest reported by the vehicle.
    #[error("digest mismatch: local {local}, remote {remote}")]
    DigestMismatch {
        /// Digest computed over the received bytes, lowercase hex.
        local: String,
        /// Digest reported by the vehicle.
        remote: String,
    },

    /// The vehicle sent a chunk tag or control message that is not valid
    /// in the current file-transfer stage.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A file-transfer request did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The vehicle's media store rejected the request.
    #[error("remote ftp error: {0}")]
    Ftp(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
