//! Return codes shared by every public operation.

use core::fmt;

/// Negative error codes returned to callers, plus `WouldBlock` for
/// non-blocking operations. A flat enum implementing `Display`, scoped to
/// the networking return codes this crate's process-facing API enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Operation not permitted for the caller (e.g. unbind by a foreign pid).
    Perm,
    /// Invalid argument (malformed address, bad option, reserved address).
    Inval,
    /// Socket already bound.
    Bound,
    /// Operation invalid in the current connection state.
    State,
    /// No free port available (manual bind conflict or ephemeral exhaustion).
    NoPort,
    /// Resource exhaustion: out of flows, buffers, or table slots.
    Sys,
    /// DNS resolution failed or timed out.
    Dns,
    /// Protocol-level violation or unsupported combination.
    Proto,
    /// Non-blocking operation has no data/connection ready yet.
    WouldBlock,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Perm => "operation not permitted",
            Error::Inval => "invalid argument",
            Error::Bound => "already bound",
            Error::State => "invalid state for operation",
            Error::NoPort => "no port available",
            Error::Sys => "resource exhausted",
            Error::Dns => "dns resolution failed",
            Error::Proto => "protocol error",
            Error::WouldBlock => "operation would block",
        };
        f.write_str(s)
    }
}
