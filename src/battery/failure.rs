//! Failure classification for the battery link.
//!
//! The inverter answers some successful writes with a response that the
//! client reports as an error (mismatching function code, odd exception
//! text). Only the signatures listed in [`REAL_FAILURE_SIGNATURES`] count as
//! a failed write; anything else reported by the peer is accepted.

use std::io::ErrorKind;

use crate::battery::ModbusError;

/// Lower-case substrings of a real failure, checked in order.
pub const REAL_FAILURE_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "refused",
    "unreachable",
    "illegal function",
    "illegal data address",
    "illegal data value",
];

/// I/O error kinds treated as a lost connection. The OS maps its errno
/// values onto these, so no platform specific codes are needed.
pub const DISCONNECT_KINDS: &[ErrorKind] = &[
    ErrorKind::ConnectionReset,
    ErrorKind::ConnectionRefused,
    ErrorKind::ConnectionAborted,
    ErrorKind::TimedOut,
    ErrorKind::HostUnreachable,
    ErrorKind::NetworkUnreachable,
    ErrorKind::BrokenPipe,
    ErrorKind::NotConnected,
    ErrorKind::UnexpectedEof,
];

/// Returns the first real-failure signature found in `message`.
pub fn real_failure_signature(message: &str) -> Option<&'static str> {
    let message = message.to_lowercase();
    REAL_FAILURE_SIGNATURES
        .iter()
        .find(|sig| message.contains(**sig))
        .copied()
}

/// Does this write error mean the write did not happen?
pub fn is_real_write_failure(err: &ModbusError) -> bool {
    match err {
        ModbusError::Protocol(msg) => real_failure_signature(msg).is_some(),
        _ => true,
    }
}

/// Should the session be torn down before the next attempt?
pub fn is_disconnect(err: &ModbusError) -> bool {
    match err {
        ModbusError::Transport(e) => DISCONNECT_KINDS.contains(&e.kind()),
        ModbusError::NotConnected => true,
        _ => false,
    }
}
