// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! The taxonomy mirrors how failures propagate through the transport:
//!
//! - **Configuration-fatal** errors (`Config`, `Bind`) abort startup
//!   before any thread is spawned.
//! - **Transient** conditions (`QueueFull`) are counted and dropped by
//!   the hot paths; they only surface as `Err` on the public send API,
//!   where the caller asked for an answer.
//! - **Connection-fatal** conditions (`CorruptFrame`, I/O errors) never
//!   cross a thread boundary as `Error` values; the owning thread tears
//!   the connection down and records a counter instead.

use std::fmt;
use std::io;

/// Errors surfaced by the rtmq public API.
#[derive(Debug)]
pub enum Error {
    /// Invalid or missing configuration (startup aborts before spawn).
    Config(String),

    /// Listener could not bind its port (startup aborts before spawn).
    Bind(io::Error),

    /// Generic I/O failure with underlying cause.
    Io(io::Error),

    /// A bounded queue rejected a push — the system's backpressure signal.
    QueueFull,

    /// Frame failed checksum/format validation (connection-fatal).
    CorruptFrame,

    /// Link authentication was rejected for this node.
    AuthFailed(i32),

    /// A handler is already registered for this message type.
    DuplicateHandler(u16),

    /// Message type is outside the configured range.
    InvalidType(u16),

    /// Payload exceeds the configured maximum body size.
    TooLong(usize),

    /// No live connection is known for the requested node.
    NotConnected,

    /// The addressed thread has stopped; its command channel is closed.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Bind(e) => write!(f, "bind failed: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::QueueFull => write!(f, "queue full"),
            Error::CorruptFrame => write!(f, "corrupt frame"),
            Error::AuthFailed(node) => write!(f, "link authentication failed for node {}", node),
            Error::DuplicateHandler(t) => write!(f, "handler already registered for type {}", t),
            Error::InvalidType(t) => write!(f, "message type {} out of range", t),
            Error::TooLong(len) => write!(f, "payload too long: {} bytes", len),
            Error::NotConnected => write!(f, "no route to node"),
            Error::ChannelClosed => write!(f, "command channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bind(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for results using the crate [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::QueueFull.to_string(), "queue full");
        assert_eq!(
            Error::AuthFailed(7).to_string(),
            "link authentication failed for node 7"
        );
        assert_eq!(
            Error::Config("recv_threads must be >= 1".into()).to_string(),
            "configuration error: recv_threads must be >= 1"
        );
    }

    #[test]
    fn test_io_source_chain() {
        let inner = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        let err = Error::Bind(inner);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_from_io() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
