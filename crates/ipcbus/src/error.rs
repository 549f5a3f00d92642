// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the bus.
//!
//! | Type | Raised by | Effect |
//! |------|-----------|--------|
//! | [`ConnectionError`] | dial, handshake, socket I/O | connect() fails, connector closes |
//! | [`ProtocolError`] | frame decoding | frame dropped, or stream closed when fatal |
//! | [`RequestError`] | request/response correlation | only the awaiting caller sees it |
//! | [`BusError`] | everything else | umbrella returned by public async APIs |

use crate::codec::Value;
use crate::config::ConfigError;
use crate::peer::Peer;
use std::time::Duration;
use thiserror::Error;

/// Failures establishing or keeping a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection reset: {0}")]
    Reset(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed")]
    Closed,

    #[error("corrupt stream: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Classify a dial error the way callers expect to see it.
    pub(crate) fn from_dial(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
                Self::Refused(err.to_string())
            }
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                Self::Reset(err.to_string())
            }
            _ => Self::Io(err),
        }
    }
}

/// Malformed bytes on the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("frame must start with an array header, got tag 0x{0:02x}")]
    BadFrameHeader(u8),

    #[error("truncated value: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("invalid utf-8 in string value")]
    InvalidUtf8,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message kind {0}")]
    UnknownKind(i64),
}

impl ProtocolError {
    /// Whether the stream can no longer be resynchronised after this error.
    ///
    /// Header errors leave the reader without a frame boundary; anything
    /// detected inside an already-delimited frame only loses that frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BadFrameHeader(_) | Self::FrameTooLarge { .. })
    }
}

/// Outcome of a failed request.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("request on '{channel}' timed out after {after:?}")]
    Timeout { channel: String, after: Duration },

    #[error("request rejected by {}", sender.id)]
    Rejected { sender: Peer, err: Value },

    #[error("connection closed before the request settled")]
    Closed,

    #[error("transport not connected")]
    NotConnected,
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Umbrella error for the public async API.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("broker not running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_fatality() {
        assert!(ProtocolError::BadFrameHeader(0x01).is_fatal());
        assert!(ProtocolError::FrameTooLarge { size: 10, max: 5 }.is_fatal());
        assert!(!ProtocolError::InvalidUtf8.is_fatal());
        assert!(!ProtocolError::UnknownKind(99).is_fatal());
    }

    #[test]
    fn test_dial_classification() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            ConnectionError::from_dial(refused),
            ConnectionError::Refused(_)
        ));

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(matches!(
            ConnectionError::from_dial(reset),
            ConnectionError::Reset(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = RequestError::Timeout {
            channel: "q".into(),
            after: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("timed out"));
        assert!(err.is_timeout());

        let err: BusError = ConnectionError::Closed.into();
        assert_eq!(err.to_string(), "connection closed");
    }
}
