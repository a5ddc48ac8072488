//! Error taxonomy for the proxy core.

use std::io;
use thiserror::Error;

/// Why an upstream dial failed. Timeouts back off more aggressively than refusals.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {0} timed out")]
    Timeout(String),
    #[error("connection to {0} refused")]
    Refused(String),
    #[error("socket path too long: {0}")]
    NameTooLong(String),
    #[error("connect to {addr} failed: {source}")]
    Other {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DialError::Timeout(_))
    }
}

/// Malformed or out-of-protocol input on a connection. Fatal for that connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected SEQUENCE (0x30), got tag 0x{0:02X}")]
    NotSequence(u8),
    #[error("invalid BER length encoding")]
    BadLength,
    #[error("PDU of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("BER element truncated")]
    Truncated,
    #[error("expected tag 0x{expected:02X}, got 0x{found:02X}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("unexpected protocol op 0x{0:02X}")]
    UnexpectedOp(u8),
    #[error("invalid message id {0}")]
    InvalidMessageId(i64),
    #[error("message id {0} already in use")]
    DuplicateMessageId(i32),
    #[error("response for message id {0} that was never issued")]
    UnknownMessageId(i32),
    #[error("trailing data after LDAP message")]
    TrailingData,
}

/// Failure of one upstream connection attempt, at any connector state.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("handshake did not complete in time")]
    HandshakeTimeout,
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),
    #[error("StartTLS refused by server (result code {0})")]
    StartTlsRefused(u32),
    #[error("TLS required but no client TLS context is configured")]
    NoTlsContext,
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),
    #[error("upstream bind failed (result code {code}): {message}")]
    Bind { code: u32, message: String },
    #[error("unexpected response during handshake: {0}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ConnectError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ConnectError::Dial(e) => e.is_timeout(),
            ConnectError::HandshakeTimeout => true,
            _ => false,
        }
    }
}
