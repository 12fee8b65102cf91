//! Result codes reported by the server and by the client itself.
//!
//! Server codes travel in the message header as an unsigned byte. Client
//! codes are negative so the two ranges never collide.

use std::fmt;

/// A status code from the server or the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    ServerError,
    KeyNotFound,
    GenerationMismatch,
    ParameterError,
    KeyExists,
    BinTypeError,
    Timeout,
    DeviceOverload,
    PartitionUnavailable,
    KeyBusy,
    InvalidPassword,
    InvalidCredential,
    NotAuthenticated,
    RoleViolation,

    // client side
    ClientError,
    ClientAbort,
    AsyncConnection,
    NoMoreConnections,
    InvalidNode,
    TlsError,
    ConnectionError,
    MaxErrorRate,

    Other(i32),
}

impl ResultCode {
    /// Maps a wire or client status to a code.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => ResultCode::Ok,
            1 => ResultCode::ServerError,
            2 => ResultCode::KeyNotFound,
            3 => ResultCode::GenerationMismatch,
            4 => ResultCode::ParameterError,
            5 => ResultCode::KeyExists,
            12 => ResultCode::BinTypeError,
            9 => ResultCode::Timeout,
            11 => ResultCode::PartitionUnavailable,
            14 => ResultCode::KeyBusy,
            18 => ResultCode::DeviceOverload,
            62 => ResultCode::InvalidPassword,
            65 => ResultCode::InvalidCredential,
            80 => ResultCode::NotAuthenticated,
            81 => ResultCode::RoleViolation,
            -1 => ResultCode::ClientError,
            -5 => ResultCode::ClientAbort,
            -6 => ResultCode::AsyncConnection,
            -7 => ResultCode::NoMoreConnections,
            -8 => ResultCode::InvalidNode,
            -9 => ResultCode::TlsError,
            -10 => ResultCode::ConnectionError,
            -14 => ResultCode::MaxErrorRate,
            other => ResultCode::Other(other),
        }
    }

    /// Maps the result byte of a message header.
    pub fn from_wire(byte: u8) -> Self {
        Self::from_i32(i32::from(byte))
    }

    /// The numeric status.
    pub fn code(&self) -> i32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::ServerError => 1,
            ResultCode::KeyNotFound => 2,
            ResultCode::GenerationMismatch => 3,
            ResultCode::ParameterError => 4,
            ResultCode::KeyExists => 5,
            ResultCode::Timeout => 9,
            ResultCode::PartitionUnavailable => 11,
            ResultCode::BinTypeError => 12,
            ResultCode::KeyBusy => 14,
            ResultCode::DeviceOverload => 18,
            ResultCode::InvalidPassword => 62,
            ResultCode::InvalidCredential => 65,
            ResultCode::NotAuthenticated => 80,
            ResultCode::RoleViolation => 81,
            ResultCode::ClientError => -1,
            ResultCode::ClientAbort => -5,
            ResultCode::AsyncConnection => -6,
            ResultCode::NoMoreConnections => -7,
            ResultCode::InvalidNode => -8,
            ResultCode::TlsError => -9,
            ResultCode::ConnectionError => -10,
            ResultCode::MaxErrorRate => -14,
            ResultCode::Other(c) => *c,
        }
    }

    /// Server conditions worth retrying on another attempt.
    ///
    /// Everything else the server reports is terminal and goes back to
    /// the caller verbatim.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResultCode::Timeout | ResultCode::DeviceOverload)
    }

    /// Failures of the security handshake.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ResultCode::InvalidPassword
                | ResultCode::InvalidCredential
                | ResultCode::NotAuthenticated
                | ResultCode::RoleViolation
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Other(c) => write!(f, "result code {c}"),
            known => write!(f, "{known:?} ({})", known.code()),
        }
    }
}
