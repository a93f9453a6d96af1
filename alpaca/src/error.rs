//! Alpaca error types and device error translation

use std::fmt;
use thiserror::Error;

/// First device error number of the reserved Alpaca range
pub const ALPACA_ERROR_BASE: i32 = 0x400;

/// Last device error number of the reserved Alpaca range
pub const ALPACA_ERROR_MAX: i32 = 0xFFF;

/// Offset that moves an Alpaca error number into the ASCOM HRESULT scheme
pub const ASCOM_ERROR_NUMBER_OFFSET: u32 = 0x8004_0000;

/// ASCOM HRESULT condition codes
pub mod codes {
    pub const NOT_IMPLEMENTED: u32 = 0x8004_0400;
    pub const INVALID_VALUE: u32 = 0x8004_0401;
    pub const VALUE_NOT_SET: u32 = 0x8004_0402;
    pub const INVALID_VALUE_LEGACY: u32 = 0x8004_0405;
    pub const NOT_CONNECTED: u32 = 0x8004_0407;
    pub const INVALID_WHILE_PARKED: u32 = 0x8004_0408;
    pub const INVALID_WHILE_SLAVED: u32 = 0x8004_0409;
    pub const INVALID_OPERATION: u32 = 0x8004_040B;
    pub const ACTION_NOT_IMPLEMENTED: u32 = 0x8004_040C;
    pub const OPERATION_CANCELLED: u32 = 0x8004_040E;
}

/// Semantic category of a device reported error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotImplemented,
    ActionNotImplemented,
    InvalidOperation,
    InvalidValue,
    InvalidWhileParked,
    InvalidWhileSlaved,
    NotConnected,
    OperationCancelled,
    ValueNotSet,
    /// Anything the fixed table does not name
    RemoteFault,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::ActionNotImplemented => "action not implemented",
            ErrorKind::InvalidOperation => "invalid operation",
            ErrorKind::InvalidValue => "invalid value",
            ErrorKind::InvalidWhileParked => "invalid while parked",
            ErrorKind::InvalidWhileSlaved => "invalid while slaved",
            ErrorKind::NotConnected => "not connected",
            ErrorKind::OperationCancelled => "operation cancelled",
            ErrorKind::ValueNotSet => "value not set",
            ErrorKind::RemoteFault => "remote fault",
        };
        f.write_str(text)
    }
}

/// A translated device error: the kind plus the original number and message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    pub kind: ErrorKind,
    pub number: i32,
    pub message: String,
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:X}): {}", self.kind, self.number, self.message)
    }
}

/// Map a device error number to an [`ErrorKind`].
///
/// Numbers inside the reserved range are offset into the HRESULT scheme and
/// looked up in the fixed condition table. Numbers some drivers already send
/// in HRESULT form (0x80040400..=0x80040FFF) are looked up as they are.
/// Everything else is a remote fault.
pub fn translate(number: i32, message: &str) -> DeviceFault {
    let hresult = if (ALPACA_ERROR_BASE..=ALPACA_ERROR_MAX).contains(&number) {
        Some((number as u32).wrapping_add(ASCOM_ERROR_NUMBER_OFFSET))
    } else {
        let raw = number as u32;
        let reserved = ASCOM_ERROR_NUMBER_OFFSET + ALPACA_ERROR_BASE as u32
            ..=ASCOM_ERROR_NUMBER_OFFSET + ALPACA_ERROR_MAX as u32;
        reserved.contains(&raw).then_some(raw)
    };
    let kind = if let Some(hresult) = hresult {
        match hresult {
            codes::NOT_IMPLEMENTED => ErrorKind::NotImplemented,
            codes::INVALID_VALUE | codes::INVALID_VALUE_LEGACY => ErrorKind::InvalidValue,
            codes::VALUE_NOT_SET => ErrorKind::ValueNotSet,
            codes::NOT_CONNECTED => ErrorKind::NotConnected,
            codes::INVALID_WHILE_PARKED => ErrorKind::InvalidWhileParked,
            codes::INVALID_WHILE_SLAVED => ErrorKind::InvalidWhileSlaved,
            codes::INVALID_OPERATION => ErrorKind::InvalidOperation,
            codes::ACTION_NOT_IMPLEMENTED => ErrorKind::ActionNotImplemented,
            codes::OPERATION_CANCELLED => ErrorKind::OperationCancelled,
            _ => ErrorKind::RemoteFault,
        }
    } else {
        ErrorKind::RemoteFault
    };

    DeviceFault {
        kind,
        number,
        message: message.to_string(),
    }
}

/// Failures of the image array codec
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("response has no content type")]
    MissingContentType,

    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' has an unexpected shape: {detail}")]
    InvalidField { field: &'static str, detail: String },

    #[error("unsupported array rank {0}, expected 2 or 3")]
    UnsupportedRank(i64),

    #[error("unsupported element type code {0}")]
    UnsupportedElementType(i32),

    #[error("cannot widen transmission type {transmission:?} to image type {image:?}")]
    UnsupportedTransmission {
        image: crate::ImageElementType,
        transmission: crate::ImageElementType,
    },

    #[error("array is not rectangular: {0}")]
    NotRectangular(String),

    #[error("element in row {row} does not fit the declared type {element_type:?}")]
    InvalidElement {
        row: usize,
        element_type: crate::ImageElementType,
    },

    #[error("payload is {actual} bytes but the declared dimensions need {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("dimension {0:?} overflows the addressable size")]
    DimensionOverflow(Vec<usize>),

    #[error("metadata header needs {expected} bytes, got {actual}")]
    HeaderTooShort { expected: usize, actual: usize },

    #[error("unsupported ImageBytes metadata version {0}")]
    UnsupportedMetadataVersion(i32),

    #[error("base64 decode failed: {0}")]
    Base64(String),

    #[error("invalid response envelope: {0}")]
    InvalidEnvelope(String),
}

/// Alpaca-specific error types
#[derive(Debug, Error)]
pub enum AlpacaError {
    #[error("{method}: connection to {url} failed: {cause}")]
    Transport {
        method: String,
        url: String,
        cause: String,
    },

    #[error("{method}: timed out after {duration_ms}ms")]
    Timeout { method: String, duration_ms: u64 },

    #[error("{method}: HTTP error {status}: {body}")]
    HttpStatus {
        method: String,
        status: u16,
        body: String,
    },

    #[error("{method}: malformed response: {reason}")]
    MalformedResponse { method: String, reason: String },

    #[error("{method} (client transaction {client_transaction_id}, server transaction {server_transaction_id}): {fault}")]
    Device {
        method: String,
        fault: DeviceFault,
        client_transaction_id: u32,
        server_transaction_id: u32,
    },

    #[error("{method}: driver exception: {message}")]
    RemoteDriverFault { method: String, message: String },

    #[error("{method}: request failed: {cause}")]
    Request { method: String, cause: String },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AlpacaError {
    /// Create a timeout error with operation context
    pub fn timeout(method: impl Into<String>, duration_ms: u64) -> Self {
        AlpacaError::Timeout {
            method: method.into(),
            duration_ms,
        }
    }

    /// Create a malformed response error
    pub fn malformed(method: impl Into<String>, reason: impl fmt::Display) -> Self {
        AlpacaError::MalformedResponse {
            method: method.into(),
            reason: reason.to_string(),
        }
    }

    /// Only connection-level failures and timeouts are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            AlpacaError::Transport { .. } => true,
            AlpacaError::Timeout { .. } => true,
            AlpacaError::HttpStatus { .. } => false,
            AlpacaError::MalformedResponse { .. } => false,
            AlpacaError::Device { .. } => false,
            AlpacaError::RemoteDriverFault { .. } => false,
            AlpacaError::Request { .. } => false,
            AlpacaError::Configuration(_) => false,
        }
    }

    /// Translated kind for device errors
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AlpacaError::Device { fault, .. } => Some(fault.kind),
            _ => None,
        }
    }
}

impl From<AlpacaError> for String {
    fn from(err: AlpacaError) -> Self {
        err.to_string()
    }
}
