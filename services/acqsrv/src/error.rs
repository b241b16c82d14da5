//! Error taxonomy for the acquisition core
//!
//! Each concern has its own enum so callers can contain failures at the
//! smallest scope: a field, a block, a tick, a loop. Only [`SchemaError`] and
//! [`AcqError`] are allowed to stop the process, and only during startup.

use std::time::Duration;

use errors::{ClassifiedError, ErrorCategory};
use thiserror::Error;

use crate::batch::SmeltingState;
use crate::connection::ConnectionState;

/// Result alias for bootstrap code
pub type Result<T, E = AcqError> = std::result::Result<T, E>;

/// Transport level failures (fieldbus socket, serial port)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Item error on {area}: return code 0x{code:02X} ({description})")]
    ItemError {
        area: String,
        code: u8,
        description: &'static str,
    },

    #[error("Transport not open")]
    NotOpen,
}

impl TransportError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }
}

impl ClassifiedError for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "TRANSPORT_IO",
            Self::Timeout { .. } => "TRANSPORT_TIMEOUT",
            Self::Protocol(_) => "TRANSPORT_PROTOCOL",
            Self::ItemError { .. } => "TRANSPORT_ITEM",
            Self::NotOpen => "TRANSPORT_NOT_OPEN",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::NotOpen => ErrorCategory::Io,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Protocol(_) | Self::ItemError { .. } => ErrorCategory::Protocol,
        }
    }

    /// A garbled frame leaves the stream position unknown, so only a
    /// rejected item is worth retrying on the same session
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::ItemError { .. })
    }
}

/// Connection Manager failures
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("Reconnect backing off, next attempt in {remaining:?}")]
    BackingOff { remaining: Duration },

    #[error("Connect to {endpoint} failed: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("Session I/O failed: {0}")]
    Io(#[source] TransportError),

    /// The device answered but refused this item; the session stays up
    #[error("Request rejected: {0}")]
    Rejected(#[source] TransportError),

    #[error("Timed out after {0:?} waiting for the session lock")]
    LockTimeout(Duration),
}

impl ClassifiedError for ConnectionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConnected { .. } => "NOT_CONNECTED",
            Self::BackingOff { .. } => "BACKING_OFF",
            Self::ConnectFailed { .. } => "CONNECT_FAILED",
            Self::Io(_) => "SESSION_IO",
            Self::Rejected(_) => "REQUEST_REJECTED",
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::LockTimeout(_) => ErrorCategory::Timeout,
            Self::Io(inner) | Self::Rejected(inner) => inner.category(),
            _ => ErrorCategory::Connection,
        }
    }
}

/// Hard block-level parse failure
///
/// Per-field failures are not errors: they surface as
/// [`RawValue::Invalid`](crate::parser::RawValue::Invalid) in the field map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Block {block}: buffer too short ({actual} < {expected} bytes)")]
    ShortBuffer {
        block: String,
        expected: usize,
        actual: usize,
    },
}

impl ClassifiedError for ParseError {
    fn error_code(&self) -> &'static str {
        "SHORT_BUFFER"
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Parse
    }

    fn log_level(&self) -> tracing::Level {
        tracing::Level::WARN
    }
}

/// Reason a single quantity is reported as unavailable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("source field '{0}' is missing")]
    MissingField(String),

    #[error("source field '{0}' could not be decoded")]
    InvalidField(String),

    #[error("result is not a finite number")]
    NonFinite,
}

impl ClassifiedError for ConversionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "MISSING_FIELD",
            Self::InvalidField(_) => "INVALID_FIELD",
            Self::NonFinite => "NON_FINITE",
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Conversion
    }
}

/// Serial weighing protocol failures, in validation order
#[derive(Debug, Error)]
pub enum WeighError {
    #[error("No response within {timeout:?}")]
    NoResponse { timeout: Duration },

    #[error("Incomplete response: {actual} of {expected} bytes")]
    Incomplete { expected: usize, actual: usize },

    #[error("Station address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: u8, actual: u8 },

    #[error("Device exception 0x{code:02X} ({}) for function 0x{function:02X}", exception_description(*.code))]
    Exception { function: u8, code: u8 },

    #[error("Function code mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    FunctionMismatch { expected: u8, actual: u8 },

    #[error("Byte count mismatch: expected {expected}, got {actual}")]
    ByteCountMismatch { expected: u8, actual: u8 },

    #[error("CRC mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    ChecksumError { computed: u16, received: u16 },

    #[error("Serial transport: {0}")]
    Transport(#[from] TransportError),
}

/// Standard device exception code descriptions
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

impl ClassifiedError for WeighError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NoResponse { .. } => "NO_RESPONSE",
            Self::Incomplete { .. } => "INCOMPLETE",
            Self::AddressMismatch { .. } => "ADDRESS_MISMATCH",
            Self::Exception { .. } => "DEVICE_EXCEPTION",
            Self::FunctionMismatch { .. } => "FUNCTION_MISMATCH",
            Self::ByteCountMismatch { .. } => "BYTE_COUNT_MISMATCH",
            Self::ChecksumError { .. } => "CHECKSUM_ERROR",
            Self::Transport(_) => "SERIAL_TRANSPORT",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::NoResponse { .. } => ErrorCategory::Timeout,
            Self::Transport(inner) => inner.category(),
            _ => ErrorCategory::Protocol,
        }
    }
}

/// Time-series write failures
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("Write failed: {0}")]
    Write(String),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),
}

impl ClassifiedError for SinkError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Write(_) => "SINK_WRITE",
            Self::Timeout(_) => "SINK_TIMEOUT",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Write(_) => ErrorCategory::Storage,
            Self::Timeout(_) => ErrorCategory::Timeout,
        }
    }
}

/// Batch transition refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("Batch code cannot be empty")]
    EmptyCode,

    #[error("Cannot {action} a batch while {state}")]
    InvalidTransition {
        action: &'static str,
        state: SmeltingState,
    },
}

impl ClassifiedError for BatchError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyCode => "BATCH_EMPTY_CODE",
            Self::InvalidTransition { .. } => "BATCH_INVALID_TRANSITION",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::EmptyCode => ErrorCategory::Configuration,
            Self::InvalidTransition { .. } => ErrorCategory::Protocol,
        }
    }
}

/// Schema document rejected at load time
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Cannot read schema file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid schema document: {0}")]
    Yaml(String),

    #[error("Duplicate block id '{0}'")]
    DuplicateBlock(String),

    #[error("Block {block}: {reason}")]
    InvalidBlock { block: String, reason: String },

    #[error("Block {block}: instance '{instance}' references unknown module '{module}'")]
    UnknownModule {
        block: String,
        instance: String,
        module: String,
    },

    #[error("Block {block}: duplicate field name '{field}'")]
    DuplicateField { block: String, field: String },

    #[error("Block {block}: field '{field}' at {offset}+{width} exceeds block size {size}")]
    OutOfBounds {
        block: String,
        field: String,
        offset: usize,
        width: usize,
        size: usize,
    },

    #[error("Block {block}: fields '{first}' and '{second}' of '{instance}' overlap")]
    Overlap {
        block: String,
        instance: String,
        first: String,
        second: String,
    },

    #[error("Block {block}: field '{field}' overlaps write-only range of '{instance}'")]
    ExcludedOverlap {
        block: String,
        field: String,
        instance: String,
    },

    #[error("Block {block}: field '{field}' has invalid bit index {bit}")]
    InvalidBit { block: String, field: String, bit: u8 },

    #[error("Block {block}: field '{field}' declares width {width} but kind {kind} needs {expected}")]
    WidthMismatch {
        block: String,
        field: String,
        kind: String,
        width: usize,
        expected: usize,
    },

    #[error("Invalid offset '{0}': expected 'byte' or 'byte.bit'")]
    InvalidOffset(String),

    #[error("Block {block}: composite '{composite}' {reason}")]
    InvalidComposite {
        block: String,
        composite: String,
        reason: String,
    },

    #[error("Block {block}: quantity '{quantity}' {reason}")]
    InvalidQuantity {
        block: String,
        quantity: String,
        reason: String,
    },
}

impl From<serde_yaml::Error> for SchemaError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml(err.to_string())
    }
}

impl ClassifiedError for SchemaError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "SCHEMA_IO",
            Self::Yaml(_) => "SCHEMA_SYNTAX",
            Self::DuplicateBlock(_) => "DUPLICATE_BLOCK",
            Self::InvalidBlock { .. } => "INVALID_BLOCK",
            Self::UnknownModule { .. } => "UNKNOWN_MODULE",
            Self::DuplicateField { .. } => "DUPLICATE_FIELD",
            Self::OutOfBounds { .. } => "FIELD_OUT_OF_BOUNDS",
            Self::Overlap { .. } => "FIELD_OVERLAP",
            Self::ExcludedOverlap { .. } => "EXCLUDED_OVERLAP",
            Self::InvalidBit { .. } => "INVALID_BIT",
            Self::WidthMismatch { .. } => "WIDTH_MISMATCH",
            Self::InvalidOffset(_) => "INVALID_OFFSET",
            Self::InvalidComposite { .. } => "INVALID_COMPOSITE",
            Self::InvalidQuantity { .. } => "INVALID_QUANTITY",
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

/// Service bootstrap errors
#[derive(Debug, Error)]
pub enum AcqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Startup failed: {0}")]
    Startup(String),
}

impl AcqError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl ClassifiedError for AcqError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::Schema(inner) => inner.error_code(),
            Self::Io(_) => "IO_ERROR",
            Self::Startup(_) => "STARTUP_FAILED",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::Schema(_) => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Io,
            Self::Startup(_) => ErrorCategory::Internal,
        }
    }
}
