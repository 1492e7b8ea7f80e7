//! # Modbus Link Error Handling
//!
//! Error taxonomy for the protocol engine. Every failure surfaced by the
//! crate is a [`ModbusError`]; the variants fall into six categories that
//! the retry machinery treats differently:
//!
//! - **Connection**: transport setup and I/O failures (`Io`, `Connection`)
//! - **Timeout**: expired response/byte/indication waits, tagged with the
//!   phase that was waiting
//! - **Integrity**: frames that fail checksum or declared-length validation
//!   (`CrcMismatch`, `LengthMismatch`, `Frame`)
//! - **Confirmation mismatch**: well-formed frames that do not answer the
//!   pending request (wrong transaction id, slave, or function)
//! - **Protocol exception**: exception responses reported by the remote
//!   device; never retried
//! - **Local validation**: arguments rejected before any byte touches the
//!   transport (`TooManyData`, `InvalidArgument`)
//!
//! The category predicates (`is_connection_error`, `is_integrity_error`, ...)
//! are what [`crate::recovery::RetryPolicy`] consults, so the recovery rules
//! live in one place instead of being re-derived per call site.

use thiserror::Error;

use crate::protocol::ModbusException;

/// Result type for all Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Comprehensive error type covering transport, framing and protocol failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// Low-level I/O failure on an established connection
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance failure
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An expired wait; `phase` names what the engine was waiting for
    #[error("Timeout after {timeout_ms}ms while {phase}")]
    Timeout { phase: String, timeout_ms: u64 },

    /// RTU CRC-16 check failed
    #[error("CRC mismatch: computed {computed:#06X}, received {received:#06X}")]
    CrcMismatch { computed: u16, received: u16 },

    /// TCP MBAP declared length disagrees with the bytes on the wire
    #[error("Length mismatch: header declares {declared} bytes, received {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Structurally invalid frame (oversized, truncated, bad byte count)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// A valid frame that does not correspond to the pending request
    #[error("Confirmation mismatch: {message}")]
    ConfirmationMismatch { message: String },

    /// Exception response from the remote device
    #[error("Exception on function 0x{function:02X}: {exception}")]
    Exception {
        function: u8,
        exception: ModbusException,
    },

    /// Exception response carrying a reserved or unknown exception code
    #[error("Invalid exception code: 0x{code:02X}")]
    InvalidExceptionCode { code: u8 },

    /// Requested element count exceeds the protocol limit
    #[error("Too many data: {message}")]
    TooManyData { message: String },

    /// Argument rejected before any I/O was attempted
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Context or transport configuration problem
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        ModbusError::Io {
            message: message.into(),
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        ModbusError::Connection {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(phase: S, timeout_ms: u64) -> Self {
        ModbusError::Timeout {
            phase: phase.into(),
            timeout_ms,
        }
    }

    pub fn crc_mismatch(computed: u16, received: u16) -> Self {
        ModbusError::CrcMismatch { computed, received }
    }

    pub fn length_mismatch(declared: usize, actual: usize) -> Self {
        ModbusError::LengthMismatch { declared, actual }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        ModbusError::Frame {
            message: message.into(),
        }
    }

    pub fn confirmation_mismatch<S: Into<String>>(message: S) -> Self {
        ModbusError::ConfirmationMismatch {
            message: message.into(),
        }
    }

    pub fn exception(function: u8, exception: ModbusException) -> Self {
        ModbusError::Exception {
            function,
            exception,
        }
    }

    pub fn invalid_exception(code: u8) -> Self {
        ModbusError::InvalidExceptionCode { code }
    }

    pub fn too_many_data<S: Into<String>>(message: S) -> Self {
        ModbusError::TooManyData {
            message: message.into(),
        }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        ModbusError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        ModbusError::Configuration {
            message: message.into(),
        }
    }

    /// Connection-category errors; candidates for LINK recovery
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ModbusError::Io { .. } | ModbusError::Connection { .. })
    }

    /// Expired response, byte or indication wait
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModbusError::Timeout { .. })
    }

    /// Frames failing checksum/length/structure validation; candidates for
    /// PROTOCOL recovery (flush and retransmit)
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            ModbusError::CrcMismatch { .. }
                | ModbusError::LengthMismatch { .. }
                | ModbusError::Frame { .. }
        )
    }

    /// Valid frame answering a different request
    pub fn is_confirmation_mismatch(&self) -> bool {
        matches!(self, ModbusError::ConfirmationMismatch { .. })
    }

    /// Exception reported by the remote device
    pub fn is_protocol_exception(&self) -> bool {
        matches!(
            self,
            ModbusError::Exception { .. } | ModbusError::InvalidExceptionCode { .. }
        )
    }

    /// Rejected locally before any I/O
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            ModbusError::TooManyData { .. } | ModbusError::InvalidArgument { .. }
        )
    }

    /// Whether retrying the same operation could plausibly succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ModbusError::Exception { exception, .. } => matches!(
                exception,
                ModbusException::Acknowledge | ModbusException::ServerDeviceBusy
            ),
            ModbusError::TooManyData { .. }
            | ModbusError::InvalidArgument { .. }
            | ModbusError::Configuration { .. }
            | ModbusError::InvalidExceptionCode { .. } => false,
            _ => true,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => ModbusError::connection(err.to_string()),
            _ => ModbusError::io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ModbusError::timeout("waiting for I/O readiness", 0)
    }
}
