/// Error-recovery flags and retry policy
///
/// Recovery is opt-in and split along the same line as the error taxonomy:
/// LINK recovery reconnects after connection-category failures, PROTOCOL
/// recovery flushes and retransmits after integrity failures and discards
/// mismatched confirmations. Both engine sides consult [`RetryPolicy`]
/// instead of inspecting errors themselves, so the rules cannot drift
/// between the client and server paths.
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::ModbusError;

/// Combinable recovery flag pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorRecovery {
    link: bool,
    protocol: bool,
}

impl ErrorRecovery {
    /// No recovery: the first failure of any kind is surfaced
    pub const NONE: ErrorRecovery = ErrorRecovery {
        link: false,
        protocol: false,
    };

    /// Reconnect and resend once after connection failures
    pub const LINK: ErrorRecovery = ErrorRecovery {
        link: true,
        protocol: false,
    };

    /// Flush and retransmit once after integrity failures; discard
    /// mismatched confirmations and keep waiting
    pub const PROTOCOL: ErrorRecovery = ErrorRecovery {
        link: false,
        protocol: true,
    };

    pub fn link(&self) -> bool {
        self.link
    }

    pub fn protocol(&self) -> bool {
        self.protocol
    }
}

impl BitOr for ErrorRecovery {
    type Output = ErrorRecovery;

    fn bitor(self, rhs: ErrorRecovery) -> ErrorRecovery {
        ErrorRecovery {
            link: self.link || rhs.link,
            protocol: self.protocol || rhs.protocol,
        }
    }
}

/// Decides, per error, which recovery action (if any) applies
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    recovery: ErrorRecovery,
}

impl RetryPolicy {
    pub fn new(recovery: ErrorRecovery) -> Self {
        RetryPolicy { recovery }
    }

    pub fn recovery(&self) -> ErrorRecovery {
        self.recovery
    }

    pub fn set_recovery(&mut self, recovery: ErrorRecovery) {
        self.recovery = recovery;
    }

    /// Close, reconnect and resend the pending frame
    pub fn should_reconnect(&self, error: &ModbusError) -> bool {
        self.recovery.link() && error.is_connection_error()
    }

    /// Flush stale input and retransmit the pending request
    pub fn should_retransmit(&self, error: &ModbusError) -> bool {
        self.recovery.protocol() && error.is_integrity_error()
    }

    /// Discard the frame and keep waiting for the real confirmation
    pub fn should_reread(&self, error: &ModbusError) -> bool {
        self.recovery.protocol() && error.is_confirmation_mismatch()
    }
}
