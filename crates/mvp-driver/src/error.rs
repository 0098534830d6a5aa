//! Error types for MVP driver operations

use thiserror::Error;

/// Result type alias for MVP operations
pub type Result<T> = std::result::Result<T, MvpError>;

/// Status class reported to kernel callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed caller input.
    InvalidParameter,
    /// A derived quantity exceeds a hardware or precision limit.
    InvalidRange,
    /// Unclassified failure or unsupported request.
    Fail,
}

/// Fault class latched by the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Loop configuration fault.
    Loop,
    /// Bus error on a load or store.
    BusError,
    /// Misaligned load or store.
    BusAlignment,
    /// ALU fault (operation not available).
    Alu,
    /// Array descriptor fault.
    Array,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loop => write!(f, "loop fault"),
            Self::BusError => write!(f, "bus error"),
            Self::BusAlignment => write!(f, "bus alignment fault"),
            Self::Alu => write!(f, "ALU fault"),
            Self::Array => write!(f, "array fault"),
        }
    }
}

/// Errors that can occur while building or running MVP programs
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MvpError {
    /// Malformed input: misaligned buffer, forbidden padding, bad bounds,
    /// exhausted builder slot budget
    #[error("Invalid parameter: {reason}")]
    InvalidParameter {
        /// What was wrong
        reason: String,
    },

    /// A size, stride, loop count or scale factor is out of range
    #[error("Invalid range: {reason}")]
    InvalidRange {
        /// What was out of range
        reason: String,
    },

    /// Unsupported or unclassified failure
    #[error("Failed: {reason}")]
    Fail {
        /// Reason for failure
        reason: String,
    },

    /// Program slot or builder used in the wrong state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Accelerator reported a fault while running a program
    #[error("{kind} at pc {pc} (address {address:#010x})")]
    Fault {
        /// Fault class
        kind: FaultKind,
        /// Instruction index
        pc: usize,
        /// Faulting bus address, 0 when no access was involved
        address: u32,
    },

    /// Device memory arena exhausted
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Bytes left
        available: usize,
    },

    /// Access outside device memory
    #[error("Bad device address {address:#010x} (+{len} bytes)")]
    BadAddress {
        /// Start address
        address: u32,
        /// Access length
        len: usize,
    },
}

impl MvpError {
    /// Create an invalid parameter error
    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            reason: reason.into(),
        }
    }

    /// Create an invalid range error
    pub fn invalid_range(reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            reason: reason.into(),
        }
    }

    /// Create a generic failure
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Status class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter { .. } | Self::BadAddress { .. } => ErrorKind::InvalidParameter,
            Self::InvalidRange { .. } | Self::OutOfMemory { .. } => ErrorKind::InvalidRange,
            Self::Fail { .. } | Self::InvalidState { .. } | Self::Fault { .. } => ErrorKind::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(MvpError::invalid_parameter("x").kind(), ErrorKind::InvalidParameter);
        assert_eq!(MvpError::invalid_range("x").kind(), ErrorKind::InvalidRange);
        assert_eq!(MvpError::invalid_state("x").kind(), ErrorKind::Fail);
    }

    #[test]
    fn fault_display() {
        let e = MvpError::Fault {
            kind: FaultKind::BusAlignment,
            pc: 3,
            address: 0x2000_0001,
        };
        assert_eq!(e.to_string(), "bus alignment fault at pc 3 (address 0x20000001)");
    }
}
