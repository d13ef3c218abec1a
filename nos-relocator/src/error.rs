//! Relocator error handling
//!
//! This module defines the error type shared by the planner, the trampoline
//! compiler and the launcher.

use core::fmt;

use crate::state::{BootStateKind, CpuMode};
use crate::template::Operand;

/// Relocator error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocatorError {
    /// No candidate window satisfies the allocation constraints
    OutOfMemory,

    /// A patched value does not fit the operand slot of its template
    OperandOutOfRange {
        /// Template being patched
        template: &'static str,
        /// Operand slot
        operand: Operand,
        /// Rejected value
        value: u64,
    },

    /// Allocation attempted after the program was compiled
    UseAfterFreeze,

    /// A fixed allocation collides with memory that is not free
    Overlap {
        /// First byte of the colliding range
        start: u64,
        /// One past the last byte of the colliding range
        end: u64,
    },

    /// Malformed allocation request
    InvalidArgument(&'static str),

    /// Boot state cannot be compiled as given
    InvalidBootState(&'static str),

    /// The loader's CPU mode cannot reach the requested boot state
    UnsupportedTransition {
        /// Mode the loader runs in
        from: CpuMode,
        /// Requested handoff
        to: BootStateKind,
    },

    /// The program chunk cannot be written at its target address
    NotDirectlyAddressable {
        /// Target the program was placed at
        target: u64,
    },

    /// The program does not fit the window its epilogue runs in
    ProgramTooLarge {
        /// Bytes required
        size: u64,
        /// Bytes available
        limit: u64,
    },

    /// Chunk handle does not belong to this relocator
    UnknownChunk,

    /// No global relocator context installed
    NotInitialized,

    /// A template patch point had no value to write
    UnresolvedOperand(Operand),
}

impl RelocatorError {
    /// Convert to an error code suitable for passing to firmware
    pub fn as_error_code(&self) -> u32 {
        match self {
            RelocatorError::OutOfMemory => 0x2002,
            RelocatorError::OperandOutOfRange { .. } => 0x2100,
            RelocatorError::UseAfterFreeze => 0x2101,
            RelocatorError::Overlap { .. } => 0x2102,
            RelocatorError::InvalidArgument(_) => 0x2103,
            RelocatorError::InvalidBootState(_) => 0x2104,
            RelocatorError::UnsupportedTransition { .. } => 0x2105,
            RelocatorError::NotDirectlyAddressable { .. } => 0x2106,
            RelocatorError::ProgramTooLarge { .. } => 0x2107,
            RelocatorError::UnknownChunk => 0x2108,
            RelocatorError::NotInitialized => 0xE000,
            RelocatorError::UnresolvedOperand(_) => 0xE001,
        }
    }

    /// Get a human-readable description of the error
    pub fn description(&self) -> &'static str {
        match self {
            RelocatorError::OutOfMemory => "Out of memory",
            RelocatorError::OperandOutOfRange { .. } => "Operand does not fit its template slot",
            RelocatorError::UseAfterFreeze => "Relocator already compiled",
            RelocatorError::Overlap { .. } => "Requested range is not free",
            RelocatorError::InvalidArgument(msg) => msg,
            RelocatorError::InvalidBootState(msg) => msg,
            RelocatorError::UnsupportedTransition { .. } => "Unsupported CPU mode transition",
            RelocatorError::NotDirectlyAddressable { .. } => {
                "Program chunk is not directly addressable"
            }
            RelocatorError::ProgramTooLarge { .. } => "Program too large for its window",
            RelocatorError::UnknownChunk => "Unknown chunk",
            RelocatorError::NotInitialized => "Relocator context not installed",
            RelocatorError::UnresolvedOperand(_) => "Unresolved template operand",
        }
    }

    /// Whether the caller may retry the same boot attempt with relaxed constraints
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RelocatorError::OutOfMemory | RelocatorError::Overlap { .. })
    }
}

impl fmt::Display for RelocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocatorError::OperandOutOfRange { template, operand, value } => {
                write!(
                    f,
                    "{}: {:?} = {:#x} in template {}",
                    self.description(),
                    operand,
                    value,
                    template
                )
            }
            RelocatorError::Overlap { start, end } => {
                write!(f, "{}: [{:#x}, {:#x})", self.description(), start, end)
            }
            RelocatorError::UnsupportedTransition { from, to } => {
                write!(f, "{}: {:?} -> {:?}", self.description(), from, to)
            }
            RelocatorError::NotDirectlyAddressable { target } => {
                write!(f, "{} at {:#x}", self.description(), target)
            }
            RelocatorError::ProgramTooLarge { size, limit } => {
                write!(f, "{}: {} > {} bytes", self.description(), size, limit)
            }
            RelocatorError::UnresolvedOperand(operand) => {
                write!(f, "{}: {:?}", self.description(), operand)
            }
            _ => f.write_str(self.description()),
        }
    }
}

/// Result type used throughout the relocator
pub type Result<T> = core::result::Result<T, RelocatorError>;
