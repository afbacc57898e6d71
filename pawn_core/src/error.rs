//! Error codes and result definitions for the pawn engine.
//!
//! Every failure the engine can report is one of a small, stable set of
//! integer codes. Generated code and the interpreter traffic in raw
//! [`ErrorCode`] values; API boundaries wrap them in [`PawnError`] so callers
//! get a message alongside the code.
//!
//! The codes fall into a few families:
//! - Format errors (bad, too old or too new binary, decompression failure)
//! - Resource errors (stack/heap low or min, out of memory, array too big)
//! - Instruction errors (invalid instruction, native, address or parameter)
//! - Arithmetic errors (divide by zero, integer overflow)
//! - Control errors (not runnable, aborted, timeout)
//! - Leak errors (stack leak, heap leak)

use std::fmt;
use thiserror::Error;

/// The result type used by fallible engine APIs.
pub type PawnResult<T> = Result<T, PawnError>;

/// Stable engine error codes.
///
/// The discriminants are part of the native-code ABI: compiled functions
/// return them in `eax`, so they must never be renumbered.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    None = 0,
    FileFormat = 1,
    Decompressor = 2,
    HeapLow = 3,
    Param = 4,
    InvalidAddress = 5,
    NotFound = 6,
    Index = 7,
    StackLow = 8,
    NotDebugging = 9,
    InvalidInstruction = 10,
    MemAccess = 11,
    StackMin = 12,
    HeapMin = 13,
    DivideByZero = 14,
    ArrayBounds = 15,
    InstructionParam = 16,
    StackLeak = 17,
    HeapLeak = 18,
    ArrayTooBig = 19,
    TrackerBounds = 20,
    InvalidNative = 21,
    ParamsMax = 22,
    Native = 23,
    NotRunnable = 24,
    Aborted = 25,
    VersionTooLow = 26,
    VersionTooHigh = 27,
    OutOfMemory = 28,
    IntegerOverflow = 29,
    Timeout = 30,
    /// Unrecoverable engine failure.
    Fatal = 53,
}

const ERROR_MESSAGES: [&str; 31] = [
    "No error",
    "Unrecognizable file format",
    "Decompressor was not found",
    "Not enough space on the heap",
    "Invalid parameter or parameter type",
    "Invalid plugin address",
    "Object or index not found",
    "Invalid index or index not found",
    "Not enough space on the stack",
    "Debug section not found or debug not enabled",
    "Invalid instruction",
    "Invalid memory access",
    "Stack went below stack boundary",
    "Heap went below heap boundary",
    "Divide by zero",
    "Array index is out of bounds",
    "Instruction contained invalid parameter",
    "Stack memory leaked by native",
    "Heap memory leaked by native",
    "Dynamic array is too big",
    "Tracker stack is out of bounds",
    "Native is not bound",
    "Maximum number of parameters reached",
    "Native detected error",
    "Plugin not runnable",
    "Call was aborted",
    "Plugin format is too old",
    "Plugin format is too new",
    "Out of memory",
    "Integer overflow",
    "Script execution timed out",
];

impl ErrorCode {
    /// All codes in the contiguous 0..=30 range, indexed by value.
    const TABLE: [ErrorCode; 31] = [
        ErrorCode::None,
        ErrorCode::FileFormat,
        ErrorCode::Decompressor,
        ErrorCode::HeapLow,
        ErrorCode::Param,
        ErrorCode::InvalidAddress,
        ErrorCode::NotFound,
        ErrorCode::Index,
        ErrorCode::StackLow,
        ErrorCode::NotDebugging,
        ErrorCode::InvalidInstruction,
        ErrorCode::MemAccess,
        ErrorCode::StackMin,
        ErrorCode::HeapMin,
        ErrorCode::DivideByZero,
        ErrorCode::ArrayBounds,
        ErrorCode::InstructionParam,
        ErrorCode::StackLeak,
        ErrorCode::HeapLeak,
        ErrorCode::ArrayTooBig,
        ErrorCode::TrackerBounds,
        ErrorCode::InvalidNative,
        ErrorCode::ParamsMax,
        ErrorCode::Native,
        ErrorCode::NotRunnable,
        ErrorCode::Aborted,
        ErrorCode::VersionTooLow,
        ErrorCode::VersionTooHigh,
        ErrorCode::OutOfMemory,
        ErrorCode::IntegerOverflow,
        ErrorCode::Timeout,
    ];

    /// Map a raw code back to the enum. Unknown values become `Fatal`.
    #[inline]
    pub fn from_i32(raw: i32) -> ErrorCode {
        match usize::try_from(raw) {
            Ok(idx) if idx < Self::TABLE.len() => Self::TABLE[idx],
            _ => ErrorCode::Fatal,
        }
    }

    /// The raw integer value.
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Human-readable description.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Fatal => "Fatal error",
            code => ERROR_MESSAGES[code as usize],
        }
    }

    /// Whether this code denotes success.
    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, ErrorCode::None)
    }

    /// Convert a raw status into a `Result`.
    #[inline]
    pub fn check(raw: i32) -> Result<(), ErrorCode> {
        match raw {
            0 => Ok(()),
            other => Err(ErrorCode::from_i32(other)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Error type returned across the public API.
#[derive(Error, Debug)]
pub enum PawnError {
    /// A script or engine error with its code.
    #[error("{message}")]
    Vm {
        /// The error code.
        code: ErrorCode,
        /// Description, usually the code's message or a native's text.
        message: String,
    },

    /// A binary could not be loaded.
    #[error("failed to load binary: {reason}")]
    Load {
        /// The error code (format, version, decompressor).
        code: ErrorCode,
        /// What was wrong with the file.
        reason: String,
    },

    /// Reading a binary from disk failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PawnError {
    /// Build a load error.
    pub fn load(code: ErrorCode, reason: impl Into<String>) -> Self {
        PawnError::Load {
            code,
            reason: reason.into(),
        }
    }

    /// The underlying error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            PawnError::Vm { code, .. } | PawnError::Load { code, .. } => *code,
            PawnError::Io(_) => ErrorCode::FileFormat,
        }
    }
}

impl From<ErrorCode> for PawnError {
    fn from(code: ErrorCode) -> Self {
        PawnError::Vm {
            code,
            message: code.message().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_codes() {
        for raw in 0..=30 {
            assert_eq!(ErrorCode::from_i32(raw).as_i32(), raw);
        }
        assert_eq!(ErrorCode::from_i32(31), ErrorCode::Fatal);
        assert_eq!(ErrorCode::from_i32(-1), ErrorCode::Fatal);
    }

    #[test]
    fn test_messages() {
        assert_eq!(ErrorCode::DivideByZero.message(), "Divide by zero");
        assert_eq!(ErrorCode::Timeout.message(), "Script execution timed out");
        assert_eq!(ErrorCode::Fatal.to_string(), "Fatal error");
    }

    #[test]
    fn test_check() {
        assert!(ErrorCode::check(0).is_ok());
        assert_eq!(ErrorCode::check(14), Err(ErrorCode::DivideByZero));
    }

    #[test]
    fn test_pawn_error_code() {
        let err: PawnError = ErrorCode::HeapLeak.into();
        assert_eq!(err.code(), ErrorCode::HeapLeak);
        assert_eq!(err.to_string(), "Heap memory leaked by native");

        let err = PawnError::load(ErrorCode::VersionTooLow, "version 0x0101");
        assert_eq!(err.code(), ErrorCode::VersionTooLow);
        assert!(err.to_string().contains("0x0101"));
    }
}
