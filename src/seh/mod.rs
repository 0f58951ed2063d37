//! # Architecture
//!
//! - [`context`] - Marshalling between the register file and a guest `CONTEXT` record
//! - [`record`] - The `EXCEPTION_RECORD` header written for every fault
//! - [`frame`] - SEH frames, tagged real or synthetic
//! - [`dispatcher`] - The fault/resume state machine
//! - [`chain`] - Bounded, read-only traversal of the chain for diagnostics
//!
//! # Protocol
//!
//! When the emulator traps a fault it calls
//! [`EmulatedProcess::dispatch`](crate::process::EmulatedProcess::dispatch). The dispatcher
//! reserves a frame below the faulting stack pointer, saves the registers into a `CONTEXT`,
//! writes an `EXCEPTION_RECORD`, pushes the four handler arguments and points `EIP` at the
//! handler of the current chain head. A synthetic frame is installed as the new chain head for
//! the duration of the handler.
//!
//! The handler returns to the return trampoline address. The emulator recognizes it and calls
//! [`EmulatedProcess::return_from_handler`](crate::process::EmulatedProcess::return_from_handler),
//! which restores the chain head and, for `ExceptionContinueExecution`, the register context.
//! Every other disposition halts the process.

pub mod chain;
pub mod context;
pub mod dispatcher;
pub mod frame;
pub mod record;

pub use chain::{ChainEnd, SehChain};
pub use dispatcher::{DispatchState, SehDispatcher};
pub use frame::{FrameKind, SehFrame};
pub use record::ExceptionRecord;

use std::fmt;

use strum::{Display, EnumIter, FromRepr};

/// Exception codes raised by the emulated CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u32)]
pub enum ExceptionCode {
    /// `EXCEPTION_BREAKPOINT`, raised by `int3`.
    #[strum(serialize = "EXCEPTION_BREAKPOINT")]
    Breakpoint = 0x8000_0003,
    /// `EXCEPTION_ACCESS_VIOLATION`.
    #[strum(serialize = "EXCEPTION_ACCESS_VIOLATION")]
    AccessViolation = 0xC000_0005,
    /// `EXCEPTION_ILLEGAL_INSTRUCTION`.
    #[strum(serialize = "EXCEPTION_ILLEGAL_INSTRUCTION")]
    IllegalInstruction = 0xC000_001D,
    /// `EXCEPTION_INT_DIVIDE_BY_ZERO`.
    #[strum(serialize = "EXCEPTION_INT_DIVIDE_BY_ZERO")]
    IntDivideByZero = 0xC000_0094,
    /// `EXCEPTION_PRIV_INSTRUCTION`.
    #[strum(serialize = "EXCEPTION_PRIV_INSTRUCTION")]
    PrivilegedInstruction = 0xC000_0096,
}

impl From<ExceptionCode> for u32 {
    fn from(code: ExceptionCode) -> Self {
        code as u32
    }
}

/// Value a guest handler returns in `EAX`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerDisposition {
    /// `ExceptionContinueExecution` (0): resume with the saved context.
    ContinueExecution,
    /// `ExceptionContinueSearch` (1): try the next handler up the chain.
    ContinueSearch,
    /// `ExceptionNestedException` (2).
    NestedException,
    /// `ExceptionCollidedUnwind` (3).
    CollidedUnwind,
    /// `EXCEPTION_EXECUTE_HANDLER` seen from a frame-based handler (-1): unwind to the frame.
    Unwind,
    /// Any other value.
    Other(u32),
}

impl fmt::Display for HandlerDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerDisposition::ContinueExecution => write!(f, "ExceptionContinueExecution"),
            HandlerDisposition::ContinueSearch => write!(f, "ExceptionContinueSearch"),
            HandlerDisposition::NestedException => write!(f, "ExceptionNestedException"),
            HandlerDisposition::CollidedUnwind => write!(f, "ExceptionCollidedUnwind"),
            HandlerDisposition::Unwind => write!(f, "decline and unwind"),
            HandlerDisposition::Other(value) => write!(f, "unknown disposition 0x{value:08X}"),
        }
    }
}

impl HandlerDisposition {
    /// Decodes the raw `EAX` value.
    #[must_use]
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => HandlerDisposition::ContinueExecution,
            1 => HandlerDisposition::ContinueSearch,
            2 => HandlerDisposition::NestedException,
            3 => HandlerDisposition::CollidedUnwind,
            0xFFFF_FFFF => HandlerDisposition::Unwind,
            other => HandlerDisposition::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn exception_codes() {
        assert_eq!(u32::from(ExceptionCode::AccessViolation), 0xC000_0005);
        assert_eq!(ExceptionCode::from_repr(0xC000_0094), Some(ExceptionCode::IntDivideByZero));
        assert_eq!(ExceptionCode::from_repr(0x1234), None);
        assert_eq!(ExceptionCode::iter().count(), 5);
        assert_eq!(ExceptionCode::Breakpoint.to_string(), "EXCEPTION_BREAKPOINT");
    }

    #[test]
    fn dispositions() {
        assert_eq!(HandlerDisposition::from_raw(0), HandlerDisposition::ContinueExecution);
        assert_eq!(HandlerDisposition::from_raw(1), HandlerDisposition::ContinueSearch);
        assert_eq!(HandlerDisposition::from_raw(u32::MAX), HandlerDisposition::Unwind);
        assert_eq!(HandlerDisposition::from_raw(7), HandlerDisposition::Other(7));
        assert_eq!(
            HandlerDisposition::Other(7).to_string(),
            "unknown disposition 0x00000007"
        );
    }
}
