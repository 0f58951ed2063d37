//! # ntenv Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the ntenv library. Import this module to get quick access to everything a driving
//! emulator needs to build a process and forward faults to it.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all ntenv operations
pub use crate::Error;

/// The result type used throughout ntenv
pub use crate::Result;

// ================================================================================================
// Collaborator Seams
// ================================================================================================

/// Guest memory trait and the page-backed reference implementation
pub use crate::memory::{AddressSpace, GuestMemory, MemoryProtection};

/// Register names, the CPU trait and the plain register file
pub use crate::cpu::{CpuState, Register, RegisterFile};

/// Module metadata supplied by the image parser
pub use crate::image::Module;

// ================================================================================================
// Process Environment
// ================================================================================================

/// Process state, builder and configuration
pub use crate::process::{
    EmulatedProcess, LayoutPlan, LoaderList, ModuleId, ModuleRegistry, ProcessBuilder,
    ProcessConfig,
};

// ================================================================================================
// Structured Exception Handling
// ================================================================================================

/// Exception codes, dispositions, frames and dispatcher state
pub use crate::seh::{
    ChainEnd, DispatchState, ExceptionCode, ExceptionRecord, FrameKind, HandlerDisposition,
    SehChain, SehFrame,
};
