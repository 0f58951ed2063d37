// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # ntenv
//!
//! A simulated Windows x86 process environment for code running inside a CPU emulator.
//!
//! Guest programs expect to find a number of OS-owned structures in their address space: the
//! thread information block reachable through `fs:[0]`, the process environment block, the
//! loader's three module lists, the process parameters and environment strings. They also expect
//! that a hardware fault ends up in the exception handler they registered on the SEH chain, and
//! that returning `ExceptionContinueExecution` from that handler resumes execution with the
//! (possibly edited) register context. `ntenv` provides both halves:
//!
//! - **Process structures** - materialized byte-for-byte at the 32-bit Windows ABI offsets
//! - **SEH dispatch** - fault → handler call frame → resume, with explicit failure on the
//!   dispositions that would need multi-frame search or unwinding
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ntenv::prelude::*;
//!
//! let memory = AddressSpace::new();
//! let mut cpu = RegisterFile::new();
//!
//! let mut process = ProcessBuilder::new()
//!     .main_module("c:\\app\\app.exe")
//!     .module_file("c:\\app\\app.exe")
//!     .build()?;
//! process.initialize(&memory)?;
//! process.seed_fs_segment(&mut cpu);
//!
//! // ... the emulator traps an access violation ...
//! let handler = process.dispatch(&mut cpu, &memory, ExceptionCode::AccessViolation.into())?;
//! println!("guest handler at 0x{handler:08X}");
//! # Ok::<(), ntenv::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`memory`] - The guest memory seam ([`memory::GuestMemory`]) and a page-backed
//!   [`memory::AddressSpace`]
//! - [`cpu`] - The register file seam ([`cpu::CpuState`]) and a plain [`cpu::RegisterFile`]
//! - [`image`] - Module metadata as supplied by an image parser
//! - [`process`] - Layout plan, module registry, structure builder and the
//!   [`process::EmulatedProcess`] state object
//! - [`seh`] - Context marshalling, the dispatcher state machine and the chain walker
//!
//! ## Fidelity Gaps
//!
//! EFLAGS, floating point state and debug registers are never captured into or restored from
//! the exception context. Handler dispositions other than continue-execution halt the process
//! with [`Error::UnsupportedDisposition`].

#[macro_use]
pub(crate) mod error;
pub(crate) mod utils;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
pub mod prelude;

/// Register file of the emulated 32-bit x86 CPU.
///
/// Defines the [`cpu::Register`] names the environment reads and writes, the [`cpu::CpuState`]
/// trait a CPU emulator implements to expose its registers and fault state, and
/// [`cpu::RegisterFile`], a plain in-memory implementation.
pub mod cpu;

/// Image metadata consumed by the structure builder.
///
/// A [`image::Module`] carries the five values the loader structures need: image base, entry
/// point, image size, declared name and on-disk path. Modules can be constructed directly or
/// parsed from PE32 images.
pub mod image;

/// Guest memory seam and page-backed reference implementation.
pub mod memory;

/// The emulated process: layout plan, module registry, structure builder and process state.
pub mod process;

/// Structured exception handling: context records, dispatcher and chain walker.
pub mod seh;

/// `ntenv` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `ntenv` Error type
///
/// The main error type for all operations in this crate.
pub use error::Error;
