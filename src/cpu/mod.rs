//! The dispatcher needs exactly three things from the CPU emulator: read and write access to
//! the general purpose and segment registers, the pending fault code, and the ability to point
//! a segment selector at a base address. [`CpuState`] captures that contract;
//! [`RegisterFile`] is a plain implementation for tests and for emulators that keep their
//! architectural state in a separate structure anyway.

use std::collections::HashMap;

use strum::{Display, EnumIter};

/// Registers of the 32-bit x86 register file.
///
/// Segment registers hold their 16-bit selector zero-extended to 32 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Register {
    /// Accumulator, also the handler's return value.
    Eax,
    /// Base register.
    Ebx,
    /// Counter register.
    Ecx,
    /// Data register.
    Edx,
    /// Source index.
    Esi,
    /// Destination index.
    Edi,
    /// Frame pointer.
    Ebp,
    /// Stack pointer.
    Esp,
    /// Instruction pointer.
    Eip,
    /// Flags register.
    EFlags,
    /// Code segment selector.
    Cs,
    /// Data segment selector.
    Ds,
    /// Extra segment selector.
    Es,
    /// FS selector, whose base is the thread information block.
    Fs,
    /// GS selector.
    Gs,
    /// Stack segment selector.
    Ss,
}

/// Architectural CPU state as seen by the process environment.
pub trait CpuState {
    /// Returns the value of `register`.
    fn reg(&self, register: Register) -> u32;

    /// Sets `register` to `value`.
    fn set_reg(&mut self, register: Register, value: u32);

    /// Returns the pending fault code raised by instruction execution, `0` if none.
    fn pending_exception(&self) -> u32;

    /// Clears the pending fault.
    fn clear_exception(&mut self);

    /// Makes segment `selector` resolve to linear address `base`.
    fn set_segment_base(&mut self, selector: u16, base: u32);
}

/// A plain in-memory register file.
///
/// # Example
///
/// ```rust
/// use ntenv::cpu::{CpuState, Register, RegisterFile};
///
/// let mut cpu = RegisterFile::new();
/// cpu.set_reg(Register::Esp, 0x0012_F000);
/// assert_eq!(cpu.reg(Register::Esp), 0x0012_F000);
/// assert_eq!(cpu.reg(Register::Eax), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct RegisterFile {
    registers: HashMap<Register, u32>,
    segment_bases: HashMap<u16, u32>,
    exception: u32,
}

impl RegisterFile {
    /// Creates a register file with every register set to zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending fault, as the execution loop would on a trapping instruction.
    pub fn raise_exception(&mut self, code: u32) {
        self.exception = code;
    }

    /// Returns the base address a segment selector was pointed at, if any.
    #[must_use]
    pub fn segment_base(&self, selector: u16) -> Option<u32> {
        self.segment_bases.get(&selector).copied()
    }
}

impl CpuState for RegisterFile {
    fn reg(&self, register: Register) -> u32 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    fn set_reg(&mut self, register: Register, value: u32) {
        self.registers.insert(register, value);
    }

    fn pending_exception(&self) -> u32 {
        self.exception
    }

    fn clear_exception(&mut self) {
        self.exception = 0;
    }

    fn set_segment_base(&mut self, selector: u16, base: u32) {
        self.segment_bases.insert(selector, base);
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn registers_default_to_zero() {
        let cpu = RegisterFile::new();
        assert!(Register::iter().all(|r| cpu.reg(r) == 0));
    }

    #[test]
    fn exception_latch() {
        let mut cpu = RegisterFile::new();
        cpu.raise_exception(0xC000_001D);
        assert_eq!(cpu.pending_exception(), 0xC000_001D);
        cpu.clear_exception();
        assert_eq!(cpu.pending_exception(), 0);
    }

    #[test]
    fn segment_bases() {
        let mut cpu = RegisterFile::new();
        assert_eq!(cpu.segment_base(0x4), None);
        cpu.set_segment_base(0x4, 0x7FF7_0000);
        assert_eq!(cpu.segment_base(0x4), Some(0x7FF7_0000));
        assert_eq!(Register::EFlags.to_string(), "eflags");
    }
}
