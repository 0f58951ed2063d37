//! Conversion between the live register file and an x86 `CONTEXT` record in guest memory.
//!
//! [`save`] and [`restore`] walk the same field table, [`CONTEXT_FIELDS`], so a context written
//! by one is always read back identically by the other. Only the selectors, the general
//! purpose registers, `EIP` and `ESP` are transferred. Debug registers are written as zero,
//! `EFlags` and the floating point save area stay zero, and on restore those register file
//! entries are left as they are.

use crate::{
    cpu::{CpuState, Register},
    memory::GuestMemory,
    process::structs::context,
    utils::io::{read_le_field, write_le_field},
    Result,
};

/// Registers transferred between the register file and a `CONTEXT`, in record order.
pub const CONTEXT_FIELDS: [(Register, u32); 15] = [
    (Register::Gs, context::SEG_GS),
    (Register::Fs, context::SEG_FS),
    (Register::Es, context::SEG_ES),
    (Register::Ds, context::SEG_DS),
    (Register::Edi, context::EDI),
    (Register::Esi, context::ESI),
    (Register::Ebx, context::EBX),
    (Register::Edx, context::EDX),
    (Register::Ecx, context::ECX),
    (Register::Eax, context::EAX),
    (Register::Ebp, context::EBP),
    (Register::Eip, context::EIP),
    (Register::Cs, context::SEG_CS),
    (Register::Esp, context::ESP),
    (Register::Ss, context::SEG_SS),
];

const DEBUG_REGISTERS: [u32; 6] = [
    context::DR0,
    context::DR1,
    context::DR2,
    context::DR3,
    context::DR6,
    context::DR7,
];

/// Writes a fresh `CONTEXT` for the current register file at `address`.
///
/// # Errors
///
/// Returns an error if the record cannot be written to guest memory.
pub fn save<C, M>(cpu: &C, memory: &M, address: u32) -> Result<()>
where
    C: CpuState + ?Sized,
    M: GuestMemory + ?Sized,
{
    let mut record = vec![0u8; context::SIZE as usize];

    for offset in DEBUG_REGISTERS {
        write_le_field(&mut record, offset as usize, 0u32)?;
    }
    for (register, offset) in CONTEXT_FIELDS {
        write_le_field(&mut record, offset as usize, cpu.reg(register))?;
    }

    memory.write(u64::from(address), &record)
}

/// Loads the transferred registers from the `CONTEXT` at `address` into the register file.
///
/// # Errors
///
/// Returns an error if the record cannot be read from guest memory.
pub fn restore<C, M>(memory: &M, address: u32, cpu: &mut C) -> Result<()>
where
    C: CpuState + ?Sized,
    M: GuestMemory + ?Sized,
{
    let record = memory.read(u64::from(address), context::SIZE as usize)?;
    apply(&record, cpu)
}

/// Loads the transferred registers from a `CONTEXT` already copied out of guest memory.
///
/// # Errors
///
/// Returns [`Error::OutOfBounds`](crate::Error::OutOfBounds) if `record` is shorter than a
/// `CONTEXT`; no register is written in that case.
pub fn apply<C: CpuState + ?Sized>(record: &[u8], cpu: &mut C) -> Result<()> {
    let values = CONTEXT_FIELDS
        .iter()
        .map(|(_, offset)| read_le_field::<u32>(record, *offset as usize))
        .collect::<Result<Vec<_>>>()?;
    for ((register, _), value) in CONTEXT_FIELDS.into_iter().zip(values) {
        cpu.set_reg(register, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        cpu::RegisterFile,
        memory::{AddressSpace, MemoryProtection},
    };

    const CONTEXT_AT: u32 = 0x0012_0000;

    fn stack() -> AddressSpace {
        let memory = AddressSpace::new();
        memory
            .map(
                u64::from(CONTEXT_AT),
                MemoryProtection::READ_WRITE,
                &[0xCC; context::SIZE as usize],
                "stack",
            )
            .unwrap();
        memory
    }

    #[test]
    fn uncovered_fields_are_zero() {
        let memory = stack();
        let mut cpu = RegisterFile::new();
        cpu.set_reg(Register::EFlags, 0x246);
        cpu.set_reg(Register::Eax, 0x1111_1111);

        save(&cpu, &memory, CONTEXT_AT).unwrap();

        let at = |offset: u32| memory.read_u32(u64::from(CONTEXT_AT + offset)).unwrap();
        assert_eq!(at(context::EFLAGS), 0);
        assert_eq!(at(context::CONTEXT_FLAGS), 0);
        for offset in DEBUG_REGISTERS {
            assert_eq!(at(offset), 0);
        }
        assert_eq!(at(context::FLOAT_SAVE), 0);
        assert_eq!(at(context::EAX), 0x1111_1111);
    }

    #[test]
    fn restore_leaves_uncovered_registers() {
        let memory = stack();
        let mut cpu = RegisterFile::new();
        cpu.set_reg(Register::Eip, 0x0040_1000);
        save(&cpu, &memory, CONTEXT_AT).unwrap();

        cpu.set_reg(Register::EFlags, 0x202);
        cpu.set_reg(Register::Eip, 0xDEAD_0000);
        restore(&memory, CONTEXT_AT, &mut cpu).unwrap();

        assert_eq!(cpu.reg(Register::Eip), 0x0040_1000);
        assert_eq!(cpu.reg(Register::EFlags), 0x202);
    }

    #[test]
    fn unmapped_target_fails() {
        let memory = AddressSpace::new();
        let cpu = RegisterFile::new();
        assert!(save(&cpu, &memory, CONTEXT_AT).is_err());
    }

    #[test]
    fn short_record_writes_nothing() {
        let mut cpu = RegisterFile::new();
        cpu.set_reg(Register::Gs, 0x2B);

        let record = [0u8; 0xC0];
        assert!(apply(&record, &mut cpu).is_err());
        assert_eq!(cpu.reg(Register::Gs), 0x2B);
    }

    proptest! {
        #[test]
        fn save_restore_reproduces_covered_fields(values in proptest::collection::vec(any::<u32>(), 15)) {
            let memory = stack();
            let mut original = RegisterFile::new();
            for ((register, _), value) in CONTEXT_FIELDS.iter().zip(&values) {
                original.set_reg(*register, *value);
            }

            save(&original, &memory, CONTEXT_AT).unwrap();

            let mut restored = RegisterFile::new();
            restore(&memory, CONTEXT_AT, &mut restored).unwrap();

            for (register, _) in CONTEXT_FIELDS {
                prop_assert_eq!(restored.reg(register), original.reg(register));
            }
        }
    }
}
