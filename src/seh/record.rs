//! The `EXCEPTION_RECORD` handed to guest handlers.

use crate::{
    memory::GuestMemory,
    process::structs::exception_record,
    utils::io::{read_le_field, write_le_field},
    Result,
};

/// Header of an `EXCEPTION_RECORD`.
///
/// Nested records and exception parameters are not modelled: `flags`, `record` and
/// `number_parameters` are always zero for records built by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// `ExceptionCode`.
    pub code: u32,
    /// `ExceptionFlags`.
    pub flags: u32,
    /// `ExceptionRecord`, the chained record.
    pub record: u32,
    /// `ExceptionAddress`, the faulting instruction.
    pub address: u32,
    /// `NumberParameters`.
    pub number_parameters: u32,
}

impl ExceptionRecord {
    /// Creates the record for a fault raised at `address`.
    #[must_use]
    pub fn new(code: u32, address: u32) -> Self {
        Self {
            code,
            flags: 0,
            record: 0,
            address,
            number_parameters: 0,
        }
    }

    /// Writes the header at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if guest memory cannot be written.
    pub fn write<M: GuestMemory + ?Sized>(&self, memory: &M, address: u32) -> Result<()> {
        let mut data = [0u8; exception_record::HEADER_SIZE as usize];
        write_le_field(&mut data, exception_record::EXCEPTION_CODE as usize, self.code)?;
        write_le_field(&mut data, exception_record::EXCEPTION_FLAGS as usize, self.flags)?;
        write_le_field(&mut data, exception_record::EXCEPTION_RECORD as usize, self.record)?;
        write_le_field(&mut data, exception_record::EXCEPTION_ADDRESS as usize, self.address)?;
        write_le_field(
            &mut data,
            exception_record::NUMBER_PARAMETERS as usize,
            self.number_parameters,
        )?;
        memory.write(u64::from(address), &data)
    }

    /// Reads the header at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if guest memory cannot be read.
    pub fn read<M: GuestMemory + ?Sized>(memory: &M, address: u32) -> Result<Self> {
        let data = memory.read(u64::from(address), exception_record::HEADER_SIZE as usize)?;
        Ok(Self {
            code: read_le_field(&data, exception_record::EXCEPTION_CODE as usize)?,
            flags: read_le_field(&data, exception_record::EXCEPTION_FLAGS as usize)?,
            record: read_le_field(&data, exception_record::EXCEPTION_RECORD as usize)?,
            address: read_le_field(&data, exception_record::EXCEPTION_ADDRESS as usize)?,
            number_parameters: read_le_field(
                &data,
                exception_record::NUMBER_PARAMETERS as usize,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddressSpace, MemoryProtection};

    #[test]
    fn layout_on_the_wire() {
        let memory = AddressSpace::new();
        memory
            .map(0x1000, MemoryProtection::READ_WRITE, &[0xFF; 0x20], "record")
            .unwrap();

        ExceptionRecord::new(0xC000_0094, 0x0040_1234)
            .write(&memory, 0x1000)
            .unwrap();

        assert_eq!(
            memory.read(0x1000, 0x14).unwrap(),
            vec![
                0x94, 0x00, 0x00, 0xC0, 0, 0, 0, 0, 0, 0, 0, 0, 0x34, 0x12, 0x40, 0x00, 0, 0, 0, 0
            ]
        );
        // Only the header is written.
        assert_eq!(memory.read_u32(0x1014).unwrap(), 0xFFFF_FFFF);

        let record = ExceptionRecord::read(&memory, 0x1000).unwrap();
        assert_eq!(record, ExceptionRecord::new(0xC000_0094, 0x0040_1234));
    }
}
