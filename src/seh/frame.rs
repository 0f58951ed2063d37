//! SEH frames.
//!
//! On the wire every frame is the same `EXCEPTION_REGISTRATION_RECORD`: a link to the previous
//! frame followed by a handler address. Frames the dispatcher installs while a handler runs are
//! tagged [`FrameKind::Synthetic`]; guest code cannot tell them apart from its own.

use std::fmt;

use crate::{
    memory::GuestMemory,
    process::structs::seh_frame,
    utils::io::{read_le_field, write_le_field},
    Result,
};

/// Who installed a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum FrameKind {
    /// Registered by guest code.
    Real,
    /// Installed by the dispatcher for the duration of a handler.
    Synthetic,
}

/// One frame of the SEH chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SehFrame {
    /// Guest address of the frame.
    pub address: u32,
    /// Link to the previous frame, `0` or an unmapped address at the end of the chain.
    pub previous: u32,
    /// Handler address. Poison for synthetic frames.
    pub handler: u32,
    /// Who installed the frame.
    pub kind: FrameKind,
}

impl SehFrame {
    /// Reads the frame at `address`, tagging it with `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the eight bytes cannot be read.
    pub fn read<M: GuestMemory + ?Sized>(memory: &M, address: u32, kind: FrameKind) -> Result<Self> {
        let data = memory.read(u64::from(address), seh_frame::SIZE as usize)?;
        Ok(Self {
            address,
            previous: read_le_field(&data, seh_frame::PREVIOUS as usize)?,
            handler: read_le_field(&data, seh_frame::HANDLER as usize)?,
            kind,
        })
    }

    /// Writes `previous` and `handler` at the frame's address.
    ///
    /// # Errors
    ///
    /// Returns an error if the eight bytes cannot be written.
    pub fn write<M: GuestMemory + ?Sized>(&self, memory: &M) -> Result<()> {
        let mut data = [0u8; seh_frame::SIZE as usize];
        write_le_field(&mut data, seh_frame::PREVIOUS as usize, self.previous)?;
        write_le_field(&mut data, seh_frame::HANDLER as usize, self.handler)?;
        memory.write(u64::from(self.address), &data)
    }
}

impl fmt::Display for SehFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seh_ptr: 0x{:08X} {{ prev_seh: 0x{:08X} eh: 0x{:08X} }} ({})",
            self.address, self.previous, self.handler, self.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddressSpace, MemoryProtection};

    #[test]
    fn read_write() {
        let memory = AddressSpace::new();
        memory
            .map(0x2000, MemoryProtection::READ_WRITE, &[0; 8], "frame")
            .unwrap();

        let frame = SehFrame {
            address: 0x2000,
            previous: 0xFFFF_FFFF,
            handler: 0x0040_1500,
            kind: FrameKind::Real,
        };
        frame.write(&memory).unwrap();

        assert_eq!(SehFrame::read(&memory, 0x2000, FrameKind::Real).unwrap(), frame);
        assert!(SehFrame::read(&memory, 0x2004, FrameKind::Real).is_err());
        assert_eq!(
            frame.to_string(),
            "seh_ptr: 0x00002000 { prev_seh: 0xFFFFFFFF eh: 0x00401500 } (Real)"
        );
    }
}
