//! The [`GuestMemory`] trait is the seam between this crate and the memory subsystem of the CPU
//! emulator that runs the guest. The structure builder only ever calls
//! [`map`](GuestMemory::map) and [`write`](GuestMemory::write); the dispatcher and the chain
//! walker additionally read, check readability and clear the pending fault.
//!
//! Emulators implement the trait over their own memory; [`AddressSpace`] is a self-contained
//! implementation backed by 4KB [`Page`]s.
//!
//! # Key Components
//!
//! - [`GuestMemory`] - Trait the environment is written against
//! - [`AddressSpace`] - Page-backed implementation with fault latching
//! - [`MemoryRegion`] - One labelled mapping
//! - [`MemoryProtection`] - `PAGE_*` style access flags

mod addressspace;
mod page;
mod region;

pub use addressspace::AddressSpace;
pub use page::{Page, PAGE_SIZE};
pub use region::{MemoryProtection, MemoryRegion};

use crate::{
    utils::io::{read_le, GuestIO},
    Result,
};

/// Guest memory as seen by the process environment.
///
/// All methods take `&self`; implementations use interior mutability so that the same memory
/// can be shared between the emulator's execution loop and the environment.
///
/// # Pending Fault
///
/// A failed [`read`](Self::read) or [`write`](Self::write) is expected to leave a pending
/// fault code behind ([`pending_exception`](Self::pending_exception)), like the memory unit of
/// a CPU emulator. The dispatcher clears it with [`clear_exception`](Self::clear_exception)
/// once the fault has been turned into a handler call.
pub trait GuestMemory {
    /// Maps `data` at `address` with the given protection.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is already (partially) mapped or cannot be mapped.
    fn map(&self, address: u64, protection: MemoryProtection, data: &[u8], label: &str)
        -> Result<()>;

    /// Reads `len` bytes starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte of the range is unmapped or not readable.
    fn read(&self, address: u64, len: usize) -> Result<Vec<u8>>;

    /// Writes `data` starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte of the range is unmapped or not writable.
    fn write(&self, address: u64, data: &[u8]) -> Result<()>;

    /// Returns `true` if every byte of `[address, address + len)` is mapped.
    fn is_mapped(&self, address: u64, len: usize) -> bool;

    /// Returns `true` if every byte of `[address, address + len)` can be read.
    ///
    /// Unlike [`read`](Self::read) this never leaves a pending fault behind. The default
    /// treats every mapped byte as readable.
    fn is_readable(&self, address: u64, len: usize) -> bool {
        self.is_mapped(address, len)
    }

    /// Returns the pending fault code, `0` if none.
    fn pending_exception(&self) -> u32;

    /// Clears the pending fault.
    fn clear_exception(&self);

    /// Reads a little-endian `u32` at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the four bytes cannot be read.
    fn read_u32(&self, address: u64) -> Result<u32> {
        let bytes = self.read(address, 4)?;
        read_le::<u32>(&bytes)
    }

    /// Writes a little-endian `u32` at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the four bytes cannot be written.
    fn write_u32(&self, address: u64, value: u32) -> Result<()> {
        self.write(address, GuestIO::to_le_bytes(value).as_ref())
    }
}
