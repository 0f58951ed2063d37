//! Page-backed guest address space.
//!
//! This module provides the [`AddressSpace`] type, a reference implementation of
//! [`GuestMemory`] for emulators that do not bring their own memory subsystem, and for tests.
//!
//! Failed accesses are reported as errors *and* latched as a pending
//! `EXCEPTION_ACCESS_VIOLATION`, the way a CPU emulator's memory unit records a fault for the
//! execution loop to pick up. The SEH dispatcher clears that latch before resuming the guest.
//!
//! # Example
//!
//! ```rust
//! use ntenv::memory::{AddressSpace, GuestMemory, MemoryProtection};
//!
//! let space = AddressSpace::new();
//! space.map(0x1000, MemoryProtection::READ_WRITE, &[0xDE, 0xAD, 0xBE, 0xEF], "test_data").unwrap();
//!
//! assert_eq!(space.read(0x1000, 4).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
//! assert!(space.read(0x2000, 4).is_err());
//! assert_eq!(space.pending_exception(), 0xC000_0005);
//! ```

use std::sync::{
    atomic::{AtomicU32, Ordering},
    RwLock,
};

use crate::{
    memory::{
        region::{MemoryProtection, MemoryRegion},
        GuestMemory,
    },
    seh::ExceptionCode,
    Error, Result,
};

/// Unified view of all mapped guest memory.
///
/// # Thread Safety
///
/// The address space uses interior mutability for thread-safe access:
/// - Region operations are protected by a `RwLock`
/// - The pending fault is an atomic
#[derive(Debug, Default)]
pub struct AddressSpace {
    /// Mapped regions, never overlapping.
    regions: RwLock<Vec<MemoryRegion>>,

    /// Pending fault code, `0` when no fault is outstanding.
    exception: AtomicU32,
}

impl AddressSpace {
    /// Creates a new, empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a region into the address space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegionOverlap`] if the region overlaps with an existing mapping or
    /// [`Error::LockError`] if the region lock is poisoned.
    pub fn map_region(&self, region: MemoryRegion) -> Result<()> {
        let mut regions = self.regions.write().map_err(|_| Error::LockError)?;

        if regions.iter().any(|existing| existing.overlaps(&region)) {
            return Err(Error::RegionOverlap {
                address: region.base(),
                label: region.label().to_string(),
            });
        }

        regions.push(region);
        Ok(())
    }

    /// Records an access violation and builds the matching error.
    fn fault(&self, address: u64, reason: &'static str) -> Error {
        self.exception
            .store(ExceptionCode::AccessViolation.into(), Ordering::SeqCst);
        Error::InvalidAddress { address, reason }
    }
}

impl GuestMemory for AddressSpace {
    fn map(
        &self,
        address: u64,
        protection: MemoryProtection,
        data: &[u8],
        label: &str,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(malformed_error!("empty mapping '{}' at 0x{:08X}", label, address));
        }
        self.map_region(MemoryRegion::mapped_data(address, data, label, protection))
    }

    fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let regions = self.regions.read().map_err(|_| Error::LockError)?;

        match regions.iter().find(|r| r.contains_range(address, len)) {
            Some(region) if region.protection().contains(MemoryProtection::READ) => {
                region.read(address, len)
            }
            Some(_) => Err(self.fault(address, "region is not readable")),
            None => Err(self.fault(address, "address not mapped")),
        }
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        let regions = self.regions.read().map_err(|_| Error::LockError)?;

        match regions.iter().find(|r| r.contains_range(address, data.len())) {
            Some(region) if region.protection().contains(MemoryProtection::WRITE) => {
                region.write(address, data)
            }
            Some(_) => Err(self.fault(address, "region is read-only")),
            None => Err(self.fault(address, "address not mapped")),
        }
    }

    fn is_mapped(&self, address: u64, len: usize) -> bool {
        let Ok(regions) = self.regions.read() else {
            return false;
        };
        regions.iter().any(|r| r.contains_range(address, len))
    }

    fn is_readable(&self, address: u64, len: usize) -> bool {
        let Ok(regions) = self.regions.read() else {
            return false;
        };
        regions.iter().any(|r| {
            r.contains_range(address, len) && r.protection().contains(MemoryProtection::READ)
        })
    }

    fn pending_exception(&self) -> u32 {
        self.exception.load(Ordering::SeqCst)
    }

    fn clear_exception(&self) {
        self.exception.store(0, Ordering::SeqCst);
    }
}
