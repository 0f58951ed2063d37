//! Fixed-size guest memory page.
//!
//! This module provides [`Page`], the unit of storage behind every
//! [`MemoryRegion`](super::MemoryRegion). Pages use interior mutability so that the
//! address space can be shared by reference between the structure builder, the dispatcher
//! and the driving emulator.

use std::sync::RwLock;

use crate::{Error, Result};

/// Standard page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// A 4KB page of guest memory.
///
/// # Thread Safety
///
/// All operations use interior mutability via `RwLock`. Multiple threads can read
/// concurrently, while writes acquire exclusive access.
#[derive(Debug)]
pub struct Page {
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl Page {
    /// Creates a page from a slice, padding with zeros if needed.
    ///
    /// If the slice is shorter than `PAGE_SIZE`, the rest is zero-filled.
    /// If longer, it is truncated.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let mut page_data = Box::new([0u8; PAGE_SIZE]);
        let copy_len = data.len().min(PAGE_SIZE);
        page_data[..copy_len].copy_from_slice(&data[..copy_len]);
        Self {
            data: RwLock::new(page_data),
        }
    }

    /// Reads a range of bytes into the provided buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `offset + buf.len() > PAGE_SIZE`.
    /// Returns [`Error::LockError`] if the page lock is poisoned.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = offset.saturating_add(buf.len());
        if end > PAGE_SIZE {
            return Err(Error::OutOfBounds);
        }

        let data = self.data.read().map_err(|_| Error::LockError)?;
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    /// Writes bytes from the provided buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `offset + data.len() > PAGE_SIZE`.
    /// Returns [`Error::LockError`] if the page lock is poisoned.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.saturating_add(data.len());
        if end > PAGE_SIZE {
            return Err(Error::OutOfBounds);
        }

        let mut page = self.data.write().map_err(|_| Error::LockError)?;
        page[offset..end].copy_from_slice(data);
        Ok(())
    }
}
