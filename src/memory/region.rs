//! Memory region types for address space management.
//!
//! A [`MemoryRegion`] is a contiguous, labelled block of guest memory with one set of
//! [`MemoryProtection`] flags. The structure builder maps many small regions (a few bytes of
//! the thread block, one module descriptor, one string block) rather than whole pages, so that
//! guest accesses outside the modelled fields fault the way they would on an unmapped page.
//!
//! # Thread Safety
//!
//! All operations take `&self` and use the per-page `RwLock` of the backing [`Page`]s.

use bitflags::bitflags;

use crate::{
    memory::page::{Page, PAGE_SIZE},
    Result,
};

bitflags! {
    /// Memory protection flags for address space regions.
    ///
    /// These flags control what operations are permitted on a memory region.
    /// They are modeled after Windows `PAGE_*` protection constants.
    ///
    /// # Common Combinations
    ///
    /// - [`READ_WRITE`](Self::READ_WRITE) - Every OS structure built by this crate
    /// - [`READ_EXECUTE`](Self::READ_EXECUTE) - Code
    /// - [`READ`](Self::READ) - Read-only data
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryProtection: u32 {
        /// Region is readable.
        const READ = 0x01;
        /// Region is writable.
        const WRITE = 0x02;
        /// Region is executable.
        const EXECUTE = 0x04;
        /// Read and write access.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read, write, and execute access.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// Read and execute access.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

/// A memory region in the emulated address space.
#[derive(Debug)]
pub struct MemoryRegion {
    /// Base virtual address of this region.
    base: u64,
    /// Total size of the region in bytes.
    size: usize,
    /// Pages containing the region's data (each page is 4KB).
    pages: Vec<Page>,
    /// Human-readable label for debugging.
    label: String,
    /// Memory protection for the region.
    protection: MemoryProtection,
}

impl MemoryRegion {
    /// Creates pages from a byte slice.
    fn pages_from_data(data: &[u8]) -> Vec<Page> {
        data.chunks(PAGE_SIZE).map(Page::from_slice).collect()
    }

    /// Creates a new mapped data region.
    ///
    /// # Arguments
    ///
    /// * `base` - The base address for the mapping
    /// * `data` - The initial contents, which also define the region size
    /// * `label` - Human-readable label for debugging
    /// * `protection` - Memory protection flags
    #[must_use]
    pub fn mapped_data(
        base: u64,
        data: &[u8],
        label: impl Into<String>,
        protection: MemoryProtection,
    ) -> Self {
        Self {
            base,
            size: data.len(),
            pages: Self::pages_from_data(data),
            label: label.into(),
            protection,
        }
    }

    /// Returns the base address of this region.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Returns the size of this region in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the end address (exclusive) of this region.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.size as u64
    }

    /// Returns the label given at mapping time.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the protection flags for this region.
    #[must_use]
    pub fn protection(&self) -> MemoryProtection {
        self.protection
    }

    /// Returns `true` if the address falls within this region.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    /// Returns `true` if the entire address range falls within this region.
    #[must_use]
    pub fn contains_range(&self, address: u64, len: usize) -> bool {
        match address.checked_add(len as u64) {
            Some(end) => address >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Returns `true` if this region shares at least one byte with `other`.
    #[must_use]
    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Reads bytes from this region.
    ///
    /// The caller must have checked the range with [`contains_range`](Self::contains_range).
    ///
    /// # Errors
    ///
    /// Returns an error if the range leaves the region or a page lock is poisoned.
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut result = vec![0u8; len];
        self.for_each_page(address, len, |page, page_offset, range| {
            page.read(page_offset, &mut result[range])
        })?;
        Ok(result)
    }

    /// Writes bytes to this region, ignoring protection.
    ///
    /// Protection is enforced by the address space; the builder relies on this to
    /// initialize regions in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the range leaves the region or a page lock is poisoned.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        self.for_each_page(address, data.len(), |page, page_offset, range| {
            page.write(page_offset, &data[range])
        })
    }

    /// Splits `[address, address + len)` at page boundaries and hands every piece to `f`
    /// together with the offset inside its page and its range inside the caller's buffer.
    fn for_each_page<F>(&self, address: u64, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&Page, usize, std::ops::Range<usize>) -> Result<()>,
    {
        if !self.contains_range(address, len) {
            return Err(crate::Error::OutOfBounds);
        }

        // Safe: offset within a memory region always fits in usize
        #[allow(clippy::cast_possible_truncation)]
        let offset = (address - self.base) as usize;
        let mut done = 0;

        while done < len {
            let current = offset + done;
            let page_index = current / PAGE_SIZE;
            let page_offset = current % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_offset).min(len - done);

            let page = self.pages.get(page_index).ok_or(crate::Error::OutOfBounds)?;
            f(page, page_offset, done..done + chunk)?;
            done += chunk;
        }

        Ok(())
    }
}
