//! Guest addresses of every structure the environment materializes.
//!
//! [`LayoutPlan`] gathers the fixed addresses into one value that is validated once, when the
//! process is built, instead of trusting scattered constants. The defaults reproduce the
//! layout guest code has been observed to cope with: the thread block and process block at
//! their customary Windows XP addresses, the loader data and module descriptor table in a
//! private region at `0x340000`, and the environment in low memory.
//!
//! # Example
//!
//! ```rust
//! use ntenv::process::LayoutPlan;
//!
//! let plan = LayoutPlan::default().with_tib(0x7FFD_E000).with_max_modules(16);
//! plan.validate().unwrap();
//! assert_eq!(plan.slot_address(1), 0x0034_2F00);
//! ```

use crate::{
    process::structs::{ldr_entry, peb, peb_ldr_data, process_parameters, seh_frame, teb},
    Error, Result,
};

/// Address assignments for the simulated process structures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutPlan {
    /// Thread information block (`fs:[0]`).
    pub tib: u32,

    /// Process environment block.
    pub peb: u32,

    /// `PEB_LDR_DATA` record holding the three list heads.
    pub ldr_data: u32,

    /// Base of the module descriptor table. Slot `i` (1-indexed) lives at
    /// `module_table + i * module_stride`.
    pub module_table: u32,

    /// Distance between two descriptor slots.
    pub module_stride: u32,

    /// Offset of the base-name string inside a slot.
    pub name_offset: u32,

    /// Offset of the full-path string inside a slot. The name sub-block ends here.
    pub path_offset: u32,

    /// Number of descriptor slots.
    pub max_modules: usize,

    /// `RTL_USER_PROCESS_PARAMETERS` block.
    pub process_parameters: u32,

    /// Environment string block.
    pub environment: u32,

    /// Capacity of the environment string block in bytes.
    pub environment_capacity: u32,

    /// Chain head installed before the guest registers any frame. Nothing is mapped there,
    /// so reading through it faults.
    pub default_seh: u32,

    /// Return address pushed for guest handlers. The emulator treats reaching it as the end of
    /// the handler.
    pub return_trampoline: u32,
}

impl Default for LayoutPlan {
    fn default() -> Self {
        const LDR_AD: u32 = 0x0034_0000;

        Self {
            tib: 0x7FF7_0000,
            peb: 0x7FFD_F000,
            ldr_data: LDR_AD + 0x1EA0,
            module_table: LDR_AD + 0x1F00,
            module_stride: 0x1000,
            name_offset: 0x500,
            path_offset: 0x600,
            max_modules: 0x40,
            process_parameters: 0x0020_0000,
            environment: 0x0001_0000,
            environment_capacity: 0x1000,
            default_seh: 0x7FFF_F000,
            return_trampoline: 0x6EAD_BEEF,
        }
    }
}

impl LayoutPlan {
    /// Sets the thread information block address.
    #[must_use]
    pub fn with_tib(mut self, address: u32) -> Self {
        self.tib = address;
        self
    }

    /// Sets the process environment block address.
    #[must_use]
    pub fn with_peb(mut self, address: u32) -> Self {
        self.peb = address;
        self
    }

    /// Sets the loader data record address.
    #[must_use]
    pub fn with_ldr_data(mut self, address: u32) -> Self {
        self.ldr_data = address;
        self
    }

    /// Sets the descriptor table base and slot stride.
    #[must_use]
    pub fn with_module_table(mut self, base: u32, stride: u32) -> Self {
        self.module_table = base;
        self.module_stride = stride;
        self
    }

    /// Sets the number of descriptor slots.
    #[must_use]
    pub fn with_max_modules(mut self, count: usize) -> Self {
        self.max_modules = count;
        self
    }

    /// Sets the environment block address and capacity.
    #[must_use]
    pub fn with_environment(mut self, address: u32, capacity: u32) -> Self {
        self.environment = address;
        self.environment_capacity = capacity;
        self
    }

    /// Sets the process parameters address.
    #[must_use]
    pub fn with_process_parameters(mut self, address: u32) -> Self {
        self.process_parameters = address;
        self
    }

    /// Sets the default SEH sentinel.
    #[must_use]
    pub fn with_default_seh(mut self, address: u32) -> Self {
        self.default_seh = address;
        self
    }

    /// Sets the return trampoline address.
    #[must_use]
    pub fn with_return_trampoline(mut self, address: u32) -> Self {
        self.return_trampoline = address;
        self
    }

    /// Address of descriptor slot `index` (1-indexed).
    #[must_use]
    pub fn slot_address(&self, index: usize) -> u32 {
        // max_modules is validated to keep every slot inside 32 bits
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        self.module_table
            .wrapping_add(index.wrapping_mul(self.module_stride))
    }

    /// Bytes available for a base name, including its terminator.
    #[must_use]
    pub fn name_capacity(&self) -> u32 {
        self.path_offset.saturating_sub(self.name_offset)
    }

    /// Bytes available for a full path, including its terminator.
    #[must_use]
    pub fn path_capacity(&self) -> u32 {
        self.module_stride.saturating_sub(self.path_offset)
    }

    /// Checks slot geometry and that no two structures share an address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] for inconsistent slot geometry or structures reaching past
    /// the 32-bit address space, and [`Error::LayoutOverlap`] naming the first two structures
    /// found to overlap.
    pub fn validate(&self) -> Result<()> {
        if self.max_modules == 0 {
            return Err(malformed_error!("layout has no module descriptor slots"));
        }
        if self.name_offset < ldr_entry::FLAGS {
            return Err(malformed_error!(
                "name sub-block at 0x{:X} overlaps the descriptor record",
                self.name_offset
            ));
        }
        if self.path_offset <= self.name_offset || self.path_offset >= self.module_stride {
            return Err(malformed_error!(
                "path sub-block at 0x{:X} does not fit between name sub-block 0x{:X} and stride 0x{:X}",
                self.path_offset,
                self.name_offset,
                self.module_stride
            ));
        }

        let table_start = u64::from(self.module_table) + u64::from(self.module_stride);
        let table_len = (self.max_modules as u64).saturating_mul(u64::from(self.module_stride));

        let structures: [(&'static str, u64, u64); 8] = [
            (
                "thread information block",
                u64::from(self.tib),
                u64::from(teb::LAST_ERROR_VALUE + 4),
            ),
            (
                "process environment block",
                u64::from(self.peb),
                u64::from(peb::PROCESS_PARAMETERS + 4),
            ),
            ("loader data", u64::from(self.ldr_data), u64::from(peb_ldr_data::SIZE)),
            ("module descriptor table", table_start, table_len),
            (
                "process parameters",
                u64::from(self.process_parameters),
                u64::from(process_parameters::SIZE),
            ),
            (
                "environment block",
                u64::from(self.environment),
                u64::from(self.environment_capacity),
            ),
            ("default SEH sentinel", u64::from(self.default_seh), u64::from(seh_frame::SIZE)),
            ("return trampoline", u64::from(self.return_trampoline), 1),
        ];

        for (name, start, len) in &structures {
            if start.saturating_add(*len) > 1 << 32 {
                return Err(malformed_error!("{} reaches past the 32-bit address space", name));
            }
        }

        for (i, (first, a_start, a_len)) in structures.iter().enumerate() {
            for (second, b_start, b_len) in &structures[i + 1..] {
                if *a_start < b_start + b_len && *b_start < a_start + a_len {
                    return Err(Error::LayoutOverlap {
                        first: *first,
                        second: *second,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        let plan = LayoutPlan::default();
        plan.validate().unwrap();

        assert_eq!(plan.ldr_data, 0x0034_1EA0);
        assert_eq!(plan.slot_address(1), 0x0034_2F00);
        assert_eq!(plan.slot_address(2), 0x0034_3F00);
        assert_eq!(plan.name_capacity(), 0x100);
        assert_eq!(plan.path_capacity(), 0xA00);
    }

    #[test]
    fn overlapping_blocks_are_rejected() {
        let plan = LayoutPlan::default().with_peb(0x7FF7_0010);
        assert!(matches!(
            plan.validate(),
            Err(Error::LayoutOverlap {
                first: "thread information block",
                second: "process environment block"
            })
        ));
    }

    #[test]
    fn module_table_capacity_is_checked() {
        // 0x40 slots of 0x1000 bytes starting at 0x1F0000 run into the parameters at 0x200000.
        let plan = LayoutPlan::default().with_module_table(0x001E_F000, 0x1000);
        assert!(matches!(
            plan.validate(),
            Err(Error::LayoutOverlap { first: "module descriptor table", .. })
        ));

        let plan = plan.with_max_modules(0x10);
        plan.validate().unwrap();
    }

    #[test]
    fn slot_geometry_is_checked() {
        let mut plan = LayoutPlan::default();
        plan.name_offset = 0x20;
        assert!(matches!(plan.validate(), Err(Error::Malformed { .. })));

        let mut plan = LayoutPlan::default();
        plan.path_offset = 0x1000;
        assert!(matches!(plan.validate(), Err(Error::Malformed { .. })));

        let plan = LayoutPlan::default().with_max_modules(0);
        assert!(matches!(plan.validate(), Err(Error::Malformed { .. })));
    }

    #[test]
    fn address_space_end_is_checked() {
        let plan = LayoutPlan::default().with_environment(0xFFFF_F800, 0x1000);
        assert!(matches!(plan.validate(), Err(Error::Malformed { .. })));
    }
}
