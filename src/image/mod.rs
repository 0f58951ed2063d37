//! Modules are what the loader lists describe. The structure builder needs only five facts about
//! each one, so [`Module`] is a plain value type: emulators that already parsed their images
//! construct it with [`Module::new`], everyone else lets [`Module::from_pe`] or
//! [`Module::from_file`] pull the values out of a PE32 image with `goblin`.
//!
//! # Example
//!
//! ```rust
//! use ntenv::image::Module;
//!
//! let kernel32 = Module::new(0x7C80_0000, 0x7C80_B64E, 0xF6000, "kernel32.dll", "c:\\windows\\system32\\kernel32.dll");
//! assert_eq!(kernel32.image_base, 0x7C80_0000);
//! ```

use std::{fs, path::Path};

use memmap2::Mmap;

use crate::{utils::file_name_lower, Error, Result};

/// Metadata of one loaded image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    /// Address the image is mapped at (`DllBase`).
    pub image_base: u32,

    /// Absolute virtual address of the entry point, `0` if the image has none.
    pub entry_point: u32,

    /// Size of the mapped image in bytes.
    pub size_of_image: u32,

    /// Name the image declares for itself, usually its export name.
    pub name: String,

    /// Path the image was loaded from.
    pub path: String,
}

impl Module {
    /// Creates module metadata from already known values.
    #[must_use]
    pub fn new(
        image_base: u32,
        entry_point: u32,
        size_of_image: u32,
        name: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            image_base,
            entry_point,
            size_of_image,
            name: name.into(),
            path: path.into(),
        }
    }

    /// Extracts module metadata from the bytes of a PE32 image.
    ///
    /// The image is described at its preferred base. The name is taken from the export
    /// directory when present and from the final component of `path` otherwise.
    ///
    /// # Arguments
    ///
    /// * `data` - The raw image file
    /// * `path` - Path the image is presented under inside the guest
    ///
    /// # Errors
    ///
    /// Returns [`Error::GoblinErr`] if the image cannot be parsed and [`Error::NotSupported`]
    /// for PE32+ images, which cannot live in a 32-bit process.
    pub fn from_pe(data: &[u8], path: &str) -> Result<Self> {
        let pe = goblin::pe::PE::parse(data)?;
        if pe.is_64 {
            return Err(Error::NotSupported);
        }

        let image_base = u32::try_from(pe.image_base)
            .map_err(|_| malformed_error!("image base 0x{:X} out of range", pe.image_base))?;

        let (entry_rva, size_of_image) = match pe.header.optional_header {
            Some(oh) => (
                u32::try_from(oh.standard_fields.address_of_entry_point).map_err(|_| {
                    malformed_error!("entry point RVA out of range in '{}'", path)
                })?,
                oh.windows_fields.size_of_image,
            ),
            None => (0, 0),
        };

        let entry_point = if entry_rva == 0 {
            0
        } else {
            image_base.wrapping_add(entry_rva)
        };

        let name = pe
            .name
            .map(str::to_string)
            .unwrap_or_else(|| file_name_lower(path));

        Ok(Self {
            image_base,
            entry_point,
            size_of_image,
            name,
            path: path.to_string(),
        })
    }

    /// Memory-maps an image from disk and extracts its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if the file cannot be opened or mapped, and any error of
    /// [`Module::from_pe`].
    #[allow(unsafe_code)]
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;

        Self::from_pe(&mmap, &path.to_string_lossy())
    }
}
