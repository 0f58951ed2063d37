//! Materialization of the OS structures in guest memory.
//!
//! Each function here maps and fills one group of structures. They are called once, in order,
//! by [`EmulatedProcess::initialize`](super::EmulatedProcess::initialize):
//!
//! 1. [`build_teb`] - the three thread block fields guest code touches
//! 2. [`create_module_descriptors`] - one `LDR_DATA_TABLE_ENTRY` plus two strings per module
//! 3. [`build_peb`] - image base, loader data and process parameter pointers
//! 4. [`build_ldr_data`] - the `PEB_LDR_DATA` record with empty list heads
//! 5. [`link_loader_list`] - the three circular module lists
//! 6. [`add_process_env`] and [`add_process_parameters`]
//!
//! Structures are mapped field group by field group rather than page by page, so that a guest
//! reading an unmodelled field faults instead of silently reading zeros.

use log::{debug, info, warn};
use strum::EnumIter;

use crate::{
    image::Module,
    memory::{GuestMemory, MemoryProtection},
    process::{
        layout::LayoutPlan,
        registry::{ModuleId, ModuleRegistry},
        structs::{
            ldr_entry, list_entry, nt_tib, peb, peb_ldr_data, process_parameters, teb,
            unicode_string,
        },
    },
    utils::{
        file_name_lower,
        io::{read_le_field, write_le_field},
        to_wide_nul, to_windows_path,
    },
    Error, Result,
};

/// One of the three module lists anchored in `PEB_LDR_DATA`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, strum::Display)]
pub enum LoaderList {
    /// `InLoadOrderModuleList`: main, ntdll, kernel32, then everything else.
    InLoadOrder,
    /// `InMemoryOrderModuleList`: same membership and order as load order.
    InMemoryOrder,
    /// `InInitializationOrderModuleList`: ntdll, kernel32, then everything else but main.
    InInitializationOrder,
}

impl LoaderList {
    /// Offset of this list's `LIST_ENTRY` inside a module descriptor.
    #[must_use]
    pub fn link_offset(self) -> u32 {
        match self {
            LoaderList::InLoadOrder => ldr_entry::IN_LOAD_ORDER_LINKS,
            LoaderList::InMemoryOrder => ldr_entry::IN_MEMORY_ORDER_LINKS,
            LoaderList::InInitializationOrder => ldr_entry::IN_INITIALIZATION_ORDER_LINKS,
        }
    }

    /// Offset of this list's head inside `PEB_LDR_DATA`.
    #[must_use]
    pub fn head_offset(self) -> u32 {
        match self {
            LoaderList::InLoadOrder => peb_ldr_data::IN_LOAD_ORDER_MODULE_LIST,
            LoaderList::InMemoryOrder => peb_ldr_data::IN_MEMORY_ORDER_MODULE_LIST,
            LoaderList::InInitializationOrder => {
                peb_ldr_data::IN_INITIALIZATION_ORDER_MODULE_LIST
            }
        }
    }

    /// Guest address of this list's head.
    #[must_use]
    pub fn head_address(self, layout: &LayoutPlan) -> u32 {
        layout.ldr_data + self.head_offset()
    }

    /// Returns the members of this list in link order.
    ///
    /// When the main module, `ntdll.dll` or `kernel32.dll` is missing, every list degrades to
    /// plain registration order of all modules.
    #[must_use]
    pub fn members(self, registry: &ModuleRegistry, main: Option<ModuleId>) -> Vec<ModuleId> {
        let (Some(main), Some(ntdll), Some(kernel32)) = (
            main,
            registry.by_name("ntdll.dll"),
            registry.by_name("kernel32.dll"),
        ) else {
            return registry.iter().collect();
        };

        let specials = [main, ntdll, kernel32];
        let leading: &[ModuleId] = match self {
            LoaderList::InLoadOrder | LoaderList::InMemoryOrder => &specials,
            LoaderList::InInitializationOrder => &specials[1..],
        };

        let mut members: Vec<ModuleId> = Vec::with_capacity(registry.len());
        for id in leading {
            if !members.contains(id) {
                members.push(*id);
            }
        }
        members.extend(registry.iter().filter(|id| !specials.contains(id)));
        members
    }
}

/// Maps `NtTib.ExceptionList`, `NtTib.Self` and `ProcessEnvironmentBlock`.
///
/// # Errors
///
/// Returns an error if any of the fields cannot be mapped.
pub fn build_teb<M: GuestMemory + ?Sized>(memory: &M, layout: &LayoutPlan) -> Result<()> {
    let fields = [
        (nt_tib::EXCEPTION_LIST, layout.default_seh, "TEB.NtTib.ExceptionList"),
        (nt_tib::SELF, layout.tib, "TEB.NtTib.Self"),
        (teb::PROCESS_ENVIRONMENT_BLOCK, layout.peb, "TEB.ProcessEnvironmentBlock"),
    ];

    for (offset, value, label) in fields {
        memory.map(
            u64::from(layout.tib + offset),
            MemoryProtection::READ_WRITE,
            &value.to_le_bytes(),
            label,
        )?;
    }

    debug!("TEB at 0x{:08X}, chain head 0x{:08X}", layout.tib, layout.default_seh);
    Ok(())
}

/// Maps the PEB fields from `ImageBaseAddress` (or `Ldr` without a main module) up to
/// `ProcessParameters`.
///
/// # Errors
///
/// Returns an error if the fields cannot be mapped.
pub fn build_peb<M: GuestMemory + ?Sized>(
    memory: &M,
    layout: &LayoutPlan,
    image_base: Option<u32>,
) -> Result<()> {
    let start = match image_base {
        Some(_) => peb::IMAGE_BASE_ADDRESS,
        None => peb::LDR,
    };

    let mut data = vec![0u8; (peb::PROCESS_PARAMETERS + 4 - start) as usize];
    if let Some(base) = image_base {
        write_le_field(&mut data, (peb::IMAGE_BASE_ADDRESS - start) as usize, base)?;
    }
    write_le_field(&mut data, (peb::LDR - start) as usize, layout.ldr_data)?;
    write_le_field(
        &mut data,
        (peb::PROCESS_PARAMETERS - start) as usize,
        layout.process_parameters,
    )?;

    memory.map(
        u64::from(layout.peb + start),
        MemoryProtection::READ_WRITE,
        &data,
        "PEB",
    )
}

/// Creates a descriptor and its two strings for every image, and registers the modules.
///
/// Slot numbers follow the position in `images`, starting at 1; entries without metadata keep
/// their slot empty and are left out of the registry.
///
/// # Errors
///
/// Returns [`Error::TooManyModules`] if `images` has more entries than the layout has slots,
/// [`Error::Malformed`] if a name or path does not fit its sub-block, and any mapping error.
pub fn create_module_descriptors<M: GuestMemory + ?Sized>(
    memory: &M,
    layout: &LayoutPlan,
    images: &[(String, Option<Module>)],
    registry: &mut ModuleRegistry,
) -> Result<()> {
    if images.len() > layout.max_modules {
        return Err(Error::TooManyModules {
            count: images.len(),
            limit: layout.max_modules,
        });
    }

    for (index, (path, module)) in images.iter().enumerate() {
        let Some(module) = module else {
            warn!("Unknown module: omitted from loader lists ({path})");
            continue;
        };

        let address = layout.slot_address(index + 1);
        let name = file_name_lower(path);
        let full_path = to_windows_path(path);

        let (name_bytes, name_len) = to_wide_nul(&name);
        let (path_bytes, path_len) = to_wide_nul(&full_path);
        if name_bytes.len() > layout.name_capacity() as usize {
            return Err(malformed_error!(
                "module name '{}' needs {} bytes, slot holds {}",
                name,
                name_bytes.len(),
                layout.name_capacity()
            ));
        }
        if path_bytes.len() > layout.path_capacity() as usize {
            return Err(malformed_error!(
                "module path '{}' needs {} bytes, slot holds {}",
                full_path,
                path_bytes.len(),
                layout.path_capacity()
            ));
        }

        let mut descriptor = vec![0u8; ldr_entry::FLAGS as usize];
        write_le_field(&mut descriptor, ldr_entry::DLL_BASE as usize, module.image_base)?;
        write_le_field(&mut descriptor, ldr_entry::ENTRY_POINT as usize, module.entry_point)?;
        write_le_field(
            &mut descriptor,
            ldr_entry::SIZE_OF_IMAGE as usize,
            module.size_of_image,
        )?;
        write_unicode_string(
            &mut descriptor,
            ldr_entry::FULL_DLL_NAME,
            path_len,
            address + layout.path_offset,
        )?;
        write_unicode_string(
            &mut descriptor,
            ldr_entry::BASE_DLL_NAME,
            name_len,
            address + layout.name_offset,
        )?;

        memory.map(
            u64::from(address),
            MemoryProtection::READ_WRITE,
            &descriptor,
            &format!("Module info '{name}'"),
        )?;
        memory.map(
            u64::from(address + layout.name_offset),
            MemoryProtection::READ_WRITE,
            &name_bytes,
            &format!("Module name '{name}'"),
        )?;
        memory.map(
            u64::from(address + layout.path_offset),
            MemoryProtection::READ_WRITE,
            &path_bytes,
            &format!("Module path '{name}'"),
        )?;

        info!("Add module 0x{:08X} '{}'", module.image_base, name);
        registry.register(name, module.clone(), address);
    }

    Ok(())
}

fn write_unicode_string(descriptor: &mut [u8], field: u32, length: usize, buffer: u32) -> Result<()> {
    let length = u16::try_from(length)
        .map_err(|_| malformed_error!("string of {} bytes exceeds UNICODE_STRING", length))?;
    let maximum = length
        .checked_add(2)
        .ok_or_else(|| malformed_error!("string of {} bytes exceeds UNICODE_STRING", length))?;

    let field = field as usize;
    write_le_field(descriptor, field + unicode_string::LENGTH as usize, length)?;
    write_le_field(descriptor, field + unicode_string::MAXIMUM_LENGTH as usize, maximum)?;
    write_le_field(descriptor, field + unicode_string::BUFFER as usize, buffer)
}

/// Maps `PEB_LDR_DATA` with every list head pointing at itself.
///
/// # Errors
///
/// Returns an error if the record cannot be mapped.
pub fn build_ldr_data<M: GuestMemory + ?Sized>(memory: &M, layout: &LayoutPlan) -> Result<()> {
    let mut data = vec![0u8; peb_ldr_data::SIZE as usize];
    write_le_field(&mut data, peb_ldr_data::LENGTH as usize, peb_ldr_data::SIZE)?;
    write_le_field(&mut data, peb_ldr_data::INITIALIZED as usize, 1u32)?;

    for list in [
        LoaderList::InLoadOrder,
        LoaderList::InMemoryOrder,
        LoaderList::InInitializationOrder,
    ] {
        let head = list.head_address(layout);
        let offset = list.head_offset() as usize;
        write_le_field(&mut data, offset + list_entry::FLINK as usize, head)?;
        write_le_field(&mut data, offset + list_entry::BLINK as usize, head)?;
    }

    memory.map(
        u64::from(layout.ldr_data),
        MemoryProtection::READ_WRITE,
        &data,
        "Loader struct",
    )
}

/// Threads `members` into a circular list through the `list` link fields, with the head in
/// `PEB_LDR_DATA` as sentinel.
///
/// # Errors
///
/// Returns an error if a member is not registered or a link cannot be written.
pub fn link_loader_list<M: GuestMemory + ?Sized>(
    memory: &M,
    layout: &LayoutPlan,
    registry: &ModuleRegistry,
    list: LoaderList,
    members: &[ModuleId],
) -> Result<()> {
    let head = list.head_address(layout);
    let links = members
        .iter()
        .map(|id| {
            registry
                .descriptor_of(*id)
                .map(|descriptor| descriptor + list.link_offset())
                .ok_or_else(|| malformed_error!("module {:?} has no descriptor", id))
        })
        .collect::<Result<Vec<u32>>>()?;

    debug!("Fix {list}: {} members", links.len());

    for (i, link) in links.iter().enumerate() {
        let next = links.get(i + 1).copied().unwrap_or(head);
        let prev = if i == 0 { head } else { links[i - 1] };

        let mut entry = [0u8; 8];
        write_le_field(&mut entry, list_entry::FLINK as usize, next)?;
        write_le_field(&mut entry, list_entry::BLINK as usize, prev)?;
        memory.write(u64::from(*link), &entry)?;
    }

    let mut entry = [0u8; 8];
    write_le_field(&mut entry, list_entry::FLINK as usize, links.first().copied().unwrap_or(head))?;
    write_le_field(&mut entry, list_entry::BLINK as usize, links.last().copied().unwrap_or(head))?;
    memory.write(u64::from(head), &entry)
}

/// Follows a loader list from its head and returns the descriptor address of every member.
///
/// Walks `Flink` when `backward` is false and `Blink` otherwise. The walk gives up after
/// `limit` members.
///
/// # Errors
///
/// Returns an error if a link cannot be read, or [`Error::Malformed`] if the list does not
/// return to its head within `limit` members.
pub fn walk_loader_list<M: GuestMemory + ?Sized>(
    memory: &M,
    layout: &LayoutPlan,
    list: LoaderList,
    backward: bool,
    limit: usize,
) -> Result<Vec<u32>> {
    let head = list.head_address(layout);
    let field = if backward { list_entry::BLINK } else { list_entry::FLINK };

    let mut descriptors = Vec::new();
    let mut current = memory.read_u32(u64::from(head + field))?;
    while current != head {
        if descriptors.len() >= limit {
            return Err(malformed_error!("{} does not return to its head", list));
        }
        descriptors.push(current.wrapping_sub(list.link_offset()));

        let entry = memory.read(u64::from(current), 8)?;
        current = read_le_field(&entry, field as usize)?;
    }

    Ok(descriptors)
}

/// Maps the environment block holding `NAME=value` strings and a closing terminator.
///
/// # Errors
///
/// Returns [`Error::Malformed`] if the strings exceed the block's capacity, and any mapping
/// error.
pub fn add_process_env<M: GuestMemory + ?Sized>(
    memory: &M,
    layout: &LayoutPlan,
    environment: &[(String, String)],
) -> Result<()> {
    let mut block = Vec::new();
    for (name, value) in environment {
        let (bytes, _) = to_wide_nul(&format!("{name}={value}"));
        block.extend_from_slice(&bytes);
    }
    block.extend_from_slice(&[0, 0]);

    let capacity = layout.environment_capacity as usize;
    if block.len() > capacity {
        return Err(malformed_error!(
            "environment needs {} bytes, block holds {}",
            block.len(),
            capacity
        ));
    }
    block.resize(capacity, 0);

    memory.map(
        u64::from(layout.environment),
        MemoryProtection::READ_WRITE,
        &block,
        "Process environment",
    )
}

/// Maps `RTL_USER_PROCESS_PARAMETERS` with its declared size and environment pointer.
///
/// # Errors
///
/// Returns an error if the block cannot be mapped.
pub fn add_process_parameters<M: GuestMemory + ?Sized>(memory: &M, layout: &LayoutPlan) -> Result<()> {
    let mut block = vec![process_parameters::FILLER; process_parameters::SIZE as usize];
    write_le_field(
        &mut block,
        process_parameters::MAXIMUM_LENGTH as usize,
        process_parameters::DECLARED_SIZE,
    )?;
    write_le_field(
        &mut block,
        process_parameters::ENVIRONMENT as usize,
        layout.environment,
    )?;

    memory.map(
        u64::from(layout.process_parameters),
        MemoryProtection::READ_WRITE,
        &block,
        "Process parameters",
    )
}
