use crate::{
    image::Module,
    memory::AddressSpace,
    process::{EmulatedProcess, ProcessBuilder, ProcessConfig},
    utils::file_name_lower,
};

// Helper function to create module metadata for `path` with a plausible entry point and size
pub fn module(path: &str, image_base: u32) -> Module {
    Module::new(
        image_base,
        image_base + 0x1000,
        0x0001_0000,
        file_name_lower(path),
        path,
    )
}

// Helper function to build a PE32 image without sections
//
// DOS header with e_lfanew = 0x40, COFF header for i386, and a standard optional header with
// sixteen empty data directories, padded to one file alignment unit.
pub fn minimal_pe32(image_base: u32, entry_rva: u32, size_of_image: u32) -> Vec<u8> {
    let mut data = vec![0u8; 0x200];

    // DOS header
    data[0..2].copy_from_slice(b"MZ");
    data[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());

    // PE signature and COFF header
    data[0x40..0x44].copy_from_slice(b"PE\0\0");
    let coff = 0x44;
    data[coff..coff + 2].copy_from_slice(&0x014Cu16.to_le_bytes()); // Machine
    data[coff + 2..coff + 4].copy_from_slice(&0u16.to_le_bytes()); // NumberOfSections
    data[coff + 16..coff + 18].copy_from_slice(&0xE0u16.to_le_bytes()); // SizeOfOptionalHeader
    data[coff + 18..coff + 20].copy_from_slice(&0x0102u16.to_le_bytes()); // Characteristics

    // Optional header
    let opt = coff + 20;
    let put = |data: &mut Vec<u8>, offset: usize, value: u32| {
        data[opt + offset..opt + offset + 4].copy_from_slice(&value.to_le_bytes());
    };
    data[opt..opt + 2].copy_from_slice(&0x010Bu16.to_le_bytes()); // Magic
    put(&mut data, 16, entry_rva); // AddressOfEntryPoint
    put(&mut data, 28, image_base); // ImageBase
    put(&mut data, 32, 0x1000); // SectionAlignment
    put(&mut data, 36, 0x200); // FileAlignment
    data[opt + 40..opt + 42].copy_from_slice(&4u16.to_le_bytes()); // MajorOperatingSystemVersion
    data[opt + 48..opt + 50].copy_from_slice(&4u16.to_le_bytes()); // MajorSubsystemVersion
    put(&mut data, 56, size_of_image); // SizeOfImage
    put(&mut data, 60, 0x200); // SizeOfHeaders
    data[opt + 68..opt + 70].copy_from_slice(&2u16.to_le_bytes()); // Subsystem
    put(&mut data, 72, 0x0010_0000); // SizeOfStackReserve
    put(&mut data, 76, 0x1000); // SizeOfStackCommit
    put(&mut data, 80, 0x0010_0000); // SizeOfHeapReserve
    put(&mut data, 84, 0x1000); // SizeOfHeapCommit
    put(&mut data, 92, 16); // NumberOfRvaAndSizes

    data
}

// Helper function to create an initialized process with app.exe, ntdll, kernel32 and foo.dll,
// registered in an order that differs from the loader list order
pub fn standard_process(memory: &AddressSpace) -> EmulatedProcess {
    let mut process = ProcessBuilder::new()
        .config(ProcessConfig::default().with_dump_chain(false))
        .main_module("c:\\app\\app.exe")
        .module(module("c:/windows/system32/foo.dll", 0x1000_0000))
        .module(module("c:/windows/system32/kernel32.dll", 0x7C80_0000))
        .module(module("c:\\app\\app.exe", 0x0040_0000))
        .module(module("c:/windows/system32/ntdll.dll", 0x7C90_0000))
        .build()
        .unwrap();
    process.initialize(memory).unwrap();
    process
}
