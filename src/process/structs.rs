//! Field offsets of the 32-bit Windows structures placed into guest memory.
//!
//! Guest code is free to introspect these structures directly, so the offsets follow the
//! published x86 layouts exactly. The builder, the context marshaller, the dispatcher and the
//! chain walker all take their offsets from here.

/// `NT_TIB`, the head of the thread environment block.
pub mod nt_tib {
    /// `ExceptionList`, the SEH chain head.
    pub const EXCEPTION_LIST: u32 = 0x00;
    /// `StackBase`.
    pub const STACK_BASE: u32 = 0x04;
    /// `Self`, linear address of the block itself.
    pub const SELF: u32 = 0x18;
}

/// `TEB` fields past the embedded `NT_TIB`.
pub mod teb {
    /// `ProcessEnvironmentBlock`.
    pub const PROCESS_ENVIRONMENT_BLOCK: u32 = 0x30;
    /// `LastErrorValue`.
    pub const LAST_ERROR_VALUE: u32 = 0x34;
}

/// `PEB`.
pub mod peb {
    /// `ImageBaseAddress`.
    pub const IMAGE_BASE_ADDRESS: u32 = 0x08;
    /// `Ldr`, pointer to `PEB_LDR_DATA`.
    pub const LDR: u32 = 0x0C;
    /// `ProcessParameters`.
    pub const PROCESS_PARAMETERS: u32 = 0x10;
}

/// `PEB_LDR_DATA`.
pub mod peb_ldr_data {
    /// `Length`.
    pub const LENGTH: u32 = 0x00;
    /// `Initialized`.
    pub const INITIALIZED: u32 = 0x04;
    /// `SsHandle`.
    pub const SS_HANDLE: u32 = 0x08;
    /// `InLoadOrderModuleList`.
    pub const IN_LOAD_ORDER_MODULE_LIST: u32 = 0x0C;
    /// `InMemoryOrderModuleList`.
    pub const IN_MEMORY_ORDER_MODULE_LIST: u32 = 0x14;
    /// `InInitializationOrderModuleList`.
    pub const IN_INITIALIZATION_ORDER_MODULE_LIST: u32 = 0x1C;
    /// `EntryInProgress`.
    pub const ENTRY_IN_PROGRESS: u32 = 0x24;
    /// Size of the structure.
    pub const SIZE: u32 = 0x30;
}

/// `LDR_DATA_TABLE_ENTRY`.
pub mod ldr_entry {
    /// `InLoadOrderLinks`.
    pub const IN_LOAD_ORDER_LINKS: u32 = 0x00;
    /// `InMemoryOrderLinks`.
    pub const IN_MEMORY_ORDER_LINKS: u32 = 0x08;
    /// `InInitializationOrderLinks`.
    pub const IN_INITIALIZATION_ORDER_LINKS: u32 = 0x10;
    /// `DllBase`.
    pub const DLL_BASE: u32 = 0x18;
    /// `EntryPoint`.
    pub const ENTRY_POINT: u32 = 0x1C;
    /// `SizeOfImage`.
    pub const SIZE_OF_IMAGE: u32 = 0x20;
    /// `FullDllName`.
    pub const FULL_DLL_NAME: u32 = 0x24;
    /// `BaseDllName`.
    pub const BASE_DLL_NAME: u32 = 0x2C;
    /// `Flags`; the descriptor is materialized up to here.
    pub const FLAGS: u32 = 0x34;
}

/// `LIST_ENTRY`.
pub mod list_entry {
    /// `Flink`.
    pub const FLINK: u32 = 0x00;
    /// `Blink`.
    pub const BLINK: u32 = 0x04;
}

/// `UNICODE_STRING`.
pub mod unicode_string {
    /// `Length` in bytes, without the terminator.
    pub const LENGTH: u32 = 0x00;
    /// `MaximumLength` in bytes, with the terminator.
    pub const MAXIMUM_LENGTH: u32 = 0x02;
    /// `Buffer`.
    pub const BUFFER: u32 = 0x04;
}

/// `RTL_USER_PROCESS_PARAMETERS`, as far as it is modelled.
pub mod process_parameters {
    /// `MaximumLength`, the declared size of the block.
    pub const MAXIMUM_LENGTH: u32 = 0x00;
    /// `Environment`.
    pub const ENVIRONMENT: u32 = 0x48;
    /// Number of bytes materialized.
    pub const SIZE: u32 = 0x4C;
    /// Declared size stored at [`MAXIMUM_LENGTH`].
    pub const DECLARED_SIZE: u32 = 0x1000;
    /// Byte every unmodelled field is filled with.
    pub const FILLER: u8 = b'E';
}

/// x86 `CONTEXT`.
pub mod context {
    /// `ContextFlags`.
    pub const CONTEXT_FLAGS: u32 = 0x00;
    /// `Dr0`.
    pub const DR0: u32 = 0x04;
    /// `Dr1`.
    pub const DR1: u32 = 0x08;
    /// `Dr2`.
    pub const DR2: u32 = 0x0C;
    /// `Dr3`.
    pub const DR3: u32 = 0x10;
    /// `Dr6`.
    pub const DR6: u32 = 0x14;
    /// `Dr7`.
    pub const DR7: u32 = 0x18;
    /// `FloatSave`, a `FLOATING_SAVE_AREA`.
    pub const FLOAT_SAVE: u32 = 0x1C;
    /// `SegGs`.
    pub const SEG_GS: u32 = 0x8C;
    /// `SegFs`.
    pub const SEG_FS: u32 = 0x90;
    /// `SegEs`.
    pub const SEG_ES: u32 = 0x94;
    /// `SegDs`.
    pub const SEG_DS: u32 = 0x98;
    /// `Edi`.
    pub const EDI: u32 = 0x9C;
    /// `Esi`.
    pub const ESI: u32 = 0xA0;
    /// `Ebx`.
    pub const EBX: u32 = 0xA4;
    /// `Edx`.
    pub const EDX: u32 = 0xA8;
    /// `Ecx`.
    pub const ECX: u32 = 0xAC;
    /// `Eax`.
    pub const EAX: u32 = 0xB0;
    /// `Ebp`.
    pub const EBP: u32 = 0xB4;
    /// `Eip`.
    pub const EIP: u32 = 0xB8;
    /// `SegCs`.
    pub const SEG_CS: u32 = 0xBC;
    /// `EFlags`.
    pub const EFLAGS: u32 = 0xC0;
    /// `Esp`.
    pub const ESP: u32 = 0xC4;
    /// `SegSs`.
    pub const SEG_SS: u32 = 0xC8;
    /// Size of the structure, including `ExtendedRegisters`.
    pub const SIZE: u32 = 0x2CC;
}

/// `EXCEPTION_RECORD` header.
pub mod exception_record {
    /// `ExceptionCode`.
    pub const EXCEPTION_CODE: u32 = 0x00;
    /// `ExceptionFlags`.
    pub const EXCEPTION_FLAGS: u32 = 0x04;
    /// `ExceptionRecord`, the chained record.
    pub const EXCEPTION_RECORD: u32 = 0x08;
    /// `ExceptionAddress`.
    pub const EXCEPTION_ADDRESS: u32 = 0x0C;
    /// `NumberParameters`.
    pub const NUMBER_PARAMETERS: u32 = 0x10;
    /// Bytes written per record; `ExceptionInformation` is not materialized.
    pub const HEADER_SIZE: u32 = 0x14;
}

/// `EXCEPTION_REGISTRATION_RECORD`, one SEH frame.
pub mod seh_frame {
    /// `Next`, the previous frame on the chain.
    pub const PREVIOUS: u32 = 0x00;
    /// `Handler`.
    pub const HANDLER: u32 = 0x04;
    /// Size of one frame.
    pub const SIZE: u32 = 0x08;
}

/// Geometry of the call frame the dispatcher builds below the faulting stack pointer.
pub mod dispatch_frame {
    /// Bytes reserved below the faulting `ESP`.
    pub const SIZE: u32 = 0x3C8;
    /// The four handler arguments, stored below the frame base.
    pub const ARGUMENTS_SIZE: u32 = 0x10;
    /// Offset of the synthetic SEH frame.
    pub const SYNTHETIC_FRAME: u32 = 0x14;
    /// Offset of the exception record.
    pub const EXCEPTION_RECORD: u32 = 0xE8;
    /// Offset of the context record.
    pub const CONTEXT: u32 = 0xFC;
    /// Offset of the context pointer relative to `ESP` when the trampoline is reached.
    pub const CONTEXT_ARGUMENT: u32 = 0x08;
    /// Values written into the synthetic frame's handler slot and the two dwords after it.
    pub const POISON: [u32; 3] = [0xAAAA_AAAA, 0xAAAA_AABB, 0xAAAA_AACC];
}
