use thiserror::Error;

use crate::seh::HandlerDisposition;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers every failure mode of building the simulated process environment and of
/// running the structured exception handling protocol. Non-fatal degradations (a missing main
/// module, a module without image metadata, an SEH chain that cannot be walked to its end) are
/// never reported through this type; they are logged and the operation carries on.
///
/// # Error Categories
///
/// ## Input and Layout Errors
/// - [`Error::Malformed`] - Inconsistent input (names too long, bad slot geometry, ...)
/// - [`Error::OutOfBounds`] - A byte buffer was too short for the requested access
/// - [`Error::NotSupported`] - Unsupported image format (e.g. PE32+)
/// - [`Error::LayoutOverlap`] - Two structures of the layout plan share addresses
/// - [`Error::TooManyModules`] - More modules than the layout plan has descriptor slots
///
/// ## Guest Memory Errors
/// - [`Error::InvalidAddress`] - Access to unmapped or write-protected guest memory
/// - [`Error::RegionOverlap`] - A new mapping collides with an existing one
///
/// ## Exception Dispatch Errors
/// - [`Error::UnhandledException`] - No readable handler frame at the chain head
/// - [`Error::UnsupportedDisposition`] - Handler asked for search or unwind semantics
/// - [`Error::NoActiveException`] - Resume requested while no handler is active
/// - [`Error::ProcessHalted`] - The process already hit a fatal dispatch error
///
/// # Examples
///
/// ```rust,no_run
/// use ntenv::{Error, memory::AddressSpace, cpu::RegisterFile, process::ProcessBuilder};
///
/// let memory = AddressSpace::new();
/// let mut cpu = RegisterFile::new();
/// let mut process = ProcessBuilder::new().build()?;
/// process.initialize(&memory)?;
///
/// match process.return_from_handler(&mut cpu, &memory) {
///     Ok(()) => println!("resumed"),
///     Err(Error::UnsupportedDisposition(disposition)) => {
///         eprintln!("handler requested {disposition}, giving up");
///     }
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// # Ok::<(), ntenv::Error>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is inconsistent and could not be turned into guest structures.
    ///
    /// The error includes the source location where the problem was detected for
    /// debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted on a byte buffer.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This image type is not supported.
    ///
    /// Only 32-bit PE images can be described inside the simulated x86 process.
    #[error("This image type is not supported")]
    NotSupported,

    /// File I/O error while loading an image from disk.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// A guest memory access touched unmapped or protected memory.
    #[error("Invalid guest address 0x{address:08X}: {reason}")]
    InvalidAddress {
        /// The first address of the failed access
        address: u64,
        /// Why the access was rejected
        reason: &'static str,
    },

    /// A mapping request collides with an already mapped region.
    #[error("Mapping '{label}' at 0x{address:08X} overlaps an existing region")]
    RegionOverlap {
        /// Base address of the rejected mapping
        address: u64,
        /// Label of the rejected mapping
        label: String,
    },

    /// Two structures of the memory layout plan occupy overlapping address ranges.
    #[error("Layout overlap between {first} and {second}")]
    LayoutOverlap {
        /// Name of the first structure
        first: &'static str,
        /// Name of the second structure
        second: &'static str,
    },

    /// More modules were supplied than the layout plan has descriptor slots for.
    #[error("Too many modules - {count} exceeds the limit of {limit}")]
    TooManyModules {
        /// Number of supplied modules
        count: usize,
        /// Number of available descriptor slots
        limit: usize,
    },

    /// A fault was raised but the chain head does not reference a readable frame.
    #[error("Unhandled exception 0x{code:08X} at 0x{address:08X}")]
    UnhandledException {
        /// The exception code of the fault
        code: u32,
        /// The faulting instruction address
        address: u32,
    },

    /// The guest handler returned a disposition other than continue-execution.
    ///
    /// Searching further up the chain and unwinding are not implemented; the process is
    /// halted instead of guessing at multi-frame semantics.
    #[error("Unsupported exception disposition - {0}")]
    UnsupportedDisposition(HandlerDisposition),

    /// The return trampoline was reached without an exception being dispatched.
    #[error("No exception handler is active")]
    NoActiveException,

    /// The process hit a fatal dispatch error earlier and cannot continue.
    #[error("The emulated process has been halted")]
    ProcessHalted,

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,
}
