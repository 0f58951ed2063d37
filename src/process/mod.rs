//! # Key Components
//!
//! - [`EmulatedProcess`] - State of one simulated process: configuration, module registry,
//!   main module and SEH dispatcher
//! - [`ProcessBuilder`] - Fluent construction of an [`EmulatedProcess`]
//! - [`ProcessConfig`] / [`LayoutPlan`] - Configuration and structure addresses
//! - [`ModuleRegistry`] - Modules described by the loader lists
//! - [`LoaderList`] - The three module orderings
//!
//! # Lifecycle
//!
//! ```text
//! ProcessBuilder::build() ──► EmulatedProcess ──initialize()──► structures in guest memory
//!                                                   │
//!                        emulator traps a fault ───►│ dispatch()
//!                  emulator reaches the trampoline ─►│ return_from_handler()
//! ```
//!
//! Several processes can coexist; each one owns its registry, counters and dispatcher state.

mod builder;
mod config;
mod layout;
mod registry;
pub mod structs;

pub use builder::{
    add_process_env, add_process_parameters, build_ldr_data, build_peb, build_teb,
    create_module_descriptors, link_loader_list, walk_loader_list, LoaderList,
};
pub use config::ProcessConfig;
pub use layout::LayoutPlan;
pub use registry::{ModuleId, ModuleRegistry};

use std::path::{Path, PathBuf};

use log::{info, warn};
use strum::IntoEnumIterator;

use crate::{
    cpu::{CpuState, Register},
    image::Module,
    memory::GuestMemory,
    seh::{DispatchState, SehChain, SehDispatcher},
    utils::file_name_lower,
    Error, Result,
};

/// One simulated Windows process.
///
/// Created by [`ProcessBuilder`]. [`initialize`](Self::initialize) writes the OS structures
/// into guest memory; afterwards the emulator forwards faults to [`dispatch`](Self::dispatch)
/// and calls [`return_from_handler`](Self::return_from_handler) whenever execution reaches
/// [`return_trampoline`](Self::return_trampoline).
///
/// # Example
///
/// ```rust
/// use ntenv::prelude::*;
///
/// let memory = AddressSpace::new();
/// let mut process = ProcessBuilder::new()
///     .main_module("c:\\app\\app.exe")
///     .module(Module::new(0x40_0000, 0x40_1000, 0x5000, "app.exe", "c:\\app\\app.exe"))
///     .module(Module::new(0x7C90_0000, 0, 0xAF000, "ntdll.dll", "c:\\windows\\system32\\ntdll.dll"))
///     .module(Module::new(0x7C80_0000, 0, 0xF6000, "kernel32.dll", "c:\\windows\\system32\\kernel32.dll"))
///     .build()?;
/// process.initialize(&memory)?;
///
/// let names: Vec<_> = process
///     .loader_list(&memory, LoaderList::InInitializationOrder)?
///     .into_iter()
///     .filter_map(|id| process.registry().name_of(id).map(str::to_string))
///     .collect();
/// assert_eq!(names, ["ntdll.dll", "kernel32.dll"]);
/// # Ok::<(), ntenv::Error>(())
/// ```
#[derive(Debug)]
pub struct EmulatedProcess {
    config: ProcessConfig,
    images: Vec<(String, Option<Module>)>,
    registry: ModuleRegistry,
    main: Option<ModuleId>,
    dispatcher: SehDispatcher,
    initialized: bool,
}

impl EmulatedProcess {
    fn new(config: ProcessConfig, images: Vec<(String, Option<Module>)>) -> Self {
        let dispatcher = SehDispatcher::new(
            config.layout.tib,
            config.layout.return_trampoline,
            config.max_seh_hops,
            config.dump_chain,
        );
        Self {
            config,
            images,
            registry: ModuleRegistry::new(),
            main: None,
            dispatcher,
            initialized: false,
        }
    }

    /// Writes every OS structure into `memory`.
    ///
    /// Initialization is single-shot: once it has been attempted, successfully or not, every
    /// further call fails. A process whose initialization failed has to be rebuilt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] on any call after the first or when a module name, path or
    /// the environment does not fit its block, and any mapping error of `memory`.
    pub fn initialize<M: GuestMemory + ?Sized>(&mut self, memory: &M) -> Result<()> {
        if self.initialized {
            return Err(malformed_error!("process initialization was already attempted"));
        }
        self.initialized = true;
        let layout = &self.config.layout;

        build_teb(memory, layout)?;
        create_module_descriptors(memory, layout, &self.images, &mut self.registry)?;

        self.main = match &self.config.main_module {
            Some(path) => {
                let main = self.registry.by_name(&file_name_lower(path));
                if main.is_none() {
                    warn!("Main module {path} is not loaded, PEB image base left unmapped");
                }
                main
            }
            None => None,
        };
        let image_base = self
            .main
            .and_then(|id| self.registry.module(id))
            .map(|m| m.image_base);
        build_peb(memory, layout, image_base)?;

        build_ldr_data(memory, layout)?;
        let complete = self.main.is_some()
            && self.registry.by_name("ntdll.dll").is_some()
            && self.registry.by_name("kernel32.dll").is_some();
        for list in LoaderList::iter() {
            if !complete {
                warn!("No main pe, ntdll or kernel32: {list} falls back to registration order");
            }
            let members = list.members(&self.registry, self.main);
            link_loader_list(memory, layout, &self.registry, list, &members)?;
        }

        add_process_env(memory, layout, &self.config.environment)?;
        add_process_parameters(memory, layout)?;

        info!("Process initialized with {} modules", self.registry.len());
        Ok(())
    }

    /// Loads the FS selector and points its segment base at the thread information block.
    pub fn seed_fs_segment<C: CpuState + ?Sized>(&self, cpu: &mut C) {
        let selector = self.config.fs_selector;
        cpu.set_reg(Register::Fs, u32::from(selector));
        cpu.set_segment_base(selector, self.config.layout.tib);
    }

    /// Dispatches the fault `code` to the guest's handler and returns the handler address.
    ///
    /// # Errors
    ///
    /// See [`SehDispatcher::dispatch`].
    pub fn dispatch<C, M>(&mut self, cpu: &mut C, memory: &M, code: u32) -> Result<u32>
    where
        C: CpuState + ?Sized,
        M: GuestMemory + ?Sized,
    {
        self.dispatcher.dispatch(cpu, memory, code)
    }

    /// Completes the innermost handler invocation.
    ///
    /// # Errors
    ///
    /// See [`SehDispatcher::return_from_handler`].
    pub fn return_from_handler<C, M>(&mut self, cpu: &mut C, memory: &M) -> Result<()>
    where
        C: CpuState + ?Sized,
        M: GuestMemory + ?Sized,
    {
        self.dispatcher.return_from_handler(cpu, memory)
    }

    /// Walks the SEH chain of the process' thread. The walk never faults; see [`SehChain::end`].
    #[must_use]
    pub fn seh_chain<M: GuestMemory + ?Sized>(&self, memory: &M) -> SehChain {
        self.dispatcher.chain(memory)
    }

    /// Follows a loader list forward through guest memory and returns its members.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read, does not return to its head, or links a
    /// descriptor that belongs to no registered module.
    pub fn loader_list<M: GuestMemory + ?Sized>(
        &self,
        memory: &M,
        list: LoaderList,
    ) -> Result<Vec<ModuleId>> {
        self.resolve_list(memory, list, false)
    }

    /// Follows a loader list backward through guest memory and returns its members.
    ///
    /// # Errors
    ///
    /// Same as [`loader_list`](Self::loader_list).
    pub fn loader_list_backward<M: GuestMemory + ?Sized>(
        &self,
        memory: &M,
        list: LoaderList,
    ) -> Result<Vec<ModuleId>> {
        self.resolve_list(memory, list, true)
    }

    fn resolve_list<M: GuestMemory + ?Sized>(
        &self,
        memory: &M,
        list: LoaderList,
        backward: bool,
    ) -> Result<Vec<ModuleId>> {
        let descriptors = walk_loader_list(
            memory,
            &self.config.layout,
            list,
            backward,
            self.registry.len(),
        )?;

        descriptors
            .into_iter()
            .map(|descriptor| {
                self.registry
                    .iter()
                    .find(|id| self.registry.descriptor_of(*id) == Some(descriptor))
                    .ok_or_else(|| {
                        malformed_error!("{} links unknown descriptor 0x{:08X}", list, descriptor)
                    })
            })
            .collect()
    }

    /// Address the emulator must treat as "handler returned".
    #[must_use]
    pub fn return_trampoline(&self) -> u32 {
        self.config.layout.return_trampoline
    }

    /// Returns `true` if `address` is the return trampoline.
    #[must_use]
    pub fn is_return_trampoline(&self, address: u32) -> bool {
        address == self.config.layout.return_trampoline
    }

    /// Address of the thread information block, the FS segment base.
    #[must_use]
    pub fn tib_address(&self) -> u32 {
        self.config.layout.tib
    }

    /// Number of faults dispatched so far.
    #[must_use]
    pub fn fault_count(&self) -> u64 {
        self.dispatcher.fault_count()
    }

    /// Dispatcher state.
    #[must_use]
    pub fn state(&self) -> DispatchState {
        self.dispatcher.state()
    }

    /// Modules described by the loader structures. Empty before initialization.
    #[must_use]
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// The main executable, once initialized and if it was loaded.
    #[must_use]
    pub fn main_module(&self) -> Option<ModuleId> {
        self.main
    }

    /// Process configuration.
    #[must_use]
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }
}

/// Image sources resolved at build time.
#[derive(Debug)]
enum ImageSource {
    Module { module: Module },
    Missing { path: String },
    Pe { path: String, data: Vec<u8> },
    File { path: PathBuf },
}

/// Fluent builder for [`EmulatedProcess`].
///
/// Images are collected in order and resolved in [`build`](Self::build), so that image
/// parsing errors surface in one place.
///
/// # Example
///
/// ```rust,no_run
/// use ntenv::process::{ProcessBuilder, ProcessConfig};
///
/// # fn main() -> Result<(), ntenv::Error> {
/// let process = ProcessBuilder::new()
///     .config(ProcessConfig::default().with_dump_chain(false))
///     .main_module("c:\\target\\sample.exe")
///     .module_file("samples/sample.exe")
///     .module_file("samples/ntdll.dll")
///     .missing_module("c:\\windows\\system32\\user32.dll")
///     .environment_var("USERNAME", "analyst")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ProcessBuilder {
    config: ProcessConfig,
    images: Vec<ImageSource>,
}

impl ProcessBuilder {
    /// Creates a builder with the default configuration and no modules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: ProcessConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the layout plan.
    #[must_use]
    pub fn layout(mut self, layout: LayoutPlan) -> Self {
        self.config.layout = layout;
        self
    }

    /// Names the main executable by path.
    #[must_use]
    pub fn main_module(mut self, path: impl Into<String>) -> Self {
        self.config.main_module = Some(path.into());
        self
    }

    /// Adds a module whose metadata is already known. [`Module::path`] is the guest path its
    /// descriptor strings and loader-list key are derived from.
    #[must_use]
    pub fn module(mut self, module: Module) -> Self {
        self.images.push(ImageSource::Module { module });
        self
    }

    /// Adds a module the image parser could not provide metadata for. It occupies a slot but
    /// is left out of the loader lists.
    #[must_use]
    pub fn missing_module(mut self, path: impl Into<String>) -> Self {
        self.images.push(ImageSource::Missing { path: path.into() });
        self
    }

    /// Adds a PE32 image from memory.
    #[must_use]
    pub fn module_pe(mut self, path: impl Into<String>, data: Vec<u8>) -> Self {
        self.images.push(ImageSource::Pe {
            path: path.into(),
            data,
        });
        self
    }

    /// Adds a PE32 image from disk. The host path doubles as the guest path.
    #[must_use]
    pub fn module_file(mut self, path: impl AsRef<Path>) -> Self {
        self.images.push(ImageSource::File {
            path: path.as_ref().to_path_buf(),
        });
        self
    }

    /// Appends an environment variable.
    #[must_use]
    pub fn environment_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.environment.push((name.into(), value.into()));
        self
    }

    /// Sets the chain walker's hop limit.
    #[must_use]
    pub fn max_seh_hops(mut self, hops: usize) -> Self {
        self.config.max_seh_hops = hops;
        self
    }

    /// Validates the configuration, parses all images and creates the process.
    ///
    /// # Errors
    ///
    /// Returns a layout error from [`LayoutPlan::validate`], [`Error::TooManyModules`] if
    /// there are more images than descriptor slots, and any image parsing error.
    pub fn build(self) -> Result<EmulatedProcess> {
        self.config.layout.validate()?;

        if self.images.len() > self.config.layout.max_modules {
            return Err(Error::TooManyModules {
                count: self.images.len(),
                limit: self.config.layout.max_modules,
            });
        }

        let images = self
            .images
            .into_iter()
            .map(|source| match source {
                ImageSource::Module { module } => Ok((module.path.clone(), Some(module))),
                ImageSource::Missing { path } => Ok((path, None)),
                ImageSource::Pe { path, data } => {
                    let module = Module::from_pe(&data, &path)?;
                    Ok((path, Some(module)))
                }
                ImageSource::File { path } => {
                    let module = Module::from_file(&path)?;
                    Ok((path.to_string_lossy().into_owned(), Some(module)))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EmulatedProcess::new(self.config, images))
    }
}
