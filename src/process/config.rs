//! Process configuration.
//!
//! [`ProcessConfig`] controls everything about the simulated process that is not module
//! metadata: where structures live, which module is the main executable, what the environment
//! block contains and how the SEH machinery behaves.
//!
//! # Example
//!
//! ```rust
//! use ntenv::process::{LayoutPlan, ProcessConfig};
//!
//! let config = ProcessConfig::default()
//!     .with_main_module("c:\\target\\crackme.exe")
//!     .with_environment_var("USERNAME", "analyst")
//!     .with_max_seh_hops(16);
//!
//! let custom = ProcessConfig {
//!     dump_chain: false,
//!     layout: LayoutPlan::default().with_max_modules(8),
//!     ..ProcessConfig::default()
//! };
//! ```

use crate::process::layout::LayoutPlan;

/// Configuration of one simulated process.
///
/// # Default Configuration
///
/// - [`LayoutPlan::default()`] addresses
/// - No main module
/// - `ALLUSERSPROFILE=C:\Documents and Settings\All Users` as the only environment variable
/// - Chain walks stop after 5 hops
/// - The chain is logged on every dispatch and resume
/// - FS selector `0x4`
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Addresses of all simulated structures.
    pub layout: LayoutPlan,

    /// Path of the main executable, matched against module paths case-insensitively by file
    /// name. Without it the image base field of the PEB is left unmapped.
    pub main_module: Option<String>,

    /// Environment variables placed into the environment block, in order.
    pub environment: Vec<(String, String)>,

    /// Maximum number of links the chain walker follows.
    pub max_seh_hops: usize,

    /// Whether the chain is walked and logged around every dispatch and resume.
    pub dump_chain: bool,

    /// Selector loaded into FS by [`seed_fs_segment`](super::EmulatedProcess::seed_fs_segment).
    pub fs_selector: u16,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            layout: LayoutPlan::default(),
            main_module: None,
            environment: vec![(
                "ALLUSERSPROFILE".to_string(),
                "C:\\Documents and Settings\\All Users".to_string(),
            )],
            max_seh_hops: 5,
            dump_chain: true,
            fs_selector: 0x4,
        }
    }
}

impl ProcessConfig {
    /// Sets the layout plan.
    #[must_use]
    pub fn with_layout(mut self, layout: LayoutPlan) -> Self {
        self.layout = layout;
        self
    }

    /// Sets the main executable path.
    #[must_use]
    pub fn with_main_module(mut self, path: impl Into<String>) -> Self {
        self.main_module = Some(path.into());
        self
    }

    /// Appends an environment variable.
    #[must_use]
    pub fn with_environment_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((name.into(), value.into()));
        self
    }

    /// Replaces the whole environment.
    #[must_use]
    pub fn with_environment(mut self, environment: Vec<(String, String)>) -> Self {
        self.environment = environment;
        self
    }

    /// Sets the chain walker's hop limit.
    #[must_use]
    pub fn with_max_seh_hops(mut self, hops: usize) -> Self {
        self.max_seh_hops = hops;
        self
    }

    /// Enables or disables chain logging around dispatch and resume.
    #[must_use]
    pub fn with_dump_chain(mut self, enabled: bool) -> Self {
        self.dump_chain = enabled;
        self
    }

    /// Sets the FS selector.
    #[must_use]
    pub fn with_fs_selector(mut self, selector: u16) -> Self {
        self.fs_selector = selector;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ProcessConfig::default();
        assert_eq!(config.max_seh_hops, 5);
        assert_eq!(config.fs_selector, 0x4);
        assert!(config.main_module.is_none());
        assert_eq!(config.environment.len(), 1);
        assert_eq!(config.environment[0].0, "ALLUSERSPROFILE");
    }

    #[test]
    fn builder_methods() {
        let config = ProcessConfig::default()
            .with_environment(Vec::new())
            .with_environment_var("A", "1")
            .with_main_module("app.exe")
            .with_dump_chain(false)
            .with_fs_selector(0x3B);
        assert_eq!(config.environment, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(config.main_module.as_deref(), Some("app.exe"));
        assert!(!config.dump_chain);
        assert_eq!(config.fs_selector, 0x3B);
    }
}
