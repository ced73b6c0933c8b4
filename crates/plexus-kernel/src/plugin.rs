//! The plugin contract.
//!
//! A plugin is anything implementing [`Plugin`]: an id, hard and soft
//! dependency lists, and four lifecycle hooks that default to doing nothing.
//! Hooks receive the whole [`Kernel`], so a plugin can subscribe to events,
//! schedule tasks, add middleware or register services while it starts.
//!
//! Resources a plugin creates should carry its id as owner tag. The kernel
//! releases everything owned by a plugin when the plugin is disposed.
//!
//! For small plugins [`PluginBuilder`] assembles one from closures:
//!
//! ```
//! use plexus_kernel::prelude::*;
//!
//! let plugin = PluginBuilder::new("autosave")
//!     .requires(&["storage"])
//!     .optional_requires(&["telemetry"])
//!     .on_start(|kernel| {
//!         kernel.every(
//!             60_000.0,
//!             |k: &mut Kernel| { k.emit("autosave:due", serde_json::json!({})); Ok(()) },
//!             EveryOptions::default().owned_by("autosave"),
//!         )?;
//!         Ok(())
//!     })
//!     .build();
//!
//! assert_eq!(plugin.id(), "autosave");
//! assert_eq!(plugin.requires(), ["storage".to_owned()]);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::kernel::Kernel;

/// A lifecycle hook stored by [`ClosurePlugin`].
pub type HookFn = Box<dyn FnMut(&mut Kernel) -> anyhow::Result<()>>;

// ---------------------------------------------------------------------------
// Plugin trait
// ---------------------------------------------------------------------------

/// A unit of optional functionality managed by the kernel.
pub trait Plugin {
    /// Globally unique id. Surrounding whitespace is ignored.
    fn id(&self) -> &str;

    /// Plugins that must be registered and run first.
    fn requires(&self) -> &[String] {
        &[]
    }

    /// Plugins that run first when registered, and are ignored otherwise.
    fn optional_requires(&self) -> &[String] {
        &[]
    }

    /// Called once, before any plugin starts.
    fn init(&mut self, _kernel: &mut Kernel) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once, after every plugin has been initialized.
    fn start(&mut self, _kernel: &mut Kernel) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called in reverse start order. Errors are logged, not propagated.
    fn stop(&mut self, _kernel: &mut Kernel) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called in reverse order on kernel disposal. Errors are logged.
    fn dispose(&mut self, _kernel: &mut Kernel) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Where a registered plugin is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Registered,
    Initialized,
    Started,
    Stopped,
    Disposed,
}

impl PluginState {
    /// Whether `init` has already run.
    pub fn is_initialized(self) -> bool {
        !matches!(self, PluginState::Registered)
    }
}

// ---------------------------------------------------------------------------
// Normalized descriptor
// ---------------------------------------------------------------------------

/// Trimmed id and de-duplicated dependency lists, captured at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Descriptor {
    pub id: String,
    pub requires: Vec<String>,
    pub optional_requires: Vec<String>,
}

impl Descriptor {
    /// `None` when the id is blank.
    pub fn of(plugin: &dyn Plugin) -> Option<Self> {
        let id = plugin.id().trim();
        if id.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_owned(),
            requires: normalize_ids(plugin.requires()),
            optional_requires: normalize_ids(plugin.optional_requires()),
        })
    }
}

fn normalize_ids(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !out.iter().any(|seen| seen == id) {
            out.push(id.to_owned());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// PluginBuilder
// ---------------------------------------------------------------------------

/// A [`Plugin`] made of closures.
pub struct ClosurePlugin {
    id: String,
    requires: Vec<String>,
    optional_requires: Vec<String>,
    init: Option<HookFn>,
    start: Option<HookFn>,
    stop: Option<HookFn>,
    dispose: Option<HookFn>,
}

fn call(hook: &mut Option<HookFn>, kernel: &mut Kernel) -> anyhow::Result<()> {
    match hook {
        Some(f) => f(kernel),
        None => Ok(()),
    }
}

impl Plugin for ClosurePlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn requires(&self) -> &[String] {
        &self.requires
    }

    fn optional_requires(&self) -> &[String] {
        &self.optional_requires
    }

    fn init(&mut self, kernel: &mut Kernel) -> anyhow::Result<()> {
        call(&mut self.init, kernel)
    }

    fn start(&mut self, kernel: &mut Kernel) -> anyhow::Result<()> {
        call(&mut self.start, kernel)
    }

    fn stop(&mut self, kernel: &mut Kernel) -> anyhow::Result<()> {
        call(&mut self.stop, kernel)
    }

    fn dispose(&mut self, kernel: &mut Kernel) -> anyhow::Result<()> {
        call(&mut self.dispose, kernel)
    }
}

impl fmt::Debug for ClosurePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosurePlugin")
            .field("id", &self.id)
            .field("requires", &self.requires)
            .field("optional_requires", &self.optional_requires)
            .finish_non_exhaustive()
    }
}

/// Builds a [`ClosurePlugin`].
pub struct PluginBuilder {
    plugin: ClosurePlugin,
}

impl PluginBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            plugin: ClosurePlugin {
                id: id.to_owned(),
                requires: Vec::new(),
                optional_requires: Vec::new(),
                init: None,
                start: None,
                stop: None,
                dispose: None,
            },
        }
    }

    pub fn requires(mut self, ids: &[&str]) -> Self {
        self.plugin
            .requires
            .extend(ids.iter().map(|s| (*s).to_owned()));
        self
    }

    pub fn optional_requires(mut self, ids: &[&str]) -> Self {
        self.plugin
            .optional_requires
            .extend(ids.iter().map(|s| (*s).to_owned()));
        self
    }

    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut Kernel) -> anyhow::Result<()> + 'static,
    {
        self.plugin.init = Some(Box::new(hook));
        self
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut Kernel) -> anyhow::Result<()> + 'static,
    {
        self.plugin.start = Some(Box::new(hook));
        self
    }

    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut Kernel) -> anyhow::Result<()> + 'static,
    {
        self.plugin.stop = Some(Box::new(hook));
        self
    }

    pub fn on_dispose<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut Kernel) -> anyhow::Result<()> + 'static,
    {
        self.plugin.dispose = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> ClosurePlugin {
        self.plugin
    }
}
