// ABOUTME: Addon discovery and lifecycle management
// ABOUTME: Scans sq_* directories against the compiled-in catalog and aggregates scopes

use crate::metrics;
use crate::runtime::Runtime;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory prefix that marks an addon home under the addons dir
pub const ADDON_DIR_PREFIX: &str = "sq_";

/// OAuth scopes every deployment needs regardless of which addons load
pub const CORE_SCOPES: &[&str] = &["channel:read:redemptions", "chat:edit", "chat:read"];

/// A loadable bot extension.
///
/// Addons are constructed once at discovery and live until the process
/// exits. `register` runs at startup and again after every detected
/// reconnect of the event transport, so everything it sets up (commands,
/// subscriptions, queued work) must be safe to repeat. `start` runs once,
/// after the startup barrier completes, and may loop forever.
#[async_trait]
pub trait Addon: Send + Sync {
    /// Addon name; also the directory suffix after `sq_`
    fn name(&self) -> &str;

    /// Extra OAuth scopes this addon needs beyond [`CORE_SCOPES`]
    fn scopes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Register commands and event subscriptions.
    async fn register(&self, runtime: &Runtime) -> Result<()> {
        let _ = runtime;
        Ok(())
    }

    /// Long-running background work, spawned once startup completes.
    async fn start(&self, runtime: &Runtime) -> Result<()> {
        let _ = runtime;
        Ok(())
    }
}

/// Constructor for an addon, given its home directory
pub type AddonFactory = fn(&Path) -> Result<Box<dyn Addon>>;

/// Compiled-in table of addons the binary knows how to build.
/// Discovery only loads names that appear both here and on disk.
#[derive(Default)]
pub struct AddonCatalog {
    factories: HashMap<String, AddonFactory>,
}

impl AddonCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, factory: AddonFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Option<&AddonFactory> {
        self.factories.get(name)
    }

    /// Known addon names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Holds every loaded addon and drives the lifecycle passes over them.
#[derive(Default)]
pub struct AddonRegistry {
    addons: Vec<Arc<dyn Addon>>,
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an always-on addon compiled into the binary, not gated by any
    /// directory. System addons register before discovered ones.
    pub fn add_system(&mut self, addon: Box<dyn Addon>) {
        tracing::debug!(addon = %addon.name(), "System addon added");
        self.addons.push(Arc::from(addon));
    }

    /// Scan `dir` for `sq_*` addon homes and build each through the catalog.
    ///
    /// A directory without a catalog entry, or a factory that errors, is
    /// logged and skipped; the remaining addons still load. A missing
    /// addons directory is not an error.
    pub fn discover(&mut self, dir: &Path, catalog: &AddonCatalog) -> Result<()> {
        if !dir.is_dir() {
            tracing::info!(dir = %dir.display(), "Addons directory missing, skipping discovery");
            return Ok(());
        }

        let mut homes: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        homes.sort();

        for home in homes {
            let Some(dirname) = home.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = dirname.strip_prefix(ADDON_DIR_PREFIX) else {
                tracing::debug!(dir = %dirname, "Skipping non-addon directory");
                continue;
            };
            let Some(factory) = catalog.get(name) else {
                tracing::warn!(addon = %name, "No such addon compiled in, skipping");
                metrics::record_addon_load_failure(name);
                continue;
            };
            match factory(&home) {
                Ok(addon) => {
                    tracing::info!(addon = %addon.name(), home = %home.display(), "Loaded addon");
                    self.addons.push(Arc::from(addon));
                }
                Err(e) => {
                    tracing::error!(addon = %name, error = %e, "Failed to load addon, skipping");
                    metrics::record_addon_load_failure(name);
                }
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    /// Loaded addon names, in registration order
    pub fn names(&self) -> Vec<String> {
        self.addons.iter().map(|a| a.name().to_string()).collect()
    }

    /// Merged scope set: the core scopes plus every addon's extras,
    /// deduplicated and sorted.
    pub fn scopes(&self) -> Vec<String> {
        let mut set: BTreeSet<String> = CORE_SCOPES.iter().map(|s| s.to_string()).collect();
        for addon in &self.addons {
            set.extend(addon.scopes());
        }
        set.into_iter().collect()
    }

    /// Space-joined scope list for the authorization request
    pub fn scope_string(&self) -> String {
        self.scopes().join(" ")
    }

    /// Run every addon's `register` in order. A failing addon is logged and
    /// does not stop the others.
    pub async fn register_all(&self, runtime: &Runtime) {
        for addon in &self.addons {
            if let Err(e) = addon.register(runtime).await {
                tracing::error!(addon = %addon.name(), error = %e, "Addon registration failed");
                metrics::record_addon_register_failure(addon.name());
            }
        }
    }

    /// Spawn every addon's `start` as an independent task. Failures are
    /// logged inside the task.
    pub async fn start_all(&self, runtime: &Runtime) {
        for addon in &self.addons {
            let addon = Arc::clone(addon);
            let runtime = runtime.clone();
            tokio::spawn(async move {
                if let Err(e) = addon.start(&runtime).await {
                    tracing::error!(addon = %addon.name(), error = %e, "Addon start failed");
                }
            });
        }
    }
}
