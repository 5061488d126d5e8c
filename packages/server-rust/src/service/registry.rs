//! Handler registry: locator cascade over an atomically swapped snapshot.
//!
//! Lookups run against an immutable [`RegistrySnapshot`]. Before each lookup
//! the watched definition files are checked; on a change a complete new
//! snapshot is built off to the side and published with a single swap, so a
//! lookup sees either the old or the new snapshot and never a mix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use scriptgate_core::Locator;

use super::config::ConfigError;
use super::definitions::{DefinitionSet, HandlerEntry, PreProcessorEntry};
use super::preprocessor::{BoundPreProcessor, PreProcessorBinding, PreProcessorFactory};
use super::timestamp::TimestampGuard;
use crate::scripting::{CompiledScript, ScriptError, ScriptKind, ScriptOutput, SharedBridge};

// ---------------------------------------------------------------------------
// HandlerDefinition
// ---------------------------------------------------------------------------

/// A handler script bound to a locator, compiled on first use.
///
/// A definition is never recompiled in place: when its script changes the
/// registry publishes a fresh definition and in-flight runs finish on the old
/// one.
#[derive(Debug)]
pub struct HandlerDefinition {
    locator: Locator,
    kind: ScriptKind,
    script_path: PathBuf,
    guard: TimestampGuard,
    compiled: ArcSwapOption<CompiledScript>,
    compile_lock: Mutex<()>,
}

impl HandlerDefinition {
    #[must_use]
    pub fn new(entry: &HandlerEntry, check_interval: Duration) -> Self {
        Self {
            locator: entry.locator.clone(),
            kind: entry.kind,
            script_path: entry.script_path.clone(),
            guard: TimestampGuard::new(&entry.script_path, check_interval),
            compiled: ArcSwapOption::empty(),
            compile_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    #[must_use]
    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    #[must_use]
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.compiled.load().is_some()
    }

    /// Returns the compiled script, compiling it on first use.
    ///
    /// Only callers racing on the same definition wait for each other.
    ///
    /// # Errors
    ///
    /// Returns the read or compile error; the next call tries again.
    pub fn compiled(&self) -> Result<Arc<CompiledScript>, ScriptError> {
        if let Some(script) = self.compiled.load_full() {
            return Ok(script);
        }
        let _guard = self.compile_lock.lock();
        if let Some(script) = self.compiled.load_full() {
            return Ok(script);
        }
        let script = Arc::new(CompiledScript::compile(self.kind, &self.script_path)?);
        self.compiled.store(Some(Arc::clone(&script)));
        Ok(script)
    }

    /// Runs the handler. Blocks on outbound calls made by the script.
    ///
    /// # Errors
    ///
    /// Returns compile errors and anything the script run reports.
    pub fn execute(&self, bridge: &SharedBridge) -> Result<ScriptOutput, ScriptError> {
        self.compiled()?.execute(&self.script_path, bridge)
    }

    /// An uncompiled copy watching the script's current timestamp.
    fn fresh(&self, check_interval: Duration) -> Self {
        Self {
            locator: self.locator.clone(),
            kind: self.kind,
            script_path: self.script_path.clone(),
            guard: TimestampGuard::new(&self.script_path, check_interval),
            compiled: ArcSwapOption::empty(),
            compile_lock: Mutex::new(()),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistrySnapshot
// ---------------------------------------------------------------------------

/// An immutable view of the handler and pre-processor bindings.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    handlers: HashMap<Locator, Arc<HandlerDefinition>>,
    preprocessors: HashMap<Locator, PreProcessorBinding>,
    watched: Arc<Vec<TimestampGuard>>,
}

impl RegistrySnapshot {
    /// Builds a snapshot from parsed definitions, initializing pre-processors.
    ///
    /// # Errors
    ///
    /// Fails on an unknown pre-processor name or a failed initialization.
    pub fn build(
        definitions: DefinitionSet,
        factory: &PreProcessorFactory,
        check_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let mut handlers = HashMap::with_capacity(definitions.handlers.len());
        for entry in &definitions.handlers {
            handlers.insert(
                entry.locator.clone(),
                Arc::new(HandlerDefinition::new(entry, check_interval)),
            );
        }

        let mut preprocessors = HashMap::new();
        for entry in definitions.preprocessors {
            if let Some(binding) = bind_preprocessor(&entry, factory)? {
                preprocessors.insert(entry.locator, binding);
            }
        }

        Ok(Self {
            handlers,
            preprocessors,
            watched: Arc::new(definitions.watched),
        })
    }

    /// Most specific handler for `(operation, namespace)`.
    #[must_use]
    pub fn find_handler(&self, operation: &str, namespace: &str) -> Option<&Arc<HandlerDefinition>> {
        Locator::cascade(operation, namespace).iter().find_map(|locator| {
            let found = self.handlers.get(locator);
            tracing::debug!(%locator, found = found.is_some(), "handler lookup");
            found
        })
    }

    /// Most specific pre-processor binding; a disabled binding stops the
    /// search and yields `None`.
    #[must_use]
    pub fn find_preprocessor(&self, operation: &str, namespace: &str) -> Option<&BoundPreProcessor> {
        let binding = Locator::cascade(operation, namespace)
            .iter()
            .find_map(|locator| self.preprocessors.get(locator))?;
        match binding {
            PreProcessorBinding::Enabled(bound) => Some(bound),
            PreProcessorBinding::Disabled => None,
        }
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// True when any watched definition file changed.
    fn definitions_changed(&self) -> bool {
        self.watched.iter().any(TimestampGuard::has_changed)
    }
}

fn bind_preprocessor(
    entry: &PreProcessorEntry,
    factory: &PreProcessorFactory,
) -> Result<Option<PreProcessorBinding>, ConfigError> {
    if entry.name.is_empty() {
        return Ok(Some(PreProcessorBinding::Disabled));
    }
    let mut instance = factory
        .create(&entry.name)
        .ok_or_else(|| ConfigError::UnknownPreProcessor(entry.name.clone()))?;

    let keep = instance
        .initialize(&entry.params)
        .map_err(|err| ConfigError::PreProcessorInit {
            name: entry.name.clone(),
            locator: entry.locator.to_string(),
            message: format!("{err:#}"),
        })?;
    if !keep {
        tracing::warn!(name = %entry.name, locator = %entry.locator, "pre-processor declined its configuration; not bound");
        return Ok(None);
    }
    Ok(Some(PreProcessorBinding::Enabled(BoundPreProcessor {
        name: entry.name.clone(),
        instance: Arc::from(instance),
    })))
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// The handler and pre-processor chosen for one request.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub handler: Arc<HandlerDefinition>,
    pub preprocessor: Option<BoundPreProcessor>,
}

/// Resolves operations to handlers, reloading definitions when they change.
#[derive(Debug)]
pub struct HandlerRegistry {
    root: PathBuf,
    check_interval: Duration,
    factory: PreProcessorFactory,
    snapshot: ArcSwap<RegistrySnapshot>,
    reload_lock: Mutex<()>,
}

impl HandlerRegistry {
    /// Loads the definition file at `root` and everything it includes.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] met while loading.
    pub fn load(
        root: impl Into<PathBuf>,
        check_interval: Duration,
        factory: PreProcessorFactory,
    ) -> Result<Self, ConfigError> {
        let root = root.into();
        let snapshot = RegistrySnapshot::build(
            DefinitionSet::load(&root, check_interval)?,
            &factory,
            check_interval,
        )?;
        tracing::info!(file = %root.display(), handlers = snapshot.handler_count(), "loaded handler definitions");
        Ok(Self {
            root,
            check_interval,
            factory,
            snapshot: ArcSwap::from_pointee(snapshot),
            reload_lock: Mutex::new(()),
        })
    }

    /// The currently published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Rebuilds the snapshot from disk and publishes it.
    ///
    /// # Errors
    ///
    /// On failure the current snapshot stays published.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let _guard = self.reload_lock.lock();
        self.rebuild()
    }

    fn rebuild(&self) -> Result<(), ConfigError> {
        let definitions = DefinitionSet::load(&self.root, self.check_interval)?;
        let snapshot = RegistrySnapshot::build(definitions, &self.factory, self.check_interval)?;
        tracing::info!(file = %self.root.display(), handlers = snapshot.handler_count(), "reloaded handler definitions");
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }

    /// Reloads when a watched definition file changed. Returns whether a new
    /// snapshot was published.
    ///
    /// # Errors
    ///
    /// Returns the reload error; the current snapshot stays published.
    pub fn reload_if_changed(&self) -> Result<bool, ConfigError> {
        let current = self.snapshot.load_full();
        if !current.definitions_changed() {
            return Ok(false);
        }
        let _guard = self.reload_lock.lock();
        if !Arc::ptr_eq(&current, &self.snapshot.load()) {
            // Another caller reloaded while we waited.
            return Ok(false);
        }
        self.rebuild().map(|()| true).inspect_err(|err| {
            tracing::error!(error = %err, "handler definition reload failed; keeping previous definitions");
        })
    }

    /// Finds the handler and pre-processor for `(operation, namespace)`.
    ///
    /// Both come from the same snapshot. A compiled handler whose script
    /// changed is replaced by a fresh definition first.
    ///
    /// # Errors
    ///
    /// Returns the error of a triggered reload that failed.
    pub fn resolve(&self, operation: &str, namespace: &str) -> Result<Option<Resolution>, ConfigError> {
        self.reload_if_changed()?;

        let snapshot = self.snapshot.load_full();
        let Some(handler) = snapshot.find_handler(operation, namespace) else {
            return Ok(None);
        };
        let preprocessor = snapshot.find_preprocessor(operation, namespace).cloned();

        let handler = if handler.is_compiled() && handler.guard.has_changed() {
            self.replace_handler(handler)
        } else {
            Arc::clone(handler)
        };
        Ok(Some(Resolution {
            handler,
            preprocessor,
        }))
    }

    fn replace_handler(&self, stale: &Arc<HandlerDefinition>) -> Arc<HandlerDefinition> {
        tracing::debug!(script = %stale.script_path.display(), "script changed; replacing handler");
        let fresh = Arc::new(stale.fresh(self.check_interval));
        self.snapshot.rcu(|current| {
            let mut next = RegistrySnapshot::clone(current);
            if let Some(slot) = next.handlers.get_mut(&stale.locator) {
                if Arc::ptr_eq(slot, stale) {
                    *slot = Arc::clone(&fresh);
                }
            }
            next
        });
        fresh
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
