//! Pre-processors: logic that runs before a handler and may short-circuit it.
//!
//! Pre-processors are looked up by name in a [`PreProcessorFactory`] when the
//! definition files are loaded. An empty name in a definition file produces
//! [`PreProcessorBinding::Disabled`], which masks broader bindings.

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use scriptgate_core::{Envelope, Locator, RequestMetadata};

// ---------------------------------------------------------------------------
// PreProcessor trait
// ---------------------------------------------------------------------------

/// What a pre-processor sees of the request it runs for.
pub struct PreProcessInvocation<'a> {
    /// Locator of the handler about to run.
    pub locator: &'a Locator,
    /// Script file of that handler.
    pub script_path: &'a Path,
    pub metadata: &'a RequestMetadata,
    pub request: &'a Envelope,
    /// Response envelope; a pre-processor that stops the request writes its
    /// own response here.
    pub response: &'a mut Envelope,
}

/// A pre-processor capability.
pub trait PreProcessor: Send + Sync {
    /// Configures the instance from its definition-file parameters.
    ///
    /// Returning `Ok(false)` drops the binding without failing the load.
    ///
    /// # Errors
    ///
    /// An error aborts the whole definition reload.
    fn initialize(&mut self, params: &HashMap<String, String>) -> anyhow::Result<bool>;

    /// Runs before the handler. `Ok(false)` stops the request here.
    ///
    /// # Errors
    ///
    /// Errors are reported to the caller as an unclassified fault.
    fn execute(&self, invocation: &mut PreProcessInvocation<'_>) -> anyhow::Result<bool>;
}

/// A named, initialized pre-processor instance.
#[derive(Clone)]
pub struct BoundPreProcessor {
    pub name: String,
    pub instance: Arc<dyn PreProcessor>,
}

impl fmt::Debug for BoundPreProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoundPreProcessor").field(&self.name).finish()
    }
}

/// A configured pre-processor or an explicit opt-out.
#[derive(Debug, Clone)]
pub enum PreProcessorBinding {
    Enabled(BoundPreProcessor),
    Disabled,
}

// ---------------------------------------------------------------------------
// PreProcessorFactory
// ---------------------------------------------------------------------------

type Constructor = Arc<dyn Fn() -> Box<dyn PreProcessor> + Send + Sync>;

/// Maps pre-processor names used in definition files to constructors.
#[derive(Clone, Default)]
pub struct PreProcessorFactory {
    constructors: HashMap<String, Constructor>,
}

impl PreProcessorFactory {
    /// An empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory holding the built-in pre-processors.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register(RequestLogger::NAME, || Box::new(RequestLogger::default()));
        factory
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Box<dyn PreProcessor> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    /// Creates a fresh, uninitialized instance.
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Box<dyn PreProcessor>> {
        self.constructors.get(name).map(|ctor| ctor())
    }
}

impl fmt::Debug for PreProcessorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// RequestLogger
// ---------------------------------------------------------------------------

/// Serializes writers across every logger instance in the process.
static LOG_FILE_LOCK: Mutex<()> = parking_lot::const_mutex(());

const END_OF_RECORD: &str =
    "================================================================================";

/// Appends every request it sees to `request-log.<date>.txt` in the folder
/// given by the `outputfolder` parameter.
#[derive(Debug, Default)]
pub struct RequestLogger {
    output_folder: PathBuf,
}

impl RequestLogger {
    pub const NAME: &'static str = "request-logger";
}

impl PreProcessor for RequestLogger {
    fn initialize(&mut self, params: &HashMap<String, String>) -> anyhow::Result<bool> {
        let folder = params
            .get("outputfolder")
            .filter(|f| !f.is_empty())
            .ok_or_else(|| anyhow::anyhow!("output folder is not set"))?;
        let folder = PathBuf::from(folder);
        std::fs::create_dir_all(&folder).map_err(|e| {
            anyhow::anyhow!("unable to create output folder {}: {e}", folder.display())
        })?;
        self.output_folder = folder;
        Ok(true)
    }

    fn execute(&self, invocation: &mut PreProcessInvocation<'_>) -> anyhow::Result<bool> {
        let now = chrono::Local::now();
        let path = self
            .output_folder
            .join(format!("request-log.{}.txt", now.format("%Y-%m-%d")));

        let script_name = invocation
            .script_path
            .file_name()
            .map_or_else(|| invocation.locator.to_string(), |n| n.to_string_lossy().into_owned());
        let request = invocation
            .request
            .method()
            .map(scriptgate_core::Element::to_xml)
            .unwrap_or_default();

        let _guard = LOG_FILE_LOCK.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("unable to write log file {}: {e}", path.display()))?;
        writeln!(
            file,
            "{script_name}\n{}\n{request}\n{END_OF_RECORD}",
            now.format("%Y-%m-%d %H:%M:%S%.3f")
        )?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
