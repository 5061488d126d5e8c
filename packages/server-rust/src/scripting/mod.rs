//! Script engines and the bridge handlers use to talk to the connector.
//!
//! The engine is picked by file extension:
//!
//! | Extension | Engine                                   |
//! |-----------|------------------------------------------|
//! | `.xml`    | NativeML template ([`template`])         |
//! | `.rhai`   | Rhai script ([`rhai_engine`])            |
//!
//! Every engine compiles once and executes many times against an
//! [`ExecutionBridge`]. Besides the bridge calls, a handler can produce a
//! response through its return value or its printed output; see
//! [`ExecutionBridge::resolve_response`] for the precedence.

pub mod bridge;
pub mod rhai_engine;
pub mod template;

use std::path::{Path, PathBuf};

pub use bridge::{BridgeError, ExecutionBridge, HandlerFault, ResponseParts, SharedBridge};

use self::rhai_engine::RhaiScript;
use self::template::Template;

/// The script engines known to the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    NativeMl,
    Rhai,
}

impl ScriptKind {
    /// Picks the engine for `path` from its extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "xml" => Some(Self::NativeMl),
            "rhai" => Some(Self::Rhai),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NativeMl => "nativeml",
            Self::Rhai => "rhai",
        }
    }
}

/// What a script produced besides its bridge calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    /// Final value of the script, if it had one.
    pub returned: Option<String>,
    /// Everything the script printed.
    pub printed: String,
}

/// Errors from compiling or running a script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("unable to read script {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to compile {}: {message}", path.display())]
    Compile { path: PathBuf, message: String },

    #[error("script {} failed: {message}", path.display())]
    Runtime { path: PathBuf, message: String },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// A script ready to run.
#[derive(Debug)]
pub enum CompiledScript {
    Template(Template),
    Rhai(RhaiScript),
}

impl CompiledScript {
    /// Reads and compiles `path` with the engine for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Read`] or [`ScriptError::Compile`].
    pub fn compile(kind: ScriptKind, path: &Path) -> Result<Self, ScriptError> {
        let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let compile_error = |message: String| ScriptError::Compile {
            path: path.to_path_buf(),
            message,
        };
        let compiled = match kind {
            ScriptKind::NativeMl => Self::Template(Template::parse(&source).map_err(compile_error)?),
            ScriptKind::Rhai => Self::Rhai(RhaiScript::compile(&source).map_err(compile_error)?),
        };
        tracing::debug!(script = %path.display(), kind = kind.as_str(), "compiled script");
        Ok(compiled)
    }

    #[must_use]
    pub fn kind(&self) -> ScriptKind {
        match self {
            Self::Template(_) => ScriptKind::NativeMl,
            Self::Rhai(_) => ScriptKind::Rhai,
        }
    }

    /// Runs the script against `bridge`. Blocks on outbound calls.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Bridge`] when a bridge call failed or the script
    /// raised a fault, and [`ScriptError::Runtime`] for any other failure.
    pub fn execute(&self, path: &Path, bridge: &SharedBridge) -> Result<ScriptOutput, ScriptError> {
        match self {
            Self::Template(template) => {
                let rendered = template.render(&bridge.lock());
                Ok(ScriptOutput {
                    returned: Some(rendered).filter(|text| !text.trim().is_empty()),
                    printed: String::new(),
                })
            }
            Self::Rhai(script) => script.execute(bridge).map_err(|err| match err {
                rhai_engine::RhaiFailure::Bridge(err) => ScriptError::Bridge(err),
                rhai_engine::RhaiFailure::Script(message) => ScriptError::Runtime {
                    path: path.to_path_buf(),
                    message,
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_extension() {
        assert_eq!(ScriptKind::from_path(Path::new("a/b.xml")), Some(ScriptKind::NativeMl));
        assert_eq!(ScriptKind::from_path(Path::new("b.rhai")), Some(ScriptKind::Rhai));
        assert_eq!(ScriptKind::from_path(Path::new("b.js")), None);
        assert_eq!(ScriptKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn compile_reports_missing_and_invalid_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.rhai");
        assert!(matches!(
            CompiledScript::compile(ScriptKind::Rhai, &missing),
            Err(ScriptError::Read { .. })
        ));

        let broken = dir.path().join("broken.rhai");
        std::fs::write(&broken, "let x = ;").unwrap();
        assert!(matches!(
            CompiledScript::compile(ScriptKind::Rhai, &broken),
            Err(ScriptError::Compile { .. })
        ));

        let template = dir.path().join("t.xml");
        std::fs::write(&template, "<a>{{nope}}</a>").unwrap();
        assert!(matches!(
            CompiledScript::compile(ScriptKind::NativeMl, &template),
            Err(ScriptError::Compile { .. })
        ));
    }
}
