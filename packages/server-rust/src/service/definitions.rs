//! Handler definition files.
//!
//! Definition files use the `key=value` properties format:
//!
//! ```text
//! property.file.default.namespace=urn:orders
//! property.file.include=shared/common.properties
//! GetOrder=scripts/get_order.rhai
//! GetOrder.namespace=urn:orders:v2
//! *=scripts/fallback.xml
//! GetOrder.preprocessor=request-logger
//! GetOrder.preprocessor.outputfolder=/var/log/orders
//! ```
//!
//! Includes are resolved relative to the including file and every file read
//! becomes a watched file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scriptgate_core::{Locator, Selector};

use super::config::ConfigError;
use super::timestamp::TimestampGuard;
use crate::scripting::ScriptKind;

const DEFAULT_NAMESPACE_KEY: &str = "property.file.default.namespace";
const INCLUDE_KEY: &str = "property.file.include";
const NAMESPACE_SUFFIX: &str = ".namespace";
const WILDCARD: &str = "*";

static PREPROCESSOR_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^.]+)\.preprocessor$").expect("valid regex"));
static PREPROCESSOR_PARAM_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^.]+)\.preprocessor\.(.+)$").expect("valid regex"));

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// Ordered `key=value` pairs. A repeated key keeps its first position and its
/// last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    /// Parses properties text.
    ///
    /// Supports `#`/`!` comments, `=`, `:` or whitespace separators, trailing
    /// backslash continuations and the usual escapes (`\t`, `\n`, `\uXXXX`, ...).
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut props = Self::default();
        let mut lines = text.lines();

        while let Some(line) = lines.next() {
            let mut logical = line.trim_start().to_string();
            if logical.is_empty() || logical.starts_with('#') || logical.starts_with('!') {
                continue;
            }
            while ends_with_continuation(&logical) {
                logical.pop();
                match lines.next() {
                    Some(next) => logical.push_str(next.trim_start()),
                    None => break,
                }
            }
            let (key, value) = split_entry(&logical);
            props.insert(unescape(key), unescape(value));
        }
        props
    }

    pub fn insert(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn into_map(self) -> HashMap<String, String> {
        self.entries.into_iter().collect()
    }
}

fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

fn split_entry(line: &str) -> (&str, &str) {
    let mut escaped = false;
    let mut key_end = line.len();
    for (idx, c) in line.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '=' || c == ':' || c.is_whitespace() {
            key_end = idx;
            break;
        }
    }
    let key = &line[..key_end];
    let mut rest = line[key_end..].trim_start();
    if let Some(stripped) = rest.strip_prefix(['=', ':']) {
        rest = stripped.trim_start();
    }
    (key, rest)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => out.push_str(&hex),
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Reads and parses a properties file.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read.
pub fn read_properties(path: &Path) -> Result<Properties, ConfigError> {
    std::fs::read_to_string(path)
        .map(|text| Properties::parse(&text))
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Loaded definitions
// ---------------------------------------------------------------------------

/// A handler entry: locator (carrying its defining file), engine and script.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    pub locator: Locator,
    pub kind: ScriptKind,
    pub script_path: PathBuf,
}

/// A pre-processor entry. An empty `name` means explicitly disabled.
#[derive(Debug, Clone)]
pub struct PreProcessorEntry {
    pub locator: Locator,
    pub name: String,
    pub params: HashMap<String, String>,
}

/// Everything read from a definition file and its includes, in file order.
#[derive(Debug, Default)]
pub struct DefinitionSet {
    pub handlers: Vec<HandlerEntry>,
    pub preprocessors: Vec<PreProcessorEntry>,
    pub watched: Vec<TimestampGuard>,
}

impl DefinitionSet {
    /// Loads `root` and every file it includes.
    ///
    /// # Errors
    ///
    /// Fails on the first missing include or script file, unreadable file,
    /// include cycle, or script with no matching engine.
    pub fn load(root: &Path, check_interval: Duration) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        let mut stack = HashSet::new();
        set.load_file(root, &mut stack, check_interval)?;
        Ok(set)
    }

    fn load_file(
        &mut self,
        file: &Path,
        stack: &mut HashSet<PathBuf>,
        check_interval: Duration,
    ) -> Result<(), ConfigError> {
        if !file.exists() {
            return Err(ConfigError::MissingFile {
                kind: "property file",
                path: file.to_path_buf(),
            });
        }
        let identity = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());
        if !stack.insert(identity.clone()) {
            return Err(ConfigError::IncludeCycle(file.to_path_buf()));
        }

        tracing::debug!(file = %file.display(), "loading handler definitions");
        let props = read_properties(file)?;
        self.watched.push(TimestampGuard::new(file, check_interval));

        let folder = file.parent().unwrap_or_else(|| Path::new("."));
        let default_namespace = props.get(DEFAULT_NAMESPACE_KEY).filter(|ns| !ns.is_empty());

        let mut preprocessor_names: Vec<(&str, &str)> = Vec::new();
        let mut preprocessor_params: HashMap<&str, HashMap<String, String>> = HashMap::new();

        for (key, value) in props.iter() {
            if key == DEFAULT_NAMESPACE_KEY {
                continue;
            }
            if key == INCLUDE_KEY || key.starts_with(&format!("{INCLUDE_KEY}.")) {
                self.load_file(&resolve(folder, value), stack, check_interval)?;
            } else if key.ends_with(NAMESPACE_SUFFIX) {
                continue;
            } else if let Some(caps) = PREPROCESSOR_KEY.captures(key) {
                if let Some(name) = caps.get(1) {
                    preprocessor_names.push((name.as_str(), value));
                }
            } else if let Some(caps) = PREPROCESSOR_PARAM_KEY.captures(key) {
                if let (Some(name), Some(param)) = (caps.get(1), caps.get(2)) {
                    preprocessor_params
                        .entry(name.as_str())
                        .or_default()
                        .insert(param.as_str().to_string(), value.to_string());
                }
            } else {
                let script_path = resolve(folder, value);
                if !script_path.exists() {
                    return Err(ConfigError::MissingFile {
                        kind: "script file",
                        path: script_path,
                    });
                }
                let kind = ScriptKind::from_path(&script_path)
                    .ok_or_else(|| ConfigError::UnsupportedScript(script_path.clone()))?;

                let namespace = props
                    .get(&format!("{key}{NAMESPACE_SUFFIX}"))
                    .filter(|ns| !ns.is_empty())
                    .or(default_namespace);
                let locator = Locator::new(operation_selector(key), Selector::from_option(namespace))
                    .with_source(file);

                self.handlers.push(HandlerEntry {
                    locator,
                    kind,
                    script_path,
                });
            }
        }

        for (name, class) in preprocessor_names {
            let locator = Locator::new(operation_selector(name), Selector::from_option(default_namespace))
                .with_source(file);
            self.preprocessors.push(PreProcessorEntry {
                locator,
                name: class.trim().to_string(),
                params: preprocessor_params.remove(name).unwrap_or_default(),
            });
        }

        stack.remove(&identity);
        Ok(())
    }
}

fn operation_selector(name: &str) -> Selector {
    if name == WILDCARD {
        Selector::Any
    } else {
        Selector::Named(name.to_string())
    }
}

fn resolve(folder: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value.trim());
    if path.is_absolute() {
        path
    } else {
        folder.join(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
