//! Custom properties exposed to handlers, reloaded when their file changes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use super::config::ConfigError;
use super::definitions::read_properties;
use super::timestamp::TimestampGuard;

/// Read-mostly view of the custom property file.
///
/// Without a backing file every lookup returns `None`.
#[derive(Debug)]
pub struct CustomProperties {
    values: ArcSwap<HashMap<String, String>>,
    guard: Option<TimestampGuard>,
}

impl CustomProperties {
    /// Properties with no backing file.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            values: ArcSwap::from_pointee(HashMap::new()),
            guard: None,
        }
    }

    /// Loads `path` and watches it for changes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read.
    pub fn load(path: &Path, check_interval: Duration) -> Result<Self, ConfigError> {
        let values = read_properties(path)?.into_map();
        Ok(Self {
            values: ArcSwap::from_pointee(values),
            guard: Some(TimestampGuard::new(path, check_interval)),
        })
    }

    /// Re-reads the file if it changed. A failed re-read keeps the old values.
    pub fn refresh(&self) {
        let Some(guard) = &self.guard else {
            return;
        };
        if !guard.has_changed() {
            return;
        }
        match read_properties(guard.path()) {
            Ok(props) => {
                tracing::debug!(file = %guard.path().display(), "reloaded custom properties");
                self.values.store(Arc::new(props.into_map()));
            }
            Err(err) => tracing::warn!(error = %err, "unable to reload custom properties"),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.values.load().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::SystemTime;

    use super::*;

    #[test]
    fn empty_has_no_values() {
        let props = CustomProperties::empty();
        props.refresh();
        assert_eq!(props.get("any"), None);
    }

    #[test]
    fn reloads_after_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.properties");
        std::fs::write(&path, "endpoint=http://a\n").unwrap();

        let props = CustomProperties::load(&path, Duration::ZERO).unwrap();
        assert_eq!(props.get("endpoint").as_deref(), Some("http://a"));

        std::fs::write(&path, "endpoint=http://b\n").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        props.refresh();
        assert_eq!(props.get("endpoint").as_deref(), Some("http://b"));
    }
}
