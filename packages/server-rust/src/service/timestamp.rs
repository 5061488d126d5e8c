//! Debounced modification checks on watched files.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

/// Default minimum time between two real filesystem checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(300);

/// Remembers the modification time of one file and reports changes.
///
/// Checks inside the debounce interval after the previous real check return
/// `false` without touching the filesystem.
#[derive(Debug)]
pub struct TimestampGuard {
    path: PathBuf,
    interval: Duration,
    state: Mutex<GuardState>,
}

#[derive(Debug)]
struct GuardState {
    last_check: Option<Instant>,
    last_modified: Option<SystemTime>,
}

impl TimestampGuard {
    /// Captures the file's current modification time.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            interval,
            state: Mutex::new(GuardState {
                last_check: None,
                last_modified,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the modification time differs from the one last observed.
    ///
    /// A change is reported once: the new time becomes the reference.
    pub fn has_changed(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state
            .last_check
            .is_some_and(|last| now.duration_since(last) < self.interval)
        {
            return false;
        }
        state.last_check = Some(now);

        let current = modified(&self.path);
        if current == state.last_modified {
            false
        } else {
            state.last_modified = current;
            true
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
