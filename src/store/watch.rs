//! Store directory watcher
//!
//! Several surfaces (host, CLI, panel bridge) share one `FileStore` directory.
//! This notifies a callback when any record file changes.

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::StoreError;

/// Keeps the watcher alive; dropping it stops notifications.
pub struct StoreWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    dir: PathBuf,
}

impl StoreWatcher {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Store keys touched by a batch of debounced events
fn changed_keys(events: &[DebouncedEvent]) -> Vec<String> {
    let mut keys: Vec<String> = events
        .iter()
        .filter_map(|e| e.path.file_name().map(|n| n.to_string_lossy().to_string()))
        .filter_map(|name| name.strip_suffix(".json").map(|s| s.replace("__", ":")))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Watch `dir` and call `on_change` with the changed keys after each quiet
/// period of `debounce`.
pub fn watch_store<F>(dir: &Path, debounce: Duration, mut on_change: F) -> Result<StoreWatcher, StoreError>
where
    F: FnMut(Vec<String>) + Send + 'static,
{
    let mut debouncer = new_debouncer(
        debounce,
        move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
            Ok(events) => {
                let keys = changed_keys(&events);
                if !keys.is_empty() {
                    on_change(keys);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Store watch error"),
        },
    )
    .map_err(|e| StoreError::Watch(e.to_string()))?;

    debouncer
        .watcher()
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| StoreError::Watch(e.to_string()))?;

    tracing::info!(dir = %dir.display(), "Watching store");

    Ok(StoreWatcher {
        _debouncer: debouncer,
        dir: dir.to_path_buf(),
    })
}
