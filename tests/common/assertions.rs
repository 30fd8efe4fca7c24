//! Custom assertions over the on-disk archive

use replay_archiver::Event;
use std::path::Path;
use tokio::sync::broadcast;
use walkdir::WalkDir;

/// Number of blob files under `root`, ignoring the staging directory
pub fn count_blob_files(root: &Path, extension: &str) -> usize {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".tmp")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == extension))
        .count()
}

/// Files left in the staging directory
pub fn staged_files(root: &Path) -> usize {
    std::fs::read_dir(root.join(".tmp"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

/// Drain every event already buffered on `events`
pub fn drain_events(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
