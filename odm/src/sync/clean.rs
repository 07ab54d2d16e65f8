use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub kept: u64,
    pub removed: u64,
    pub failures: u64,
}

/// Deletes regular files under `root` whose '/'-joined relative path is not
/// in `keep`. Directories are left in place.
pub fn clean_filetree(root: &Path, keep: &HashSet<String>) -> CleanReport {
    let mut report = CleanReport::default();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("error walking {}: {err}", root.display());
                report.failures += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(segments) = relative
            .iter()
            .map(|part| part.to_str())
            .collect::<Option<Vec<_>>>()
        else {
            warn!(path = %entry.path().display(), "leaving non UTF-8 path alone");
            continue;
        };

        if keep.contains(&segments.join("/")) {
            report.kept += 1;
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                info!(path = %entry.path().display(), "removed");
                report.removed += 1;
            }
            Err(err) => {
                warn!(path = %entry.path().display(), "failed to remove: {err}");
                report.failures += 1;
            }
        }
    }

    report
}
