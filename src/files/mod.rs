use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const YAML_EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Expand a configured path into the files to scan.
///
/// A file is returned as is. A directory is walked recursively, skipping
/// `.git` and keeping YAML files only, in file name order. A missing path
/// yields nothing.
pub fn find_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    if !path.is_dir() {
        warn!("Path {} does not exist", path.display());
        return Vec::new();
    }

    let walker = WalkBuilder::new(path)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to walk {}: {}", path.display(), e);
                continue;
            },
        };
        if entry.file_type().is_some_and(|t| t.is_file()) && is_yaml(entry.path()) {
            files.push(entry.into_path());
        }
    }

    debug!("Found {} files under {}", files.len(), path.display());
    files
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| YAML_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}
