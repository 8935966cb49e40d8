use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Replace every `image:old` with `image:new` in a file.
///
/// The replacement is a literal substring match. The file is rewritten
/// atomically, keeping its permissions, and only when the content changed.
/// Returns whether a write happened.
pub fn apply_change(path: &Path, image: &str, old: &str, new: &str) -> Result<bool> {
    let original = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let from = format!("{}:{}", image, old);
    let to = format!("{}:{}", image, new);
    let updated = original.replace(&from, &to);

    if updated == original {
        debug!("No changes detected in {} for {}", path.display(), from);
        return Ok(false);
    }

    write_preserving_permissions(path, &updated)?;
    info!("Updated {}: {} -> {}", path.display(), from, to);
    Ok(true)
}

/// Atomically replace the file `path` points at.
///
/// Symlinks are resolved first so the link stays in place and its target
/// receives the new content.
fn write_preserving_permissions(path: &Path, content: &str) -> Result<()> {
    let resolved = fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let path = resolved.as_path();

    let permissions = fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .permissions();

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().set_permissions(permissions)?;

    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
