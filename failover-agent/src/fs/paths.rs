//! Mapping between wire paths (`/` = tree root) and local paths.

use std::path::{Path, PathBuf};

/// Wire path of `local` inside the tree rooted at `root`, or `None` if it lies outside.
pub fn wire_path(root: &Path, local: &Path) -> Option<PathBuf> {
    let relative = local.strip_prefix(root).ok()?;
    Some(Path::new("/").join(relative))
}

/// Local path of a validated wire path under `root`.
pub fn local_path(root: &Path, wire: &Path) -> PathBuf {
    match wire.strip_prefix("/") {
        Ok(relative) if !relative.as_os_str().is_empty() => root.join(relative),
        _ => root.to_path_buf(),
    }
}
