//! The no-copy list: path prefixes that are never replicated.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::paths::wire_path;

/// Prefixes excluded on every server: pseudo-filesystems, runtime state,
/// quota and swap files, and the agent's own spool.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    "/aquota.group",
    "/aquota.user",
    "/dev/pts",
    "/dev/shm",
    "/lost+found",
    "/proc",
    "/run",
    "/swapfile",
    "/sys",
    "/var/lib/failover-agent",
    "/var/lock",
    "/var/run",
];

/// Sorted, immutable set of wire-path prefixes.
///
/// Built once per run with the consuming `with_*` methods, then shared
/// read-only with the walker.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRegistry {
    prefixes: BTreeSet<PathBuf>,
}

impl ExclusionRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        Self::empty().with_prefixes(DEFAULT_EXCLUSIONS.iter().map(PathBuf::from))
    }

    /// Add prefixes already expressed as wire paths. Relative entries are ignored.
    pub fn with_prefixes<I, P>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.prefixes
            .extend(prefixes.into_iter().map(Into::into).filter(|p| p.is_absolute()));
        self
    }

    /// Add local paths (data dir, backup mounts), keeping only those inside `root`.
    pub fn with_local_paths<I, P>(self, root: &Path, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let wire: Vec<PathBuf> = paths
            .into_iter()
            .filter_map(|p| wire_path(root, p.as_ref()))
            .collect();
        self.with_prefixes(wire)
    }

    /// True when `wire` or any of its ancestors is a registered prefix.
    pub fn is_excluded(&self, wire: &Path) -> bool {
        wire.ancestors().any(|ancestor| self.prefixes.contains(ancestor))
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &Path> {
        self.prefixes.iter().map(PathBuf::as_path)
    }

    pub fn prefix_count(&self) -> usize {
        self.prefixes.len()
    }
}
