//! Workspace boundary: resolution of tool path arguments against allowed roots.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundaryViolation {
    #[error("path escapes workspace: {path}")]
    OutsideRoots { path: PathBuf },

    #[error("path is inside denied root {root}: {path}")]
    DeniedRoot { path: PathBuf, root: PathBuf },
}

impl BoundaryViolation {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::OutsideRoots { path } | Self::DeniedRoot { path, .. } => path,
        }
    }
}

/// Set of filesystem roots a run may touch.
///
/// The workspace root is always the first allowed root and the base for
/// relative paths. Denied roots carve exclusions out of allowed roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceBoundary {
    root: PathBuf,
    allowed: Vec<PathBuf>,
    denied: Vec<PathBuf>,
}

impl WorkspaceBoundary {
    #[must_use]
    pub fn new(root: &Path, allowed_roots: &[PathBuf], denied_roots: &[PathBuf]) -> Self {
        let root = canonicalize_lenient(root);
        let mut allowed = vec![root.clone()];
        for extra in allowed_roots {
            let resolved = canonicalize_lenient(&absolutize(&root, extra));
            if !allowed.contains(&resolved) {
                allowed.push(resolved);
            }
        }
        let denied = denied_roots
            .iter()
            .map(|p| canonicalize_lenient(&absolutize(&root, p)))
            .collect();
        Self {
            root,
            allowed,
            denied,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed
    }

    #[must_use]
    pub fn denied_roots(&self) -> &[PathBuf] {
        &self.denied
    }

    /// Resolve `raw` to an absolute, symlink-free path inside the boundary.
    ///
    /// # Errors
    ///
    /// Returns a `BoundaryViolation` when the resolved path is outside every
    /// allowed root or inside a denied root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, BoundaryViolation> {
        let candidate = absolutize(&self.root, Path::new(raw));
        let Some(resolved) = resolve_lenient(&candidate, MAX_LINK_HOPS) else {
            return Err(BoundaryViolation::OutsideRoots {
                path: normalize_lexically(&candidate),
            });
        };
        if let Some(root) = self.denied.iter().find(|d| resolved.starts_with(d)) {
            return Err(BoundaryViolation::DeniedRoot {
                path: resolved,
                root: root.clone(),
            });
        }
        if self.allowed.iter().any(|a| resolved.starts_with(a)) {
            Ok(resolved)
        } else {
            Err(BoundaryViolation::OutsideRoots { path: resolved })
        }
    }
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Symlink hops followed before a path is treated as unresolvable.
const MAX_LINK_HOPS: usize = 40;

/// Canonicalize through the nearest existing ancestor so that paths which do
/// not exist yet still have their symlinked parents resolved. Falls back to
/// the lexical form when a link chain does not terminate.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    resolve_lenient(path, MAX_LINK_HOPS).unwrap_or_else(|| normalize_lexically(path))
}

/// `None` when the path runs through a symlink loop or a chain longer than
/// `hops`.
fn resolve_lenient(path: &Path, hops: usize) -> Option<PathBuf> {
    let normalized = normalize_lexically(path);
    let mut existing = normalized.as_path();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        if let Ok(meta) = existing.symlink_metadata() {
            if meta.file_type().is_symlink() && !existing.exists() {
                // Dangling link: the write would land on its target.
                let hops = hops.checked_sub(1)?;
                let target = std::fs::read_link(existing).ok()?;
                let parent = existing.parent().unwrap_or(Path::new("/"));
                let parent = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
                let mut next = absolutize(&parent, &target);
                next.extend(missing.iter().rev());
                return resolve_lenient(&next, hops);
            }
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut base = existing
        .canonicalize()
        .ok()
        .or_else(|| (!existing.exists()).then(|| existing.to_path_buf()))?;
    base.extend(missing.iter().rev());
    Some(base)
}
