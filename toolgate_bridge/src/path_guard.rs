//! Path containment guard.
//!
//! Every operation that touches the filesystem, or launches a process inside a
//! working directory, resolves its path through [`PathGuard::resolve`] first.
//! Roots are canonicalized once at construction; candidates are canonicalized
//! when they exist, otherwise their nearest existing ancestor is canonicalized
//! and the missing tail is re-applied lexically, so a symlinked parent cannot be
//! used to step outside a root.
//!
//! An empty guard rejects every path.

use crate::error::{GatewayError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
}

impl PathGuard {
    /// Builds a guard from configured roots. Roots that cannot be canonicalized
    /// are skipped with a warning.
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut canonical_roots: Vec<PathBuf> = Vec::new();
        for root in roots {
            let root = root.as_ref();
            match std::fs::canonicalize(root) {
                Ok(canonical) => {
                    if !canonical_roots.contains(&canonical) {
                        canonical_roots.push(canonical);
                    }
                }
                Err(e) => {
                    warn!(root = %root.display(), "Ignoring allowed directory: {}", e);
                }
            }
        }
        Self {
            roots: canonical_roots,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn is_allowed(&self, candidate: impl AsRef<Path>) -> bool {
        self.resolve(candidate).is_ok()
    }

    /// Returns the normalized absolute form of `candidate` if it lies inside
    /// one of the roots.
    pub fn resolve(&self, candidate: impl AsRef<Path>) -> Result<PathBuf> {
        let candidate = candidate.as_ref();
        let denied = || GatewayError::PathNotAllowed {
            path: candidate.to_path_buf(),
        };

        let first_root = self.roots.first().ok_or_else(denied)?;
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            first_root.join(candidate)
        };

        let normalized = normalize_existing(&absolute);
        if self
            .roots
            .iter()
            .any(|root| is_within(&normalized, root))
        {
            Ok(normalized)
        } else {
            Err(denied())
        }
    }
}

/// Canonicalizes the longest existing prefix of `path` and re-applies the rest.
fn normalize_existing(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    for ancestor in path.ancestors().skip(1) {
        if let Ok(canonical) = std::fs::canonicalize(ancestor) {
            let tail = path.strip_prefix(ancestor).unwrap_or(path);
            return normalize_lexically(&canonical.join(tail));
        }
    }
    normalize_lexically(path)
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut stack = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if stack
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    stack.pop();
                }
            }
            c => stack.push(c),
        }
    }

    stack.iter().collect()
}

/// Relative form of `path` as seen from `root`, in the style of a lexical
/// `relative(root, path)`: leading `..` segments when `path` is not below
/// `root`, or `path` itself when they share no common prefix.
fn relative_form(path: &Path, root: &Path) -> PathBuf {
    let mut path_components = path.components().peekable();
    let mut root_components = root.components().peekable();

    while let (Some(a), Some(b)) = (path_components.peek(), root_components.peek()) {
        if a != b {
            break;
        }
        path_components.next();
        root_components.next();
    }

    if matches!(
        path_components.peek(),
        Some(Component::Prefix(_) | Component::RootDir)
    ) {
        return path.to_path_buf();
    }

    let mut relative = PathBuf::new();
    for _ in root_components {
        relative.push("..");
    }
    for component in path_components {
        relative.push(component.as_os_str());
    }
    relative
}

fn is_within(path: &Path, root: &Path) -> bool {
    let relative = relative_form(path, root);
    !relative.is_absolute() && !matches!(relative.components().next(), Some(Component::ParentDir))
}
