//! Filesystem sandbox.
//!
//! Every path an instruction touches is resolved against a single root
//! directory, symlinks included, and rejected unless it lands on the root or
//! below it. Resolution never consults the process's current directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Sample files written by [`Sandbox::seed_fixtures`].
const FIXTURES: &[(&str, &str)] = &[
    (
        "test.txt",
        "This is a test file\nIt has multiple lines\nSome lines have errors\nERROR: test error\nLet's break this down",
    ),
    (
        "test.py",
        "print(\"Hello from Python\")\n# Test comment\nvar = \"test\"\nif True:\n    break",
    ),
    (
        "logs/app.log",
        "ERROR: Another error\nInfo: normal log\nDebug: break point hit",
    ),
    ("data.txt", "Test data 1\nTest data 2\nTest data 1\nBreak time"),
];

/// Dangling symlink chains longer than this are rejected.
const MAX_LINK_DEPTH: u8 = 8;

#[derive(Debug, Clone)]
pub struct Sandbox {
    /// Canonical (absolute, symlink-free) root
    root: PathBuf,
}

impl Sandbox {
    /// Opens the sandbox at `root`, creating the directory if needed.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("creating sandbox root {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("resolving sandbox root {}", root.display()))?;
        info!("Sandbox root: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True iff `candidate`, resolved from `base`, stays inside the root.
    pub fn is_contained(&self, base: &Path, candidate: &str) -> bool {
        self.resolve(base, candidate).is_some()
    }

    /// Resolves `candidate` relative to `base` (a directory inside the
    /// sandbox) and returns the canonical path if it is contained.
    ///
    /// A leaf that does not exist yet is accepted when its parent resolves
    /// inside the root. A dangling symlink is judged by its target. Any other
    /// resolution failure yields `None`.
    pub fn resolve(&self, base: &Path, candidate: &str) -> Option<PathBuf> {
        let resolved = resolve_path(&base.join(candidate), MAX_LINK_DEPTH)?;
        if resolved.starts_with(&self.root) {
            Some(resolved)
        } else {
            debug!("Path escapes sandbox: {candidate} -> {}", resolved.display());
            None
        }
    }

    /// Absolute directory for a path stored relative to the root.
    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Path of `absolute` relative to the root (empty for the root itself).
    pub fn relative(&self, absolute: &Path) -> PathBuf {
        absolute
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Writes the sample files into the sandbox, overwriting existing ones.
    /// Returns the number of files written.
    pub fn seed_fixtures(&self) -> Result<usize> {
        for (name, content) in FIXTURES {
            let path = self.root.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)
                .with_context(|| format!("writing fixture {}", path.display()))?;
        }
        info!("Seeded {} fixture files", FIXTURES.len());
        Ok(FIXTURES.len())
    }
}

/// Canonical form of `path`, allowing a missing leaf under an existing
/// parent. A leaf that is a dangling symlink resolves to where it points.
fn resolve_path(path: &Path, depth: u8) -> Option<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Some(resolved);
    }

    // `file_name()` is None for paths ending in `..`
    let name = path.file_name()?;
    let parent = path.parent()?.canonicalize().ok()?;
    let leaf = parent.join(name);
    match fs::symlink_metadata(&leaf) {
        Err(e) if e.kind() == ErrorKind::NotFound => Some(leaf),
        Ok(meta) if meta.file_type().is_symlink() && depth > 0 => {
            let target = fs::read_link(&leaf).ok()?;
            resolve_path(&parent.join(target), depth - 1)
        }
        _ => None,
    }
}
