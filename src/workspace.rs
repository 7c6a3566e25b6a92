//! Private scratch directory holding the named pipes of one build
//!
//! The workspace owns a uniquely named directory for its whole lifetime and is
//! the only place entry names are turned into filesystem paths. Every path the
//! provisioner touches comes out of [`Workspace::resolve`], so the containment
//! check and the later `mkfifo` operate on the same string.

use crate::error::{PipeZipError, Result};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Prefix of every workspace directory name
const WORKSPACE_PREFIX: &str = "pipe-zip-";

/// An entry name validated against the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Normalized archive name (components joined with `/`)
    pub name: String,
    /// Absolute location of the entry's named pipe
    pub path: PathBuf,
    /// `path` with every existing ancestor's symlinks resolved
    pub canonical: PathBuf,
}

/// Outcome of [`Workspace::teardown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The directory tree was removed by this call
    Removed,
    /// A previous call already removed it
    AlreadyRemoved,
}

enum State {
    Live(TempDir),
    /// A removal attempt failed; the directory may still exist
    Failed,
    Removed,
}

/// Uniquely named scratch directory with path containment checks
pub struct Workspace {
    root: PathBuf,
    state: State,
}

impl Workspace {
    /// Create a fresh workspace directory under `base`
    pub fn create(base: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(base)
            .map_err(|source| PipeZipError::Provisioning {
                path: base.to_path_buf(),
                source,
            })?;

        // Canonical root so containment checks compare like with like
        // (e.g. /tmp being a symlink on some systems)
        let root = dir
            .path()
            .canonicalize()
            .map_err(|source| PipeZipError::Provisioning {
                path: dir.path().to_path_buf(),
                source,
            })?;

        debug!(root = %root.display(), "created workspace");

        Ok(Self {
            root,
            state: State::Live(dir),
        })
    }

    /// Absolute, canonical root of the workspace
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the directory tree has been removed
    pub fn is_removed(&self) -> bool {
        matches!(self.state, State::Removed)
    }

    /// Validate an entry name and resolve it to a path strictly inside the workspace
    ///
    /// Absolute names and `..` segments that climb above the root are rejected
    /// with [`PipeZipError::PathEscape`], as are names routed outside through a
    /// symlink that already exists in the workspace. The final component does
    /// not need to exist.
    pub fn resolve(&self, name: &str) -> Result<ResolvedPath> {
        if !matches!(self.state, State::Live(_)) {
            return Err(PipeZipError::ContractViolation(
                "workspace has been torn down".to_string(),
            ));
        }

        check_name_shape(name)?;

        let escape = || PipeZipError::PathEscape {
            name: name.to_string(),
        };

        let mut parts: Vec<&OsStr> = Vec::new();
        for component in Path::new(name).components() {
            match component {
                Component::Normal(part) => parts.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    parts.pop().ok_or_else(escape)?;
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }

        // "a/.." names the root itself, which is not strictly inside it
        if parts.is_empty() {
            return Err(escape());
        }

        let mut path = self.root.clone();
        path.extend(parts.iter());

        let anchored = canonicalize_existing(&path).ok_or_else(escape)?;
        if anchored == self.root || !anchored.starts_with(&self.root) {
            return Err(escape());
        }

        let normalized = parts
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        Ok(ResolvedPath {
            name: normalized,
            path,
            canonical: anchored,
        })
    }

    /// Recursively remove the workspace directory
    ///
    /// Safe to call more than once: later calls report [`Teardown::AlreadyRemoved`].
    pub fn teardown(&mut self) -> Result<Teardown> {
        let result = match std::mem::replace(&mut self.state, State::Removed) {
            State::Removed => return Ok(Teardown::AlreadyRemoved),
            State::Live(dir) => dir.close(),
            State::Failed => match fs::remove_dir_all(&self.root) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };

        match result {
            Ok(()) => {
                debug!(root = %self.root.display(), "removed workspace");
                Ok(Teardown::Removed)
            }
            Err(source) => {
                warn!(root = %self.root.display(), error = %source, "failed to remove workspace");
                self.state = State::Failed;
                Err(PipeZipError::Teardown {
                    path: self.root.clone(),
                    source,
                })
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Live directories are removed by TempDir's own drop
        if matches!(self.state, State::Failed) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root)
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Reject names that can never be a valid archive entry
fn check_name_shape(name: &str) -> Result<()> {
    let violation = |why: &str| Err(PipeZipError::ContractViolation(format!("{why}: {name:?}")));

    if name.is_empty() {
        return violation("entry name must not be empty");
    }
    if name.contains('\0') {
        return violation("entry name must not contain NUL bytes");
    }
    if name.ends_with('/') {
        return violation("entry name must name a file, not a directory");
    }
    // The compressor would parse it as an option
    if name.starts_with('-') {
        return violation("entry name must not start with '-'");
    }
    Ok(())
}

/// Canonicalize the deepest existing ancestor of `path` and re-attach the
/// non-existing tail
///
/// Returns `None` when an existing ancestor cannot be canonicalized, e.g. a
/// dangling symlink whose destination cannot be checked.
fn canonicalize_existing(path: &Path) -> Option<PathBuf> {
    for ancestor in path.ancestors() {
        match fs::symlink_metadata(ancestor) {
            Ok(_) => {
                let canonical = fs::canonicalize(ancestor).ok()?;
                let tail = path.strip_prefix(ancestor).ok()?;
                return Some(if tail.as_os_str().is_empty() {
                    canonical
                } else {
                    canonical.join(tail)
                });
            }
            Err(_) => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let base = tempdir().unwrap();
        let ws = Workspace::create(base.path()).unwrap();
        (base, ws)
    }

    #[test]
    fn test_create_is_unique_and_prefixed() {
        let base = tempdir().unwrap();
        let first = Workspace::create(base.path()).unwrap();
        let second = Workspace::create(base.path()).unwrap();

        assert_ne!(first.root(), second.root());
        assert!(first.root().is_dir());
        let dir_name = first.root().file_name().unwrap().to_string_lossy();
        assert!(dir_name.starts_with(WORKSPACE_PREFIX));
    }

    #[test]
    fn test_create_in_missing_base_fails() {
        let base = tempdir().unwrap();
        let missing = base.path().join("does/not/exist");
        let err = Workspace::create(&missing).unwrap_err();
        assert!(matches!(err, PipeZipError::Provisioning { .. }));
    }

    #[test]
    fn test_resolve_simple_and_nested() {
        let (_base, ws) = workspace();

        let simple = ws.resolve("a.txt").unwrap();
        assert_eq!(simple.name, "a.txt");
        assert_eq!(simple.path, ws.root().join("a.txt"));

        let nested = ws.resolve("dir/sub/b.txt").unwrap();
        assert_eq!(nested.name, "dir/sub/b.txt");
        assert_eq!(nested.path, ws.root().join("dir").join("sub").join("b.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_reports_canonical_location() {
        let (_base, ws) = workspace();
        std::fs::create_dir(ws.root().join("real")).unwrap();
        std::os::unix::fs::symlink(ws.root().join("real"), ws.root().join("alias")).unwrap();

        let direct = ws.resolve("real/c.txt").unwrap();
        let aliased = ws.resolve("alias/c.txt").unwrap();
        assert_ne!(direct.path, aliased.path);
        assert_eq!(direct.canonical, aliased.canonical);
        assert_eq!(aliased.canonical, ws.root().join("real").join("c.txt"));
    }

    #[test]
    fn test_resolve_normalizes_inner_segments() {
        let (_base, ws) = workspace();

        let resolved = ws.resolve("./dir/../a.txt").unwrap();
        assert_eq!(resolved.name, "a.txt");
        assert_eq!(resolved.path, ws.root().join("a.txt"));

        let resolved = ws.resolve("dir//b.txt").unwrap();
        assert_eq!(resolved.name, "dir/b.txt");
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let (_base, ws) = workspace();

        for name in [
            "../escape.txt",
            "../../etc/passwd",
            "dir/../../escape.txt",
            "/etc/passwd",
            "a/..",
            ".",
        ] {
            let err = ws.resolve(name).unwrap_err();
            assert!(
                matches!(err, PipeZipError::PathEscape { .. }),
                "{name} should escape, got {err:?}"
            );
        }
    }

    #[test]
    fn test_resolve_rejects_bad_shapes() {
        let (_base, ws) = workspace();

        for name in ["", "dir/", "-r", "a\0b"] {
            let err = ws.resolve(name).unwrap_err();
            assert!(
                matches!(err, PipeZipError::ContractViolation(_)),
                "{name:?} should be rejected, got {err:?}"
            );
        }

        // A dash inside the path is harmless
        assert!(ws.resolve("dir/-r").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (base, ws) = workspace();
        let outside = base.path().join("outside");
        fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, ws.root().join("link")).unwrap();

        let err = ws.resolve("link/passwd").unwrap_err();
        assert!(matches!(err, PipeZipError::PathEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_dangling_symlink() {
        let (_base, ws) = workspace();
        std::os::unix::fs::symlink("/nonexistent/target", ws.root().join("dangling")).unwrap();

        let err = ws.resolve("dangling/x").unwrap_err();
        assert!(matches!(err, PipeZipError::PathEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_allows_symlink_inside() {
        let (_base, ws) = workspace();
        fs::create_dir(ws.root().join("real")).unwrap();
        std::os::unix::fs::symlink(ws.root().join("real"), ws.root().join("alias")).unwrap();

        let resolved = ws.resolve("alias/c.txt").unwrap();
        assert_eq!(resolved.name, "alias/c.txt");
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (_base, mut ws) = workspace();
        let root = ws.root().to_path_buf();
        fs::create_dir_all(root.join("nested/dir")).unwrap();
        fs::write(root.join("nested/dir/file"), b"x").unwrap();

        assert_eq!(ws.teardown().unwrap(), Teardown::Removed);
        assert!(!root.exists());
        assert!(ws.is_removed());

        assert_eq!(ws.teardown().unwrap(), Teardown::AlreadyRemoved);
    }

    #[test]
    fn test_resolve_after_teardown_is_rejected() {
        let (_base, mut ws) = workspace();
        ws.teardown().unwrap();

        let err = ws.resolve("a.txt").unwrap_err();
        assert!(matches!(err, PipeZipError::ContractViolation(_)));
    }

    #[test]
    fn test_drop_removes_directory() {
        let (_base, ws) = workspace();
        let root = ws.root().to_path_buf();
        drop(ws);
        assert!(!root.exists());
    }
}
