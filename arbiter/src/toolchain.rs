//! Discovery of compiler, runner and checker executables.
//!
//! Each toolchain directory is scanned once per config load; the resulting
//! registries map a codename (the file name without extension) to the
//! executable's absolute path and stay read-only for the life of the
//! worker iteration.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::Dirs;

/// Codename to absolute executable path.
pub type Registry = BTreeMap<String, PathBuf>;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("cannot have both '{first}' and '{second}' in '{}'", dir.display())]
    Duplicate {
        first: String,
        second: String,
        dir: PathBuf,
    },
    #[error("no executables found in '{}'", .0.display())]
    Empty(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The three registries a worker needs to judge an attempt.
#[derive(Debug)]
pub struct Toolchains {
    pub compilers: Registry,
    pub runners: Registry,
    pub checkers: Registry,
}

impl Toolchains {
    pub fn scan(dirs: &Dirs) -> Result<Toolchains, ToolchainError> {
        Ok(Toolchains {
            compilers: scan_dir(&dirs.compilers)?,
            runners: scan_dir(&dirs.runners)?,
            checkers: scan_dir(&dirs.checkers)?,
        })
    }
}

/// Collects the executables of one directory, keyed by file stem.
///
/// A file counts as executable when any of its execute bits is set. Two
/// files sharing a stem would make the codename ambiguous and fail the
/// scan; so does a directory with no executables at all.
pub fn scan_dir(dir: &Path) -> Result<Registry, ToolchainError> {
    let mut registry = Registry::new();
    for entry in fs_err::read_dir(dir)? {
        let path = entry?.path();
        let metadata = fs_err::metadata(&path)?;
        if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        match registry.entry(stem.to_owned()) {
            Entry::Vacant(vacant) => {
                vacant.insert(fs_err::canonicalize(&path)?);
            }
            Entry::Occupied(occupied) => {
                return Err(ToolchainError::Duplicate {
                    first: file_name(occupied.get()),
                    second: file_name(&path),
                    dir: dir.to_owned(),
                });
            }
        }
    }

    if registry.is_empty() {
        return Err(ToolchainError::Empty(dir.to_owned()));
    }
    Ok(registry)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs::Permissions;

    use super::*;

    fn executable(dir: &Path, name: &str) {
        let path = dir.join(name);
        fs_err::write(&path, "#!/bin/sh\n").unwrap();
        fs_err::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn keys_are_stems_and_paths_are_absolute() {
        let dir = tempfile::tempdir().unwrap();
        executable(dir.path(), "gcc-12.sh");
        executable(dir.path(), "fpc");

        let registry = scan_dir(dir.path()).unwrap();
        assert_eq!(
            registry.keys().map(String::as_str).collect::<Vec<_>>(),
            ["fpc", "gcc-12"]
        );
        for path in registry.values() {
            assert!(path.is_absolute());
        }
    }

    #[test]
    fn non_executables_and_subdirectories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        executable(dir.path(), "run");
        fs_err::write(dir.path().join("readme.txt"), "not a toolchain").unwrap();
        fs_err::create_dir(dir.path().join("attic")).unwrap();

        let registry = scan_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key("run"));
    }

    #[test]
    fn duplicate_stems_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        executable(dir.path(), "check.sh");
        executable(dir.path(), "check.py");

        match scan_dir(dir.path()) {
            Err(ToolchainError::Duplicate { first, second, .. }) => {
                let mut names = [first, second];
                names.sort();
                assert_eq!(names, ["check.py".to_owned(), "check.sh".to_owned()]);
            }
            other => panic!("expected a duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(dir.path().join("notes"), "").unwrap();
        assert!(matches!(
            scan_dir(dir.path()),
            Err(ToolchainError::Empty(_))
        ));
    }
}
