//! Host executable lookup.
//!
//! Resolution walks an explicit search path rather than reading `PATH` at
//! every call site, so callers (and tests) can supply a simulated one.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// An ordered list of directories searched for executables.
#[derive(Debug, Clone, Default)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// The host `PATH` of the current process.
    pub fn from_env() -> Self {
        env::var_os("PATH")
            .map(|path| Self::from_os(&path))
            .unwrap_or_default()
    }

    /// Parse a `PATH`-style value using the platform separator.
    pub fn from_os(path: &OsStr) -> Self {
        Self {
            dirs: env::split_paths(path)
                .filter(|dir| !dir.as_os_str().is_empty())
                .collect(),
        }
    }

    pub fn from_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    /// First executable named `name` on the search path, as an absolute path.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }

        // Names with a separator are paths already and bypass the search.
        if Path::new(name).components().count() > 1 {
            let candidate = PathBuf::from(name);
            return is_executable(&candidate).then(|| absolutize(candidate));
        }

        for dir in &self.dirs {
            for candidate in candidates(dir, name) {
                if is_executable(&candidate) {
                    return Some(absolutize(candidate));
                }
            }
        }
        None
    }

    /// Succeeds when every name resolves. Otherwise reports all missing names,
    /// in input order, in a single `dependency.missing` error.
    pub fn check_available<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let mut missing = Vec::new();
        for name in names {
            let name = name.as_ref();
            match self.resolve(name) {
                Some(path) => info!(tool = name, path = %path.display(), "Found host dependency"),
                None => {
                    error!(tool = name, "Host dependency not found on PATH");
                    if !missing.iter().any(|m: &String| m == name) {
                        missing.push(name.to_string());
                    }
                }
            }
        }

        if missing.is_empty() {
            debug!(count = names.len(), "All host dependencies found");
            Ok(())
        } else {
            Err(Error::missing_dependencies(missing))
        }
    }
}

fn absolutize(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

#[cfg(windows)]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    if Path::new(name).extension().is_some() {
        return vec![dir.join(name)];
    }
    let pathext = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    let mut out = vec![dir.join(name)];
    out.extend(
        pathext
            .split(';')
            .filter(|ext| !ext.is_empty())
            .map(|ext| dir.join(format!("{}{}", name, ext.to_ascii_lowercase()))),
    );
    out
}

#[cfg(not(windows))]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name)]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
