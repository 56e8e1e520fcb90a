//! Namespace resolution.
//!
//! Lookups of resources never go through the host filesystem directly. Instead a caller hands in
//! a [`crate::namespace::Namespace`] (or nothing, meaning "the current process context") together
//! with a relative path, and [`crate::namespace::resolve`] turns that into a
//! [`crate::namespace::DirAnchor`] that the acquisition step opens the path against.
//!
//! # Key Components
//!
//! - [`crate::namespace::Namespace`] - Trait for anything that can open a directory root
//! - [`crate::namespace::DirNamespace`] - A namespace rooted at a single host directory
//! - [`crate::namespace::DirAnchor`] - Either the current working directory or an open directory
//! - [`crate::namespace::resolve`] - Validates the path and produces the anchor
//!
//! # Descriptor Lifetime
//!
//! A [`crate::namespace::DirAnchor::Dir`] owns its descriptor. It is meant to live only for the
//! duration of a single acquisition and is closed when dropped, which covers early returns on
//! error paths as well.
//!
//! # Examples
//!
//! ```rust,no_run
//! use snapmap::namespace::{resolve, DirNamespace};
//!
//! let ns = DirNamespace::new("/pkg");
//! let anchor = resolve(Some(&ns), "data/vm_snapshot.bin")?;
//! let file = anchor.open("data/vm_snapshot.bin", libc::O_RDONLY)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{
    ffi::CString,
    fmt, fs, io,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
};

use log::{error, trace};

use crate::{Error, Result};

/// A directory namespace that lookups are scoped to.
///
/// The core only ever borrows a namespace. It asks for a fresh descriptor of the namespace root
/// on every resolution and closes that descriptor once the lookup is done.
pub trait Namespace: Send + Sync {
    /// Opens a new descriptor for the root directory of this namespace.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the root cannot be opened.
    fn open_root(&self) -> io::Result<OwnedFd>;
}

/// A namespace whose root is a directory on the host filesystem.
#[derive(Debug, Clone)]
pub struct DirNamespace {
    root: PathBuf,
}

impl DirNamespace {
    /// Creates a namespace rooted at `root`. The directory is not opened until a lookup happens.
    pub fn new(root: impl AsRef<Path>) -> DirNamespace {
        DirNamespace {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The host directory backing this namespace.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Namespace for DirNamespace {
    fn open_root(&self) -> io::Result<OwnedFd> {
        let dir = fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(&self.root)?;

        Ok(OwnedFd::from(dir))
    }
}

/// The directory a relative path is opened against.
pub enum DirAnchor {
    /// The current working directory of the process (`AT_FDCWD`).
    Cwd,
    /// An open directory descriptor, closed when the anchor is dropped.
    Dir(OwnedFd),
}

impl DirAnchor {
    /// Returns the raw descriptor to pass to `*at` calls.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        match self {
            DirAnchor::Cwd => libc::AT_FDCWD,
            DirAnchor::Dir(fd) => fd.as_raw_fd(),
        }
    }

    /// Returns `true` if this anchor stands for the current process context.
    #[must_use]
    pub fn is_cwd(&self) -> bool {
        matches!(self, DirAnchor::Cwd)
    }

    /// Opens `path` relative to this anchor with the given `open(2)` flags.
    ///
    /// `O_CLOEXEC` is always added.
    ///
    /// # Errors
    ///
    /// Returns the `openat` error, or [`io::ErrorKind::InvalidInput`] if `path` contains an
    /// interior NUL byte.
    pub fn open(&self, path: &str, flags: libc::c_int) -> io::Result<fs::File> {
        let c_path = c_path(path)?;

        let fd = unsafe { libc::openat(self.raw_fd(), c_path.as_ptr(), flags | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(fs::File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
    }
}

impl fmt::Debug for DirAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirAnchor::Cwd => write!(f, "DirAnchor::Cwd"),
            DirAnchor::Dir(fd) => write!(f, "DirAnchor::Dir({})", fd.as_raw_fd()),
        }
    }
}

fn c_path(path: &str) -> io::Result<CString> {
    CString::new(path).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

/// Resolves the directory a relative `path` is looked up in.
///
/// With no namespace the lookup happens relative to the current process context. With a
/// namespace, its root directory is opened and returned; the caller drops the anchor as soon as
/// the lookup is done.
///
/// # Errors
///
/// - [`crate::Error::RootAnchoredPath`] if `path` starts with `/`. No namespace access happens.
/// - [`crate::Error::Namespace`] if the namespace root cannot be opened.
pub fn resolve(namespace: Option<&dyn Namespace>, path: &str) -> Result<DirAnchor> {
    trace!("resolve: path={path} namespace={}", namespace.is_some());

    if path.starts_with('/') {
        error!("Refusing root-anchored path {path}: it would escape the namespace");
        return Err(Error::RootAnchoredPath(path.to_string()));
    }

    let Some(namespace) = namespace else {
        return Ok(DirAnchor::Cwd);
    };

    match namespace.open_root() {
        Ok(fd) => Ok(DirAnchor::Dir(fd)),
        Err(error) => {
            error!("Failed to open namespace directory: {error}");
            Err(Error::Namespace(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingNamespace {
        inner: DirNamespace,
        opened: AtomicUsize,
    }

    impl Namespace for CountingNamespace {
        fn open_root(&self) -> io::Result<OwnedFd> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.inner.open_root()
        }
    }

    struct BrokenNamespace;

    impl Namespace for BrokenNamespace {
        fn open_root(&self) -> io::Result<OwnedFd> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    #[test]
    fn root_anchored_rejected_before_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let ns = CountingNamespace {
            inner: DirNamespace::new(dir.path()),
            opened: AtomicUsize::new(0),
        };

        for path in ["/etc/passwd", "/", "//data"] {
            let result = resolve(Some(&ns), path);
            assert!(matches!(result, Err(Error::RootAnchoredPath(ref p)) if p == path));
        }
        assert_eq!(ns.opened.load(Ordering::SeqCst), 0);

        assert!(matches!(
            resolve(None, "/etc/passwd"),
            Err(Error::RootAnchoredPath(_))
        ));
    }

    #[test]
    fn no_namespace_is_cwd() {
        let anchor = resolve(None, "data/vm_snapshot.bin").unwrap();
        assert!(anchor.is_cwd());
        assert_eq!(anchor.raw_fd(), libc::AT_FDCWD);
    }

    #[test]
    fn namespace_opens_root_once() {
        let dir = tempfile::tempdir().unwrap();
        let ns = CountingNamespace {
            inner: DirNamespace::new(dir.path()),
            opened: AtomicUsize::new(0),
        };

        let anchor = resolve(Some(&ns), "data/vm_snapshot.bin").unwrap();
        assert!(!anchor.is_cwd());
        assert!(anchor.raw_fd() >= 0);
        assert_eq!(ns.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broken_namespace_reports_namespace_error() {
        let result = resolve(Some(&BrokenNamespace), "data/vm_snapshot.bin");
        match result {
            Err(Error::Namespace(error)) => {
                assert_eq!(error.kind(), io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Namespace error"),
        }
    }

    #[test]
    fn missing_namespace_root() {
        let dir = tempfile::tempdir().unwrap();
        let ns = DirNamespace::new(dir.path().join("does-not-exist"));
        assert!(matches!(
            resolve(Some(&ns), "file.bin"),
            Err(Error::Namespace(_))
        ));
    }

    #[test]
    fn namespace_root_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.bin");
        fs::write(&file, b"abc").unwrap();

        let ns = DirNamespace::new(&file);
        assert!(matches!(
            resolve(Some(&ns), "plain.bin"),
            Err(Error::Namespace(_))
        ));
    }

    #[test]
    fn open_relative_to_anchor() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("data/blob.bin"), b"0123456789").unwrap();

        let ns = DirNamespace::new(dir.path());
        let anchor = resolve(Some(&ns), "data/blob.bin").unwrap();
        let file = anchor.open("data/blob.bin", libc::O_RDONLY).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 10);

        let missing = anchor.open("data/nope.bin", libc::O_RDONLY);
        assert_eq!(missing.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn interior_nul_is_invalid_input() {
        let anchor = DirAnchor::Cwd;
        let result = anchor.open("bad\0path", libc::O_RDONLY);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }
}
