//! Executable code snapshots.
//!
//! A snapshot image is a file with four separately addressable regions: VM data, VM
//! instructions, isolate data and isolate instructions. [`crate::ExecutableImage`] opens such a
//! file with read and execute rights, hands the descriptor to an [`crate::snapshot::ImageLoader`]
//! and keeps the loader handle alive until it is dropped.
//!
//! # Layered Entry Points
//!
//! Each constructor does strictly less work than the one above it and delegates downwards:
//!
//! 1. [`crate::ExecutableImage::load`] - Resolves the namespace, then calls 2.
//! 2. [`crate::ExecutableImage::load_at`] - Opens the path with execute rights against an already
//!    resolved directory, closes that directory, then calls 3.
//! 3. [`crate::ExecutableImage::load_fd`] - Hands an open descriptor to the image loader.
//!
//! The `*_with` variants take an explicit loader; the plain ones use the default
//! [`crate::snapshot::ElfLoader`].
//!
//! # Descriptor Ownership
//!
//! The descriptor passed to [`crate::ExecutableImage::load_fd`] is moved into the loader. The
//! loader closes it whenever it sees fit, on success as well as on failure; the caller keeps no
//! copy.
//!
//! # Examples
//!
//! ```rust,no_run
//! use snapmap::{namespace::DirNamespace, ExecutableImage};
//!
//! let ns = DirNamespace::new("/pkg");
//! let image = ExecutableImage::load(Some(&ns), "data/app_aot.so")?;
//! let regions = image.regions().expect("loaded");
//! println!("vm data at {:p}", regions.vm_data);
//! # Ok::<(), snapmap::Error>(())
//! ```

mod elf;

pub use elf::{
    ElfImage, ElfLoader, ElfLoaderConfig, ISOLATE_SNAPSHOT_DATA_SYMBOL,
    ISOLATE_SNAPSHOT_INSTRUCTIONS_SYMBOL, VM_SNAPSHOT_DATA_SYMBOL,
    VM_SNAPSHOT_INSTRUCTIONS_SYMBOL,
};

use std::{
    fmt, fs, io,
    os::{fd::OwnedFd, unix::fs::MetadataExt},
    ptr::NonNull,
};

use log::{debug, error, trace};

use crate::{
    namespace::{resolve, DirAnchor, Namespace},
    vmo::on_noexec_mount,
    Error, Result,
};

/// Pointers to the four regions of a loaded snapshot.
///
/// The pointers are owned by the loader handle they came from and become dangling once that
/// handle is unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRegions {
    /// Data shared by all isolates
    pub vm_data: NonNull<u8>,
    /// Instructions shared by all isolates
    pub vm_instructions: NonNull<u8>,
    /// Data of a single isolate
    pub isolate_data: NonNull<u8>,
    /// Instructions of a single isolate
    pub isolate_instructions: NonNull<u8>,
}

// SAFETY: the pointers are plain addresses into a read-only image. They are only read, and the
// image they point into is owned by the loader handle, not by this struct.
unsafe impl Send for SnapshotRegions {}
unsafe impl Sync for SnapshotRegions {}

impl SnapshotRegions {
    /// The four pointers in the order vm data, vm instructions, isolate data, isolate instructions.
    #[must_use]
    pub fn as_array(&self) -> [NonNull<u8>; 4] {
        [
            self.vm_data,
            self.vm_instructions,
            self.isolate_data,
            self.isolate_instructions,
        ]
    }
}

/// The result of a successful [`ImageLoader::load`].
pub struct LoadedImage<H> {
    /// Opaque handle that keeps the regions alive
    pub handle: H,
    /// The regions resolved from the image
    pub regions: SnapshotRegions,
}

/// Parses and loads executable images from open descriptors.
pub trait ImageLoader {
    /// Opaque handle to a loaded image.
    type Handle;

    /// Loads the image behind `fd`. The descriptor is consumed.
    ///
    /// Either all four regions are resolved and returned, or nothing is retained.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ImageParse`] or [`crate::Error::GoblinErr`] if the image is
    /// malformed.
    fn load(&self, fd: OwnedFd) -> Result<LoadedImage<Self::Handle>>;

    /// Releases a handle returned by [`ImageLoader::load`].
    fn unload(&self, handle: Self::Handle);
}

/// An executable snapshot image loaded into memory.
///
/// Owns the loader handle exclusively; dropping the image unloads it exactly once. A
/// default-constructed image holds nothing and unloads nothing.
pub struct ExecutableImage<L: ImageLoader = ElfLoader> {
    loader: L,
    loaded: Option<(L::Handle, SnapshotRegions)>,
}

impl ExecutableImage<ElfLoader> {
    /// Loads the image at `path` through `namespace` with the default ELF loader.
    ///
    /// # Errors
    ///
    /// See [`ExecutableImage::load_with`].
    pub fn load(namespace: Option<&dyn Namespace>, path: &str) -> Result<Self> {
        Self::load_with(ElfLoader::default(), namespace, path)
    }

    /// Loads the image at `path` relative to `dir` with the default ELF loader.
    ///
    /// # Errors
    ///
    /// See [`ExecutableImage::load_at_with`].
    pub fn load_at(dir: DirAnchor, path: &str) -> Result<Self> {
        Self::load_at_with(ElfLoader::default(), dir, path)
    }

    /// Loads the image behind `fd` with the default ELF loader.
    ///
    /// # Errors
    ///
    /// See [`ExecutableImage::load_fd_with`].
    pub fn load_fd(fd: OwnedFd) -> Result<Self> {
        Self::load_fd_with(ElfLoader::default(), fd)
    }
}

impl<L: ImageLoader> ExecutableImage<L> {
    /// Resolves `path` through `namespace` and loads it with `loader`.
    ///
    /// Without a namespace the path is opened relative to the current working directory.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::RootAnchoredPath`] if `path` starts with `/`
    /// - [`crate::Error::Namespace`] if the namespace root cannot be opened
    /// - Everything [`ExecutableImage::load_at_with`] returns
    pub fn load_with(loader: L, namespace: Option<&dyn Namespace>, path: &str) -> Result<Self> {
        trace!("loading snapshot {path}");

        let dir = resolve(namespace, path)?;
        Self::load_at_with(loader, dir, path)
    }

    /// Opens `path` relative to `dir` with read and execute rights and loads it with `loader`.
    ///
    /// `dir` is closed right after the open attempt, whatever its outcome.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::Acquisition`] if the file cannot be opened for execution
    /// - Everything [`ExecutableImage::load_fd_with`] returns
    pub fn load_at_with(loader: L, dir: DirAnchor, path: &str) -> Result<Self> {
        let fd = open_exec_at(&dir, path);
        drop(dir);

        let fd = fd.inspect_err(|_| error!("Failed to open {path} for execution"))?;
        Self::load_fd_with(loader, fd)
    }

    /// Hands `fd` to `loader` and keeps the resulting handle.
    ///
    /// # Errors
    ///
    /// Returns the loader's error if the image is rejected. The image is not retained.
    pub fn load_fd_with(loader: L, fd: OwnedFd) -> Result<Self> {
        match loader.load(fd) {
            Ok(LoadedImage { handle, regions }) => {
                debug!(
                    "loaded snapshot: vm data {:p}, vm instructions {:p}, isolate data {:p}, isolate instructions {:p}",
                    regions.vm_data,
                    regions.vm_instructions,
                    regions.isolate_data,
                    regions.isolate_instructions
                );
                Ok(ExecutableImage {
                    loader,
                    loaded: Some((handle, regions)),
                })
            }
            Err(e) => {
                error!("Failed to load snapshot image: {e}");
                Err(e)
            }
        }
    }

    /// Creates an image that holds nothing, tied to `loader`.
    pub fn empty(loader: L) -> Self {
        ExecutableImage {
            loader,
            loaded: None,
        }
    }

    /// Returns `true` if an image is held.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// The resolved regions, if an image is held.
    #[must_use]
    pub fn regions(&self) -> Option<&SnapshotRegions> {
        self.loaded.as_ref().map(|(_, regions)| regions)
    }

    /// The loader handle, if an image is held.
    #[must_use]
    pub fn handle(&self) -> Option<&L::Handle> {
        self.loaded.as_ref().map(|(handle, _)| handle)
    }

    /// VM snapshot data, or null if nothing is loaded.
    #[must_use]
    pub fn vm_data(&self) -> *const u8 {
        self.region(|regions| regions.vm_data)
    }

    /// VM snapshot instructions, or null if nothing is loaded.
    #[must_use]
    pub fn vm_instructions(&self) -> *const u8 {
        self.region(|regions| regions.vm_instructions)
    }

    /// Isolate snapshot data, or null if nothing is loaded.
    #[must_use]
    pub fn isolate_data(&self) -> *const u8 {
        self.region(|regions| regions.isolate_data)
    }

    /// Isolate snapshot instructions, or null if nothing is loaded.
    #[must_use]
    pub fn isolate_instructions(&self) -> *const u8 {
        self.region(|regions| regions.isolate_instructions)
    }

    fn region(&self, select: impl Fn(&SnapshotRegions) -> NonNull<u8>) -> *const u8 {
        self.regions()
            .map_or(std::ptr::null(), |regions| select(regions).as_ptr().cast_const())
    }
}

impl<L: ImageLoader + Default> Default for ExecutableImage<L> {
    fn default() -> Self {
        Self::empty(L::default())
    }
}

impl<L: ImageLoader> Drop for ExecutableImage<L> {
    fn drop(&mut self) {
        if let Some((handle, _)) = self.loaded.take() {
            debug!("unloading snapshot");
            self.loader.unload(handle);
        }
    }
}

impl<L: ImageLoader> fmt::Debug for ExecutableImage<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableImage")
            .field("regions", &self.regions())
            .finish_non_exhaustive()
    }
}

/// Opens `path` relative to `dir` for reading, requiring that the caller may execute it.
///
/// The execute check runs against the opened descriptor, so the file that is checked is the file
/// that gets loaded.
///
/// # Errors
///
/// - [`crate::Error::RootAnchoredPath`] if `path` starts with `/`, since it would ignore `dir`
/// - [`crate::Error::Acquisition`] if the open fails or execute permission is missing
pub fn open_exec_at(dir: &DirAnchor, path: &str) -> Result<OwnedFd> {
    if path.starts_with('/') {
        error!("Refusing root-anchored path {path}: it would escape the directory");
        return Err(Error::RootAnchoredPath(path.to_string()));
    }

    let opened = dir.open(path, libc::O_RDONLY).and_then(|file| {
        check_executable(&file)?;
        Ok(file)
    });

    match opened {
        Ok(file) => Ok(OwnedFd::from(file)),
        Err(source) => {
            error!("openat({path}) for execution failed: {source}");
            Err(Error::Acquisition {
                path: path.to_string(),
                source,
            })
        }
    }
}

/// Checks that the effective user may read and execute `file`, and that its filesystem allows
/// executable mappings.
pub(crate) fn check_executable(file: &fs::File) -> io::Result<()> {
    let metadata = file.metadata()?;
    let mode = metadata.mode();

    let euid = unsafe { libc::geteuid() };
    let permitted = if euid == 0 {
        mode & 0o111 != 0
    } else if metadata.uid() == euid {
        mode & 0o500 == 0o500
    } else if in_group(metadata.gid())? {
        mode & 0o050 == 0o050
    } else {
        mode & 0o005 == 0o005
    };

    if !metadata.is_file() || !permitted {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("not executable (mode {:o})", mode & 0o7777),
        ));
    }
    if on_noexec_mount(file)? {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "file is on a noexec mount",
        ));
    }

    Ok(())
}

fn in_group(gid: libc::gid_t) -> io::Result<bool> {
    if unsafe { libc::getegid() } == gid {
        return Ok(true);
    }

    let count = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    if count < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut groups = vec![0 as libc::gid_t; count as usize];
    let count = unsafe { libc::getgroups(count, groups.as_mut_ptr()) };
    if count < 0 {
        return Err(io::Error::last_os_error());
    }
    groups.truncate(count as usize);

    Ok(groups.contains(&gid))
}
