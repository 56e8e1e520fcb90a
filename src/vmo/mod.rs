//! Memory objects, rights and resource buffers.
//!
//! A resource is loaded in two steps: first a [`crate::vmo::ResourceBuffer`] is acquired (a size
//! plus a handle to mappable storage), then the handle is mapped into the process. This module
//! owns the first step and the handle abstraction the second step maps through.
//!
//! # Architecture
//!
//! - [`crate::vmo::MemoryObject`] - Trait for a handle to mappable storage. Carries
//!   [`crate::vmo::Rights`] and can be mapped with a [`crate::vmo::Protection`]
//! - [`crate::vmo::Region`] - Trait for a live mapping. Dropping it unmaps it
//! - [`crate::vmo::ResourceBuffer`] - `{size, handle}` pair produced by acquisition
//!
//! ## Backend Implementations
//! - [`crate::vmo::FileObject`] - A read-only file, mapped with `memmap2`
//! - [`crate::vmo::MemoryBuffer`] - Bytes already held in memory, copied into an anonymous mapping
//!
//! # Rights
//!
//! Freshly acquired handles carry [`crate::vmo::Rights::READ`] and [`crate::vmo::Rights::MAP`]
//! only. Mapping with [`crate::vmo::Protection::EXECUTE`] requires
//! [`crate::vmo::Rights::EXECUTE`], which is only obtained through
//! [`crate::vmo::MemoryObject::replace_as_executable`]. There is no write protection flag:
//! resources are never mapped writable.
//!
//! # Examples
//!
//! ```rust,no_run
//! use snapmap::vmo::{self, Protection, Rights};
//!
//! let buffer = vmo::from_filename("data/vm_snapshot.bin")?;
//! assert!(buffer.vmo().rights().contains(Rights::READ));
//! let region = buffer.vmo().map(0, buffer.size() as usize, Protection::READ)?;
//! println!("mapped at {:p}", region.as_ptr());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod file;
mod memory;

pub use file::FileObject;
pub(crate) use file::on_noexec_mount;
pub use memory::MemoryBuffer;

use std::{fmt, fs, io};

use bitflags::bitflags;
use log::error;
use memmap2::Mmap;

use crate::{namespace::DirAnchor, Error, Result};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Rights carried by a memory object handle
    pub struct Rights : u32 {
        /// The contents may be read
        const READ = 0x0001;
        /// The object may be mapped into an address space
        const MAP = 0x0002;
        /// The object may be mapped with execute protection
        const EXECUTE = 0x0004;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Protection of a mapping. There is deliberately no write flag
    pub struct Protection : u32 {
        /// Pages are readable
        const READ = 0x0001;
        /// Pages are executable
        const EXECUTE = 0x0004;
    }
}

impl Protection {
    /// The protection a resource is mapped with: read, plus execute if requested.
    #[must_use]
    pub fn for_resource(executable: bool) -> Protection {
        if executable {
            Protection::READ | Protection::EXECUTE
        } else {
            Protection::READ
        }
    }
}

/// A live mapping of a memory object.
///
/// The mapping stays valid for as long as the region is alive; dropping the region unmaps it.
pub trait Region: Send + Sync + fmt::Debug {
    /// Start address of the mapping.
    fn as_ptr(&self) -> *const u8;

    /// Length of the mapping in bytes.
    fn len(&self) -> usize;

    /// Returns `true` if the mapping has a length of zero.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Protection the mapping was created with.
    fn protection(&self) -> Protection;
}

/// Handle to storage that can be mapped into the address space.
///
/// All implementations must be thread-safe.
pub trait MemoryObject: Send + Sync + fmt::Debug {
    /// Rights currently carried by this handle.
    fn rights(&self) -> Rights;

    /// Consumes this handle and returns one that additionally carries [`Rights::EXECUTE`].
    ///
    /// # Errors
    ///
    /// Returns an error if execute rights cannot be granted. The original handle is gone either
    /// way.
    fn replace_as_executable(self: Box<Self>) -> io::Result<Box<dyn MemoryObject>>;

    /// Maps `len` bytes starting at `offset` with the given protection.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::PermissionDenied`] if the handle lacks the rights the protection
    /// needs, [`io::ErrorKind::InvalidInput`] for a range outside the object, or the error of the
    /// underlying map call.
    fn map(&self, offset: u64, len: usize, protection: Protection) -> io::Result<Box<dyn Region>>;
}

/// Checks that `rights` allow a mapping with `protection`.
pub(crate) fn check_map_rights(rights: Rights, protection: Protection) -> io::Result<()> {
    if !rights.contains(Rights::MAP | Rights::READ) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "handle is not mappable",
        ));
    }

    if protection.contains(Protection::EXECUTE) && !rights.contains(Rights::EXECUTE) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "handle lacks the execute right",
        ));
    }

    Ok(())
}

/// A [`Region`] backed by a `memmap2` mapping.
#[derive(Debug)]
pub struct MmapRegion {
    mmap: Mmap,
    protection: Protection,
}

impl MmapRegion {
    pub(crate) fn new(mmap: Mmap, protection: Protection) -> MmapRegion {
        MmapRegion { mmap, protection }
    }
}

impl Region for MmapRegion {
    fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    fn len(&self) -> usize {
        self.mmap.len()
    }

    fn protection(&self) -> Protection {
        self.protection
    }
}

/// A sized handle to mappable storage, as produced by acquisition.
///
/// A size of zero is valid and stands for an absent optional resource.
#[derive(Debug)]
pub struct ResourceBuffer {
    size: u64,
    vmo: Box<dyn MemoryObject>,
}

impl ResourceBuffer {
    /// Pairs a memory object with the number of bytes of it that make up the resource.
    pub fn new(size: u64, vmo: Box<dyn MemoryObject>) -> ResourceBuffer {
        ResourceBuffer { size, vmo }
    }

    /// Wraps bytes the caller already holds.
    pub fn from_bytes(data: Vec<u8>) -> ResourceBuffer {
        let size = data.len() as u64;
        ResourceBuffer::new(size, Box::new(MemoryBuffer::new(data)))
    }

    /// Size of the resource in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The backing handle.
    #[must_use]
    pub fn vmo(&self) -> &dyn MemoryObject {
        self.vmo.as_ref()
    }

    /// Splits the buffer into size and handle.
    #[must_use]
    pub fn into_parts(self) -> (u64, Box<dyn MemoryObject>) {
        (self.size, self.vmo)
    }
}

/// Acquires the buffer for `path` relative to the current working directory.
///
/// # Errors
///
/// Returns [`crate::Error::Acquisition`] if the file cannot be opened or sized.
pub fn from_filename(path: &str) -> Result<ResourceBuffer> {
    from_filename_at(&DirAnchor::Cwd, path)
}

/// Acquires the buffer for `path` relative to `anchor`.
///
/// The file is opened read-only; the resulting handle never carries execute rights.
///
/// # Errors
///
/// Returns [`crate::Error::Acquisition`] if the file cannot be opened or sized.
pub fn from_filename_at(anchor: &DirAnchor, path: &str) -> Result<ResourceBuffer> {
    let file = match anchor.open(path, libc::O_RDONLY) {
        Ok(file) => file,
        Err(source) => {
            error!("open({path}) failed: {source}");
            return Err(Error::Acquisition {
                path: path.to_string(),
                source,
            });
        }
    };

    from_file(file).map_err(|source| {
        error!("Failed to size {path}: {source}");
        Error::Acquisition {
            path: path.to_string(),
            source,
        }
    })
}

/// Wraps an already opened file as a resource buffer.
///
/// # Errors
///
/// Returns the `fstat` error, or [`io::ErrorKind::InvalidInput`] if the file is not a regular
/// file.
pub fn from_file(file: fs::File) -> io::Result<ResourceBuffer> {
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }

    let size = metadata.len();
    Ok(ResourceBuffer::new(size, Box::new(FileObject::new(file, size))))
}
