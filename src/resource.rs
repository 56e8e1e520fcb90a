//! Memory mapped resources.
//!
//! [`crate::MappedResource`] is the owner of one read-only (optionally executable) mapping of a
//! resource. It is created by one of two constructors and unmaps itself when dropped:
//!
//! - [`crate::MappedResource::load_from_namespace`] - Resolves the path through a namespace,
//!   acquires the buffer, escalates it to executable if asked to, then maps it
//! - [`crate::MappedResource::load_from_buffer`] - Maps a buffer the caller already acquired
//!
//! Both constructors return a fresh instance. An instance cannot be loaded twice, so a live
//! mapping can never be overwritten and leaked.
//!
//! # Empty Resources
//!
//! A zero-length buffer loads successfully into an unmapped instance: [`crate::MappedResource::address`]
//! is null and [`crate::MappedResource::size`] is zero. Zero-length resources stand for absent
//! optional resources.
//!
//! # Examples
//!
//! ```rust,no_run
//! use snapmap::{namespace::DirNamespace, MappedResource};
//!
//! let ns = DirNamespace::new("/pkg");
//! let snapshot = MappedResource::load_from_namespace(Some(&ns), "data/vm_snapshot.bin", false)?;
//! println!("{} bytes at {:p}", snapshot.size(), snapshot.address());
//!
//! let instructions =
//!     MappedResource::load_from_namespace(Some(&ns), "data/vm_snapshot_instructions.bin", true)?;
//! assert!(instructions.is_executable() || !instructions.is_mapped());
//! # Ok::<(), snapmap::Error>(())
//! ```

use std::fmt;

use log::{debug, error, trace};

use crate::{
    namespace::{resolve, Namespace},
    vmo::{self, Protection, Region, ResourceBuffer},
    Error, Result,
};

/// A resource mapped into the address space of the process.
///
/// Owns its mapping exclusively. Not `Clone`; moving the value moves the ownership of the
/// mapping, and dropping it unmaps exactly once.
#[derive(Default)]
pub struct MappedResource {
    region: Option<Box<dyn Region>>,
}

impl MappedResource {
    /// Loads the resource at `path` through `namespace` and maps it.
    ///
    /// Without a namespace, `path` is looked up relative to the current working directory. When
    /// `executable` is set, the buffer is granted execute rights before mapping and the mapping is
    /// made executable.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::RootAnchoredPath`] if `path` starts with `/`
    /// - [`crate::Error::Namespace`] if the namespace root cannot be opened
    /// - [`crate::Error::Acquisition`] if the resource cannot be opened
    /// - [`crate::Error::PermissionEscalation`] if execute rights cannot be granted
    /// - [`crate::Error::Mapping`] if the map call fails
    pub fn load_from_namespace(
        namespace: Option<&dyn Namespace>,
        path: &str,
        executable: bool,
    ) -> Result<MappedResource> {
        trace!("LoadFromNamespace: path={path} executable={executable}");

        let buffer = acquire(namespace, path)?;
        Self::load_acquired(path, buffer, executable)
    }

    /// Maps a buffer the caller obtained through another channel.
    ///
    /// No escalation happens here: when `executable` is set, the buffer must already carry
    /// [`crate::vmo::Rights::EXECUTE`], otherwise mapping fails.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Mapping`] if the buffer cannot be mapped with the requested
    /// protection.
    pub fn load_from_buffer(
        path: &str,
        buffer: ResourceBuffer,
        executable: bool,
    ) -> Result<MappedResource> {
        let size = buffer.size();
        if size == 0 {
            debug!("{path} is empty, leaving it unmapped");
            return Ok(MappedResource::default());
        }

        let len = usize::try_from(size).map_err(|_| Error::Mapping {
            path: path.to_string(),
            message: format!("size {size} exceeds the address space"),
        })?;

        let protection = Protection::for_resource(executable);
        match buffer.vmo().map(0, len, protection) {
            Ok(region) => {
                debug!(
                    "mapped {path}: {} bytes at {:p} ({protection:?})",
                    region.len(),
                    region.as_ptr()
                );
                Ok(MappedResource {
                    region: Some(region),
                })
            }
            Err(status) => {
                error!("Failed to map {path}: {status}");
                Err(Error::Mapping {
                    path: path.to_string(),
                    message: status.to_string(),
                })
            }
        }
    }

    pub(crate) fn load_acquired(
        path: &str,
        buffer: ResourceBuffer,
        executable: bool,
    ) -> Result<MappedResource> {
        let buffer = if executable {
            make_executable(path, buffer)?
        } else {
            buffer
        };

        Self::load_from_buffer(path, buffer, executable)
    }

    /// Start of the mapping, or null if nothing is mapped.
    #[must_use]
    pub fn address(&self) -> *const u8 {
        self.region
            .as_ref()
            .map_or(std::ptr::null(), |region| region.as_ptr())
    }

    /// Size of the mapping in bytes, zero if nothing is mapped.
    #[must_use]
    pub fn size(&self) -> usize {
        self.region.as_ref().map_or(0, |region| region.len())
    }

    /// Returns `true` if a mapping is held.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.region.is_some()
    }

    /// Returns `true` if the held mapping is executable.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.region
            .as_ref()
            .is_some_and(|region| region.protection().contains(Protection::EXECUTE))
    }

    /// The mapped bytes. Empty if nothing is mapped.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.region {
            Some(region) => unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) },
            None => &[],
        }
    }

    /// Returns a slice of the mapping at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range is not inside the mapping.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(Error::OutOfBounds);
        };

        let data = self.as_slice();
        if offset_end > data.len() {
            return Err(Error::OutOfBounds);
        }

        Ok(&data[offset..offset_end])
    }
}

impl Drop for MappedResource {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            debug!("unmapping {} bytes at {:p}", region.len(), region.as_ptr());
        }
    }
}

impl fmt::Debug for MappedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedResource")
            .field("address", &self.address())
            .field("size", &self.size())
            .field("executable", &self.is_executable())
            .finish()
    }
}

/// Resolves `path` and acquires its buffer. The resolved directory is closed before returning.
fn acquire(namespace: Option<&dyn Namespace>, path: &str) -> Result<ResourceBuffer> {
    let anchor = resolve(namespace, path)?;
    vmo::from_filename_at(&anchor, path)
}

/// Replaces the handle of `buffer` with one that carries execute rights.
pub(crate) fn make_executable(path: &str, buffer: ResourceBuffer) -> Result<ResourceBuffer> {
    let (size, vmo) = buffer.into_parts();

    match vmo.replace_as_executable() {
        Ok(vmo) => Ok(ResourceBuffer::new(size, vmo)),
        Err(status) => {
            error!("Failed to make VMO executable: {status}");
            Err(Error::PermissionEscalation {
                path: path.to_string(),
                message: status.to_string(),
            })
        }
    }
}
