//! File backed memory objects.
//!
//! [`crate::vmo::FileObject`] wraps a read-only file and maps it with `memmap2`. Mappings are
//! shared and never writable. Execute rights can only be granted when the file does not live on
//! a `noexec` mount, since the kernel would refuse an executable mapping of such a file anyway.
//!
//! # Examples
//!
//! ```rust,no_run
//! use snapmap::vmo::{FileObject, MemoryObject, Protection};
//! use std::fs;
//!
//! let file = fs::File::open("data/vm_snapshot.bin")?;
//! let size = file.metadata()?.len();
//! let object = FileObject::new(file, size);
//!
//! let region = object.map(0, size as usize, Protection::READ)?;
//! assert_eq!(region.len(), size as usize);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{fs, io, os::fd::AsRawFd};

use log::debug;
use memmap2::MmapOptions;

use super::{check_map_rights, MemoryObject, MmapRegion, Protection, Region, Rights};

/// A memory object backed by a file on disk.
#[derive(Debug)]
pub struct FileObject {
    /// The open file, read-only
    file: fs::File,
    /// Size of the file when it was acquired
    size: u64,
    rights: Rights,
}

impl FileObject {
    /// Wraps an open file of `size` bytes. The handle carries read and map rights only.
    pub fn new(file: fs::File, size: u64) -> FileObject {
        FileObject {
            file,
            size,
            rights: Rights::READ | Rights::MAP,
        }
    }

    /// Size of the backing file in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    fn on_noexec_mount(&self) -> io::Result<bool> {
        on_noexec_mount(&self.file)
    }
}

/// Returns `true` if `file` lives on a filesystem mounted `noexec`.
pub(crate) fn on_noexec_mount(file: &fs::File) -> io::Result<bool> {
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstatvfs(file.as_raw_fd(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(stat.f_flag & libc::ST_NOEXEC != 0)
}

impl MemoryObject for FileObject {
    fn rights(&self) -> Rights {
        self.rights
    }

    fn replace_as_executable(self: Box<Self>) -> io::Result<Box<dyn MemoryObject>> {
        if self.on_noexec_mount()? {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "backing file is on a noexec mount",
            ));
        }

        Ok(Box::new(FileObject {
            file: self.file,
            size: self.size,
            rights: self.rights | Rights::EXECUTE,
        }))
    }

    fn map(&self, offset: u64, len: usize, protection: Protection) -> io::Result<Box<dyn Region>> {
        check_map_rights(self.rights, protection)?;

        let Some(end) = offset.checked_add(len as u64) else {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        };
        if len == 0 || end > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping range outside of file",
            ));
        }

        let mut options = MmapOptions::new();
        options.offset(offset).len(len);

        let mmap = if protection.contains(Protection::EXECUTE) {
            unsafe { options.map_exec(&self.file)? }
        } else {
            unsafe { options.map(&self.file)? }
        };

        debug!(
            "mapped file {} bytes at {:p} ({:?})",
            len,
            mmap.as_ptr(),
            protection
        );

        Ok(Box::new(MmapRegion::new(mmap, protection)))
    }
}
