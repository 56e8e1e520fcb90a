use std::{io, sync::Arc};

use log::debug;
use memmap2::MmapMut;

use super::{check_map_rights, MemoryObject, MmapRegion, Protection, Region, Rights};

/// Memory object backed by bytes the caller already holds
///
/// Mapping copies the requested range into a fresh anonymous mapping and then drops the write
/// permission, so the resulting region has exactly the requested protection.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    data: Arc<Vec<u8>>,
    rights: Rights,
}

impl MemoryBuffer {
    /// Create a new memory object
    ///
    /// ## Arguments
    /// * 'data' - The data buffer to consume
    pub fn new(data: Vec<u8>) -> MemoryBuffer {
        MemoryBuffer {
            data: Arc::new(data),
            rights: Rights::READ | Rights::MAP,
        }
    }

    /// Length of the held data
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if no data is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl MemoryObject for MemoryBuffer {
    fn rights(&self) -> Rights {
        self.rights
    }

    fn replace_as_executable(self: Box<Self>) -> io::Result<Box<dyn MemoryObject>> {
        Ok(Box::new(MemoryBuffer {
            data: self.data,
            rights: self.rights | Rights::EXECUTE,
        }))
    }

    fn map(&self, offset: u64, len: usize, protection: Protection) -> io::Result<Box<dyn Region>> {
        check_map_rights(self.rights, protection)?;

        let Ok(start) = usize::try_from(offset) else {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        };
        let Some(end) = start.checked_add(len) else {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        };
        if len == 0 || end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping range outside of buffer",
            ));
        }

        let mut staging = MmapMut::map_anon(len)?;
        staging.copy_from_slice(&self.data[start..end]);

        let mmap = if protection.contains(Protection::EXECUTE) {
            staging.make_exec()?
        } else {
            staging.make_read_only()?
        };

        debug!(
            "mapped {} buffered bytes at {:p} ({:?})",
            len,
            mmap.as_ptr(),
            protection
        );

        Ok(Box::new(MmapRegion::new(mmap, protection)))
    }
}
