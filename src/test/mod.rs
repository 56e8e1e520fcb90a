//! Shared fixtures for unit tests
//!
//! - [`FakeObject`] / [`MapCounters`] - A memory object that counts maps and unmaps and can be
//!   told to refuse escalation or mapping
//! - [`CountingLoader`] / [`LoaderCounters`] - An [`ElfLoader`] wrapper counting loads and unloads
//! - [`ElfImageBuilder`] - Builds minimal snapshot ELF images

mod elf;

pub use elf::ElfImageBuilder;

use std::{
    io,
    os::fd::OwnedFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    snapshot::{ElfImage, ElfLoader, ImageLoader, LoadedImage},
    vmo::{check_map_rights, MemoryObject, Protection, Region, Rights},
    Result,
};

#[derive(Default)]
struct MapCountersInner {
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    last_protection: Mutex<Option<Protection>>,
}

/// Shared map/unmap counters for [`FakeObject`]
#[derive(Clone, Default)]
pub struct MapCounters(Arc<MapCountersInner>);

impl MapCounters {
    pub fn new() -> MapCounters {
        MapCounters::default()
    }

    pub fn maps(&self) -> usize {
        self.0.maps.load(Ordering::SeqCst)
    }

    pub fn unmaps(&self) -> usize {
        self.0.unmaps.load(Ordering::SeqCst)
    }

    pub fn last_protection(&self) -> Option<Protection> {
        *self.0.last_protection.lock().unwrap()
    }
}

/// Memory object that hands out heap-backed regions and records what happens to them
#[derive(Debug)]
pub struct FakeObject {
    size: usize,
    rights: Rights,
    fail_escalation: bool,
    fail_map: bool,
    counters: MapCounters,
}

impl std::fmt::Debug for MapCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MapCounters({}/{})", self.maps(), self.unmaps())
    }
}

impl FakeObject {
    pub fn new(size: usize, counters: &MapCounters) -> FakeObject {
        FakeObject {
            size,
            rights: Rights::READ | Rights::MAP,
            fail_escalation: false,
            fail_map: false,
            counters: counters.clone(),
        }
    }

    pub fn with_failing_escalation(mut self) -> FakeObject {
        self.fail_escalation = true;
        self
    }

    pub fn with_failing_map(mut self) -> FakeObject {
        self.fail_map = true;
        self
    }
}

impl MemoryObject for FakeObject {
    fn rights(&self) -> Rights {
        self.rights
    }

    fn replace_as_executable(mut self: Box<Self>) -> io::Result<Box<dyn MemoryObject>> {
        if self.fail_escalation {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "execute rights refused",
            ));
        }

        self.rights |= Rights::EXECUTE;
        Ok(self)
    }

    fn map(&self, offset: u64, len: usize, protection: Protection) -> io::Result<Box<dyn Region>> {
        check_map_rights(self.rights, protection)?;
        if self.fail_map {
            return Err(io::Error::other("out of address space"));
        }
        if offset as usize + len > self.size {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        self.counters.0.maps.fetch_add(1, Ordering::SeqCst);
        *self.counters.0.last_protection.lock().unwrap() = Some(protection);

        Ok(Box::new(FakeRegion {
            data: vec![0xAB; len],
            protection,
            counters: self.counters.clone(),
        }))
    }
}

#[derive(Debug)]
struct FakeRegion {
    data: Vec<u8>,
    protection: Protection,
    counters: MapCounters,
}

impl Region for FakeRegion {
    fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn protection(&self) -> Protection {
        self.protection
    }
}

impl Drop for FakeRegion {
    fn drop(&mut self) {
        self.counters.0.unmaps.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared load/unload counters for [`CountingLoader`]
#[derive(Clone, Default)]
pub struct LoaderCounters {
    loads: Arc<AtomicUsize>,
    unloads: Arc<AtomicUsize>,
}

impl LoaderCounters {
    pub fn new() -> LoaderCounters {
        LoaderCounters::default()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

/// [`ElfLoader`] that counts how often it loads and unloads
pub struct CountingLoader {
    inner: ElfLoader,
    counters: LoaderCounters,
}

impl CountingLoader {
    pub fn new(counters: &LoaderCounters) -> CountingLoader {
        CountingLoader {
            inner: ElfLoader::default(),
            counters: counters.clone(),
        }
    }
}

impl ImageLoader for CountingLoader {
    type Handle = ElfImage;

    fn load(&self, fd: OwnedFd) -> Result<LoadedImage<ElfImage>> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(fd)
    }

    fn unload(&self, handle: ElfImage) {
        self.counters.unloads.fetch_add(1, Ordering::SeqCst);
        self.inner.unload(handle);
    }
}
