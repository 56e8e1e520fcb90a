//! ELF snapshot loader.
//!
//! [`crate::snapshot::ElfLoader`] is the default [`crate::snapshot::ImageLoader`]. It treats the
//! descriptor as an ELF shared object that exports the four snapshot symbols, lays its loadable
//! segments out in a private anonymous mapping and resolves the symbols against that mapping.
//!
//! # Loading Steps
//!
//! 1. Map the descriptor read-only and parse it with `goblin`, starting at the configured
//!    file offset
//! 2. Reject anything but 64-bit little-endian images and images without `PT_LOAD` segments
//! 3. Copy every segment's file bytes to its virtual offset inside a fresh anonymous mapping
//! 4. Make the whole image read-only, then raise `PF_X` segments to read+execute
//! 5. Resolve the four snapshot symbols from `.dynsym`, falling back to `.symtab`
//!
//! No page of a loaded image is ever writable.

use std::{fs, os::fd::OwnedFd, ptr::NonNull};

use goblin::elf::{
    program_header::{PF_X, PT_LOAD},
    section_header::SHN_UNDEF,
    Elf, ProgramHeader, Sym,
};
use log::debug;
use memmap2::{Mmap, MmapMut};

use super::{ImageLoader, LoadedImage, SnapshotRegions};
use crate::Result;

/// Symbol of the data shared by all isolates
pub const VM_SNAPSHOT_DATA_SYMBOL: &str = "_kDartVmSnapshotData";
/// Symbol of the instructions shared by all isolates
pub const VM_SNAPSHOT_INSTRUCTIONS_SYMBOL: &str = "_kDartVmSnapshotInstructions";
/// Symbol of the per-isolate data
pub const ISOLATE_SNAPSHOT_DATA_SYMBOL: &str = "_kDartIsolateSnapshotData";
/// Symbol of the per-isolate instructions
pub const ISOLATE_SNAPSHOT_INSTRUCTIONS_SYMBOL: &str = "_kDartIsolateSnapshotInstructions";

/// Configuration for [`ElfLoader`].
#[derive(Debug, Clone, Default)]
pub struct ElfLoaderConfig {
    /// Offset of the ELF image inside the file (default: 0).
    pub file_offset: u64,
}

/// Loads snapshot images that are ELF shared objects.
#[derive(Debug, Clone, Default)]
pub struct ElfLoader {
    config: ElfLoaderConfig,
}

impl ElfLoader {
    /// Creates a loader with the given configuration.
    pub fn new(config: ElfLoaderConfig) -> ElfLoader {
        ElfLoader { config }
    }

    /// The configuration of this loader.
    #[must_use]
    pub fn config(&self) -> &ElfLoaderConfig {
        &self.config
    }
}

/// A loaded ELF image. Dropping it unmaps the image.
#[derive(Debug)]
pub struct ElfImage {
    image: Mmap,
    base: u64,
}

impl ElfImage {
    /// Lowest (page aligned) virtual address of the image; the start of the mapping corresponds
    /// to it.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Start of the mapping.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.image.as_ptr()
    }

    /// Size of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.image.len()
    }

    /// Returns `true` if the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }
}

impl ImageLoader for ElfLoader {
    type Handle = ElfImage;

    fn load(&self, fd: OwnedFd) -> Result<LoadedImage<ElfImage>> {
        let file = fs::File::from(fd);
        let source = unsafe { Mmap::map(&file) }
            .map_err(|e| image_error!("Failed to map image file: {}", e))?;
        drop(file);

        let Ok(offset) = usize::try_from(self.config.file_offset) else {
            return Err(image_error!("File offset does not fit the address space"));
        };
        if offset >= source.len() {
            return Err(image_error!(
                "Image is empty (file size {}, offset {})",
                source.len(),
                offset
            ));
        }

        load_image(&source[offset..])
    }

    fn unload(&self, handle: ElfImage) {
        debug!("unmapping ELF image of {} bytes at {:p}", handle.len(), handle.as_ptr());
        drop(handle);
    }
}

fn load_image(bytes: &[u8]) -> Result<LoadedImage<ElfImage>> {
    let elf = Elf::parse(bytes)?;
    if !elf.is_64 || !elf.little_endian {
        return Err(image_error!("Only 64-bit little-endian images are supported"));
    }

    let segments: Vec<&ProgramHeader> = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .collect();
    if segments.is_empty() {
        return Err(image_error!("Image has no loadable segments"));
    }

    let page = page_size();
    let mut base = u64::MAX;
    let mut end = 0_u64;
    for ph in &segments {
        let Some(file_end) = ph.p_offset.checked_add(ph.p_filesz) else {
            return Err(image_error!("Segment file range overflows"));
        };
        if file_end > bytes.len() as u64 {
            return Err(image_error!(
                "Segment at offset 0x{:x} extends past the end of the image",
                ph.p_offset
            ));
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(image_error!(
                "Segment at 0x{:x} has more file bytes than memory",
                ph.p_vaddr
            ));
        }

        let Some(seg_end) = ph.p_vaddr.checked_add(ph.p_memsz).and_then(|e| align_up(e, page))
        else {
            return Err(image_error!("Segment at 0x{:x} overflows", ph.p_vaddr));
        };
        base = base.min(align_down(ph.p_vaddr, page));
        end = end.max(seg_end);
    }

    let span = usize::try_from(end - base)
        .map_err(|_| image_error!("Image span 0x{:x} is too large", end - base))?;
    if span == 0 {
        return Err(image_error!("Image has no loadable bytes"));
    }

    let mut staging =
        MmapMut::map_anon(span).map_err(|e| image_error!("Failed to reserve image: {}", e))?;
    for ph in &segments {
        let dst = (ph.p_vaddr - base) as usize;
        let src = ph.p_offset as usize;
        let len = ph.p_filesz as usize;
        staging[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
    }

    let image = staging
        .make_read_only()
        .map_err(|e| image_error!("Failed to protect image: {}", e))?;

    for ph in segments.iter().filter(|ph| ph.p_flags & PF_X != 0) {
        let start = align_down(ph.p_vaddr, page) - base;
        let stop = align_up(ph.p_vaddr + ph.p_memsz, page).unwrap_or(end) - base;
        let result = unsafe {
            libc::mprotect(
                image.as_ptr().add(start as usize) as *mut libc::c_void,
                (stop - start) as usize,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(image_error!(
                "Failed to make segment at 0x{:x} executable: {}",
                ph.p_vaddr,
                std::io::Error::last_os_error()
            ));
        }
    }

    let resolve = |name: &str| -> Result<NonNull<u8>> {
        let value = find_symbol(&elf, name)
            .ok_or_else(|| image_error!("Couldn't find snapshot symbol {}", name))?;

        let loaded = segments
            .iter()
            .any(|ph| value >= ph.p_vaddr && value - ph.p_vaddr < ph.p_memsz);
        if !loaded {
            return Err(image_error!(
                "Symbol {} at 0x{:x} is outside of the loaded segments",
                name,
                value
            ));
        }

        let ptr = unsafe { image.as_ptr().add((value - base) as usize) };
        NonNull::new(ptr.cast_mut()).ok_or_else(|| image_error!("Symbol {} resolved to null", name))
    };

    let regions = SnapshotRegions {
        vm_data: resolve(VM_SNAPSHOT_DATA_SYMBOL)?,
        vm_instructions: resolve(VM_SNAPSHOT_INSTRUCTIONS_SYMBOL)?,
        isolate_data: resolve(ISOLATE_SNAPSHOT_DATA_SYMBOL)?,
        isolate_instructions: resolve(ISOLATE_SNAPSHOT_INSTRUCTIONS_SYMBOL)?,
    };

    debug!(
        "loaded ELF image: {} bytes at {:p}, base 0x{:x}",
        image.len(),
        image.as_ptr(),
        base
    );

    Ok(LoadedImage {
        handle: ElfImage { image, base },
        regions,
    })
}

/// Looks `name` up among the defined symbols, `.dynsym` first.
fn find_symbol(elf: &Elf, name: &str) -> Option<u64> {
    let defined = |sym: &Sym| sym.st_shndx != SHN_UNDEF as usize;

    elf.dynsyms
        .iter()
        .find(|sym| defined(sym) && elf.dynstrtab.get_at(sym.st_name) == Some(name))
        .or_else(|| {
            elf.syms
                .iter()
                .find(|sym| defined(sym) && elf.strtab.get_at(sym.st_name) == Some(name))
        })
        .map(|sym| sym.st_value)
}

fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

fn align_up(value: u64, align: u64) -> Option<u64> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}
