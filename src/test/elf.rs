//! Minimal snapshot ELF images
//!
//! The layout is fixed: a read-only segment with both data symbols at file/virtual offset
//! 0x1000, a read+execute segment with both instruction symbols at 0x2000, followed by a
//! `.symtab`, `.strtab` and `.shstrtab` and the section header table.

use crate::snapshot::{
    ISOLATE_SNAPSHOT_DATA_SYMBOL, ISOLATE_SNAPSHOT_INSTRUCTIONS_SYMBOL, VM_SNAPSHOT_DATA_SYMBOL,
    VM_SNAPSHOT_INSTRUCTIONS_SYMBOL,
};

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

const RODATA_OFFSET: u64 = 0x1000;
const TEXT_OFFSET: u64 = 0x2000;
const SEGMENT_SIZE: u64 = 0x200;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_R: u32 = 4;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHN_ABS: u16 = 0xfff1;

/// Builder for snapshot ELF images
pub struct ElfImageBuilder {
    symbols: Vec<(&'static str, u64)>,
    undefined: Vec<&'static str>,
    prefix: usize,
    text_filesz: u64,
}

impl ElfImageBuilder {
    pub const VM_DATA_ADDR: u64 = RODATA_OFFSET;
    pub const ISOLATE_DATA_ADDR: u64 = RODATA_OFFSET + 0x100;
    pub const VM_TEXT_ADDR: u64 = TEXT_OFFSET;
    pub const ISOLATE_TEXT_ADDR: u64 = TEXT_OFFSET + 0x100;

    pub const VM_DATA_FILL: u8 = 0xD1;
    pub const ISOLATE_DATA_FILL: u8 = 0xD2;
    pub const TEXT_FILL: u8 = 0xC3;

    /// A well-formed image exporting all four snapshot symbols
    pub fn new() -> ElfImageBuilder {
        ElfImageBuilder {
            symbols: vec![
                (VM_SNAPSHOT_DATA_SYMBOL, Self::VM_DATA_ADDR),
                (VM_SNAPSHOT_INSTRUCTIONS_SYMBOL, Self::VM_TEXT_ADDR),
                (ISOLATE_SNAPSHOT_DATA_SYMBOL, Self::ISOLATE_DATA_ADDR),
                (ISOLATE_SNAPSHOT_INSTRUCTIONS_SYMBOL, Self::ISOLATE_TEXT_ADDR),
            ],
            undefined: Vec::new(),
            prefix: 0,
            text_filesz: SEGMENT_SIZE,
        }
    }

    pub fn without_symbol(mut self, name: &str) -> ElfImageBuilder {
        self.symbols.retain(|(symbol, _)| *symbol != name);
        self
    }

    pub fn with_symbol(mut self, name: &'static str, value: u64) -> ElfImageBuilder {
        self.symbols.retain(|(symbol, _)| *symbol != name);
        self.symbols.push((name, value));
        self
    }

    /// Adds an undefined (`SHN_UNDEF`) entry for `name` ahead of the defined symbols
    pub fn with_undefined_symbol(mut self, name: &'static str) -> ElfImageBuilder {
        self.undefined.push(name);
        self
    }

    /// Places `len` filler bytes in front of the image
    pub fn with_prefix(mut self, len: usize) -> ElfImageBuilder {
        self.prefix = len;
        self
    }

    /// Overrides the file and memory size of the text segment
    pub fn with_text_filesz(mut self, size: u64) -> ElfImageBuilder {
        self.text_filesz = size;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; SYM_SIZE];
        for name in &self.undefined {
            let st_name = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);

            symtab.extend_from_slice(&st_name.to_le_bytes());
            symtab.push(0x10);
            symtab.push(0);
            symtab.extend_from_slice(&0_u16.to_le_bytes());
            symtab.extend_from_slice(&0_u64.to_le_bytes());
            symtab.extend_from_slice(&0_u64.to_le_bytes());
        }
        for (name, value) in &self.symbols {
            let st_name = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);

            let st_info = if name.ends_with("Instructions") { 0x12 } else { 0x11 };
            symtab.extend_from_slice(&st_name.to_le_bytes());
            symtab.push(st_info);
            symtab.push(0);
            symtab.extend_from_slice(&SHN_ABS.to_le_bytes());
            symtab.extend_from_slice(&value.to_le_bytes());
            symtab.extend_from_slice(&0x100_u64.to_le_bytes());
        }

        let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0";
        let symtab_offset = (TEXT_OFFSET + SEGMENT_SIZE) as usize;
        let strtab_offset = symtab_offset + symtab.len();
        let shstrtab_offset = strtab_offset + strtab.len();
        let shoff = (shstrtab_offset + shstrtab.len() + 7) & !7;

        let mut out = vec![0u8; shoff + 4 * SHDR_SIZE];

        // ELF header
        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // ELFDATA2LSB
        out[6] = 1; // EV_CURRENT
        put_u16(&mut out, 16, 3); // ET_DYN
        put_u16(&mut out, 18, 62); // EM_X86_64
        put_u32(&mut out, 20, 1);
        put_u64(&mut out, 24, 0);
        put_u64(&mut out, 32, EHDR_SIZE as u64);
        put_u64(&mut out, 40, shoff as u64);
        put_u32(&mut out, 48, 0);
        put_u16(&mut out, 52, EHDR_SIZE as u16);
        put_u16(&mut out, 54, PHDR_SIZE as u16);
        put_u16(&mut out, 56, 2);
        put_u16(&mut out, 58, SHDR_SIZE as u16);
        put_u16(&mut out, 60, 4);
        put_u16(&mut out, 62, 3);

        // Program headers
        put_phdr(&mut out, EHDR_SIZE, PF_R, RODATA_OFFSET, SEGMENT_SIZE);
        put_phdr(
            &mut out,
            EHDR_SIZE + PHDR_SIZE,
            PF_R | PF_X,
            TEXT_OFFSET,
            self.text_filesz,
        );

        // Segment contents
        let vm_data = Self::VM_DATA_ADDR as usize;
        let isolate_data = Self::ISOLATE_DATA_ADDR as usize;
        let text = TEXT_OFFSET as usize;
        out[vm_data..isolate_data].fill(Self::VM_DATA_FILL);
        out[isolate_data..text - 0xE00].fill(Self::ISOLATE_DATA_FILL);
        out[text..text + SEGMENT_SIZE as usize].fill(Self::TEXT_FILL);

        // Symbol and string tables
        out[symtab_offset..strtab_offset].copy_from_slice(&symtab);
        out[strtab_offset..shstrtab_offset].copy_from_slice(&strtab);
        out[shstrtab_offset..shstrtab_offset + shstrtab.len()].copy_from_slice(shstrtab);

        // Section headers: null, .symtab, .strtab, .shstrtab
        put_shdr(
            &mut out,
            shoff + SHDR_SIZE,
            1,
            SHT_SYMTAB,
            symtab_offset,
            symtab.len(),
            2,
            1,
            8,
            SYM_SIZE,
        );
        put_shdr(
            &mut out,
            shoff + 2 * SHDR_SIZE,
            9,
            SHT_STRTAB,
            strtab_offset,
            strtab.len(),
            0,
            0,
            1,
            0,
        );
        put_shdr(
            &mut out,
            shoff + 3 * SHDR_SIZE,
            17,
            SHT_STRTAB,
            shstrtab_offset,
            shstrtab.len(),
            0,
            0,
            1,
            0,
        );

        let mut image = vec![0u8; self.prefix];
        image.extend_from_slice(&out);
        image
    }
}

fn put_u16(out: &mut [u8], at: usize, value: u16) {
    out[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut [u8], at: usize, value: u64) {
    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_phdr(out: &mut [u8], at: usize, flags: u32, offset: u64, size: u64) {
    put_u32(out, at, PT_LOAD);
    put_u32(out, at + 4, flags);
    put_u64(out, at + 8, offset);
    put_u64(out, at + 16, offset);
    put_u64(out, at + 24, offset);
    put_u64(out, at + 32, size);
    put_u64(out, at + 40, size);
    put_u64(out, at + 48, 0x1000);
}

#[allow(clippy::too_many_arguments)]
fn put_shdr(
    out: &mut [u8],
    at: usize,
    name: u32,
    kind: u32,
    offset: usize,
    size: usize,
    link: u32,
    info: u32,
    align: u64,
    entsize: usize,
) {
    put_u32(out, at, name);
    put_u32(out, at + 4, kind);
    put_u64(out, at + 8, 0);
    put_u64(out, at + 16, 0);
    put_u64(out, at + 24, offset as u64);
    put_u64(out, at + 32, size as u64);
    put_u32(out, at + 40, link);
    put_u32(out, at + 44, info);
    put_u64(out, at + 48, align);
    put_u64(out, at + 56, entsize as u64);
}
