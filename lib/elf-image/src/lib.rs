// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reader for game binaries: ELF-32, little-endian, ARM, as produced by
//! the game toolchain.
//!
//! A binary carries one executable LOAD segment (aligned to the VM's
//! 256-byte code block size), one read-write LOAD, one zero-fill LOAD,
//! and a metadata segment with a processor-specific type. Debug builds
//! additionally carry section headers and string/line tables after a
//! human-readable marker; none of that is required, or read, at run time
//! — only the host-side log decoder dereferences it.

#![cfg_attr(not(test), no_std)]

use zerocopy::little_endian::{U16, U32};
use zerocopy::FromBytes as _;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const EI_NIDENT: usize = 16;
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const EM_ARM: u16 = 40;

pub const PT_LOAD: u32 = 1;
/// Processor-specific segment holding the title's metadata records.
pub const PT_METADATA: u32 = 0x7000_0001;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_STRTAB: u32 = 3;

/// Code blocks are the unit of validation; the executable segment must
/// start and stay aligned to them.
pub const CODE_ALIGN: u32 = 256;

/// Text separating the runtime-required prefix of a debug binary from
/// the debug suffix, for people poking at binaries with a hex dump.
pub const DEBUG_MARKER: &[u8] =
    b"\nDebug information follows. This data stays on disk;\n\
      it is never loaded by the virtual machine.\n\n";

#[derive(Copy, Clone, Debug)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FileHeader {
    pub ident: [u8; EI_NIDENT],
    pub etype: U16,
    pub machine: U16,
    pub version: U32,
    pub entry: U32,
    pub phoff: U32,
    pub shoff: U32,
    pub flags: U32,
    pub ehsize: U16,
    pub phentsize: U16,
    pub phnum: U16,
    pub shentsize: U16,
    pub shnum: U16,
    pub shstrndx: U16,
}

static_assertions::const_assert_eq!(core::mem::size_of::<FileHeader>(), 52);

#[derive(Copy, Clone, Debug, Default)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ProgramHeader {
    pub ptype: U32,
    pub offset: U32,
    pub vaddr: U32,
    pub paddr: U32,
    pub filesz: U32,
    pub memsz: U32,
    pub flags: U32,
    pub align: U32,
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<ProgramHeader>(),
    32
);

#[derive(Copy, Clone, Debug)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SectionHeader {
    pub name: U32,
    pub stype: U32,
    pub flags: U32,
    pub addr: U32,
    pub offset: U32,
    pub size: U32,
    pub link: U32,
    pub info: U32,
    pub addralign: U32,
    pub entsize: U32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ElfError {
    Truncated,
    BadMagic,
    BadClass,
    BadEndianness,
    BadMachine,
    BadType,
    BadProgramHeaders,
    NoCodeSegment,
    Misaligned,
}

/// One classified loadable region.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    pub vaddr: u32,
    pub offset: u32,
    pub file_size: u32,
    pub mem_size: u32,
}

/// Everything the runtime needs from a binary's headers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgramInfo {
    /// Virtual address of the entry function.
    pub entry: u32,
    /// Executable, read-only segment; code runs only from here.
    pub ro: Segment,
    /// Initialized read-write data, copied into RAM at startup.
    pub rw: Option<Segment>,
    /// Zero-filled region.
    pub bss: Option<Segment>,
    /// Metadata records; opaque to the VM itself.
    pub meta: Option<Segment>,
}

impl ProgramInfo {
    /// Parse and validate the header prefix of a binary. `prefix` only
    /// needs to cover the file and program headers — one code block is
    /// always enough, which is why the loader can hand us the first
    /// cached block of the volume.
    pub fn parse(prefix: &[u8]) -> Result<Self, ElfError> {
        let hdr = FileHeader::read_from_prefix(prefix)
            .map_err(|_| ElfError::Truncated)?
            .0;

        if hdr.ident[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if hdr.ident[4] != ELFCLASS32 {
            return Err(ElfError::BadClass);
        }
        if hdr.ident[5] != ELFDATA2LSB {
            return Err(ElfError::BadEndianness);
        }
        if hdr.machine.get() != EM_ARM {
            return Err(ElfError::BadMachine);
        }
        if hdr.etype.get() != ET_EXEC {
            return Err(ElfError::BadType);
        }
        if usize::from(hdr.phentsize.get())
            != core::mem::size_of::<ProgramHeader>()
            || hdr.phnum.get() == 0
        {
            return Err(ElfError::BadProgramHeaders);
        }

        let mut info = ProgramInfo {
            entry: hdr.entry.get(),
            ..Default::default()
        };

        for i in 0..usize::from(hdr.phnum.get()) {
            let off = hdr.phoff.get() as usize
                + i * core::mem::size_of::<ProgramHeader>();
            let bytes = prefix
                .get(off..off + core::mem::size_of::<ProgramHeader>())
                .ok_or(ElfError::Truncated)?;
            let ph = ProgramHeader::read_from_bytes(bytes).unwrap();
            let seg = Segment {
                vaddr: ph.vaddr.get(),
                offset: ph.offset.get(),
                file_size: ph.filesz.get(),
                mem_size: ph.memsz.get(),
            };

            match ph.ptype.get() {
                PT_LOAD if ph.flags.get() & PF_X != 0 => {
                    if seg.vaddr % CODE_ALIGN != 0
                        || seg.offset % CODE_ALIGN != 0
                    {
                        return Err(ElfError::Misaligned);
                    }
                    info.ro = seg;
                }
                PT_LOAD if ph.filesz.get() == 0 => info.bss = Some(seg),
                PT_LOAD => info.rw = Some(seg),
                PT_METADATA => info.meta = Some(seg),
                _ => {}
            }
        }

        if info.ro.mem_size == 0 {
            return Err(ElfError::NoCodeSegment);
        }
        Ok(info)
    }
}

/// Section lookup over a complete binary image, for host tools. Returns
/// the raw contents of the named section.
pub fn find_section<'a>(image: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let hdr = FileHeader::read_from_prefix(image).ok()?.0;
    let shnum = usize::from(hdr.shnum.get());
    if shnum == 0 {
        return None;
    }

    let section = |index: usize| -> Option<SectionHeader> {
        let off = hdr.shoff.get() as usize
            + index * core::mem::size_of::<SectionHeader>();
        let bytes =
            image.get(off..off + core::mem::size_of::<SectionHeader>())?;
        Some(SectionHeader::read_from_bytes(bytes).unwrap())
    };

    let strtab = section(usize::from(hdr.shstrndx.get()))?;
    let names = image.get(
        strtab.offset.get() as usize
            ..(strtab.offset.get() + strtab.size.get()) as usize,
    )?;

    for i in 0..shnum {
        let sh = section(i)?;
        let start = sh.name.get() as usize;
        let end = names[start..].iter().position(|&b| b == 0)? + start;
        if &names[start..end] == name.as_bytes() {
            return image.get(
                sh.offset.get() as usize
                    ..(sh.offset.get() + sh.size.get()) as usize,
            );
        }
    }
    None
}

/// Read a NUL-terminated string out of a string-table section at the
/// given byte offset.
pub fn string_at(table: &[u8], offset: u32) -> Option<&str> {
    let start = offset as usize;
    let bytes = table.get(start..)?;
    let end = bytes.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&bytes[..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn minimal_image() -> Vec<u8> {
        let mut hdr = FileHeader {
            ident: [0; EI_NIDENT],
            etype: ET_EXEC.into(),
            machine: EM_ARM.into(),
            version: 1.into(),
            entry: 0x1A4.into(),
            phoff: 52.into(),
            shoff: 0.into(),
            flags: 0.into(),
            ehsize: 52.into(),
            phentsize: 32.into(),
            phnum: 4.into(),
            shentsize: 40.into(),
            shnum: 0.into(),
            shstrndx: 0.into(),
        };
        hdr.ident[..4].copy_from_slice(&ELF_MAGIC);
        hdr.ident[4] = ELFCLASS32;
        hdr.ident[5] = ELFDATA2LSB;

        let phdrs = [
            // RO / executable
            ProgramHeader {
                ptype: PT_LOAD.into(),
                offset: 0x100.into(),
                vaddr: 0x0.into(),
                filesz: 0x800.into(),
                memsz: 0x800.into(),
                flags: (PF_R | PF_X).into(),
                align: CODE_ALIGN.into(),
                ..Default::default()
            },
            // RW data
            ProgramHeader {
                ptype: PT_LOAD.into(),
                offset: 0x900.into(),
                vaddr: 0x10000.into(),
                filesz: 0x40.into(),
                memsz: 0x40.into(),
                flags: (PF_R | PF_W).into(),
                align: 4.into(),
                ..Default::default()
            },
            // BSS
            ProgramHeader {
                ptype: PT_LOAD.into(),
                offset: 0x940.into(),
                vaddr: 0x10040.into(),
                filesz: 0.into(),
                memsz: 0x100.into(),
                flags: (PF_R | PF_W).into(),
                align: 4.into(),
                ..Default::default()
            },
            // Metadata
            ProgramHeader {
                ptype: PT_METADATA.into(),
                offset: 0x940.into(),
                vaddr: 0.into(),
                filesz: 0x20.into(),
                memsz: 0x20.into(),
                flags: PF_R.into(),
                align: 4.into(),
                ..Default::default()
            },
        ];

        let mut image = hdr.as_bytes().to_vec();
        for ph in &phdrs {
            image.extend_from_slice(ph.as_bytes());
        }
        image
    }

    #[test]
    fn classifies_all_four_segments() {
        let info = ProgramInfo::parse(&minimal_image()).unwrap();
        assert_eq!(info.entry, 0x1A4);
        assert_eq!(info.ro.file_size, 0x800);
        assert_eq!(info.rw.unwrap().vaddr, 0x10000);
        assert_eq!(info.bss.unwrap().mem_size, 0x100);
        assert_eq!(info.meta.unwrap().file_size, 0x20);
    }

    #[test]
    fn rejects_wrong_machine_and_magic() {
        let mut image = minimal_image();
        image[18] = 0x3E; // x86-64
        assert_eq!(
            ProgramInfo::parse(&image),
            Err(ElfError::BadMachine)
        );

        let mut image = minimal_image();
        image[0] = 0;
        assert_eq!(ProgramInfo::parse(&image), Err(ElfError::BadMagic));
    }

    #[test]
    fn rejects_unaligned_code_segment() {
        let mut image = minimal_image();
        // Nudge the RO segment's file offset off the code-block grid.
        image[52 + 4] = 0x04;
        assert_eq!(
            ProgramInfo::parse(&image),
            Err(ElfError::Misaligned)
        );
    }

    #[test]
    fn parse_needs_only_the_header_prefix() {
        let image = minimal_image();
        assert!(image.len() <= 256);
        let info = ProgramInfo::parse(&image[..]).unwrap();
        assert_eq!(info.ro.offset, 0x100);
    }

    #[test]
    fn section_lookup_finds_named_contents() {
        // Hand-build an image with two sections and a shstrtab.
        let names = b"\0.debug_logstr\0.shstrtab\0";
        let payload = b"format strings live here";

        let mut hdr = FileHeader {
            ident: [0; EI_NIDENT],
            etype: ET_EXEC.into(),
            machine: EM_ARM.into(),
            version: 1.into(),
            entry: 0.into(),
            phoff: 0.into(),
            shoff: 52.into(),
            flags: 0.into(),
            ehsize: 52.into(),
            phentsize: 32.into(),
            phnum: 0.into(),
            shentsize: 40.into(),
            shnum: 2.into(),
            shstrndx: 1.into(),
        };
        hdr.ident[..4].copy_from_slice(&ELF_MAGIC);
        hdr.ident[4] = ELFCLASS32;
        hdr.ident[5] = ELFDATA2LSB;

        let sh_size = core::mem::size_of::<SectionHeader>();
        let names_off = 52 + 2 * sh_size;
        let payload_off = names_off + names.len();

        let sections = [
            SectionHeader {
                name: 1.into(), // ".debug_logstr"
                stype: SHT_PROGBITS.into(),
                offset: (payload_off as u32).into(),
                size: (payload.len() as u32).into(),
                ..zerocopy::FromZeros::new_zeroed()
            },
            SectionHeader {
                name: 15.into(), // ".shstrtab"
                stype: SHT_STRTAB.into(),
                offset: (names_off as u32).into(),
                size: (names.len() as u32).into(),
                ..zerocopy::FromZeros::new_zeroed()
            },
        ];

        let mut image = hdr.as_bytes().to_vec();
        for sh in &sections {
            image.extend_from_slice(sh.as_bytes());
        }
        image.extend_from_slice(names);
        image.extend_from_slice(payload);

        assert_eq!(
            find_section(&image, ".debug_logstr"),
            Some(&payload[..])
        );
        assert_eq!(find_section(&image, ".debug_frame"), None);

        let table = find_section(&image, ".shstrtab").unwrap();
        assert_eq!(string_at(table, 1), Some(".debug_logstr"));
    }
}
