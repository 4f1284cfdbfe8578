// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synthetic Mach-O images for test suites.
//!
//! Produces small but structurally complete executables: `__PAGEZERO`,
//! `__TEXT` with a single `__text` section, `__LINKEDIT` holding a string
//! table, `LC_SYMTAB` and `LC_BUILD_VERSION`.

use {
    crate::{
        header::{Ctx, MachHeader},
        load_command::{BuildVersion, LoadCommand, LoadCommandData, Symtab},
        segment::{str_to_name, Section, Segment},
    },
    goblin::mach::{
        header::{MH_EXECUTE, MH_MAGIC, MH_MAGIC_64},
        load_command::{LC_BUILD_VERSION, LC_SYMTAB},
    },
    scroll::{Endian, Pwrite},
};

pub const CPU_TYPE_X86: u32 = 7;
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_TYPE_POWERPC: u32 = 18;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Write a `u32` into a buffer.
pub fn put_u32(data: &mut [u8], offset: usize, value: u32, endian: Endian) {
    data.pwrite_with(value, offset, endian)
        .expect("offset within buffer");
}

/// Describes a synthetic executable.
#[derive(Clone, Debug)]
pub struct SyntheticImage {
    pub is_64: bool,
    pub endian: Endian,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    /// Content of the `__text` section.
    pub code: Vec<u8>,
    /// File offset of the `__text` section.
    pub code_offset: usize,
    /// Size of the string table filling `__LINKEDIT`.
    pub linkedit_size: usize,
    /// `(platform, minos, sdk)` for `LC_BUILD_VERSION`.
    pub build_version: Option<(u32, u32, u32)>,
}

impl Default for SyntheticImage {
    fn default() -> Self {
        Self {
            is_64: true,
            endian: scroll::LE,
            cputype: CPU_TYPE_X86_64,
            cpusubtype: 3,
            filetype: MH_EXECUTE,
            code: (0..6000u32).map(|i| (i % 251) as u8).collect(),
            code_offset: 0x800,
            linkedit_size: 256,
            build_version: Some((1, 0x000c_0000, 0x000c_0300)),
        }
    }
}

impl SyntheticImage {
    pub fn arm64() -> Self {
        Self {
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            code: (0..9000u32).map(|i| (i % 239) as u8).collect(),
            ..Default::default()
        }
    }

    pub fn i386() -> Self {
        Self {
            is_64: false,
            cputype: CPU_TYPE_X86,
            build_version: Some((1, 0x000a_0d00, 0x000a_0f00)),
            ..Default::default()
        }
    }

    /// Big endian 32-bit image.
    pub fn ppc() -> Self {
        Self {
            is_64: false,
            endian: scroll::BE,
            cputype: CPU_TYPE_POWERPC,
            cpusubtype: 0,
            build_version: None,
            ..Default::default()
        }
    }

    fn ctx(&self) -> Ctx {
        Ctx {
            endian: self.endian,
            is_64: self.is_64,
        }
    }

    /// Total size of the produced image.
    pub fn file_size(&self) -> usize {
        self.text_filesize() + self.linkedit_size
    }

    fn text_filesize(&self) -> usize {
        align_up(self.code_offset + self.code.len(), 0x1000)
    }

    fn load_commands(&self) -> Vec<LoadCommand> {
        let ctx = self.ctx();
        let vm_base: u64 = if self.is_64 { 0x1_0000_0000 } else { 0x1000 };
        let text_filesize = self.text_filesize() as u64;
        let text_vmsize = align_up(text_filesize as usize, 0x4000) as u64;

        let mut commands = vec![
            LoadCommand::segment(
                Segment {
                    segname: str_to_name("__PAGEZERO"),
                    vmsize: vm_base,
                    ..Default::default()
                },
                ctx,
            ),
            LoadCommand::segment(
                Segment {
                    segname: str_to_name("__TEXT"),
                    vmaddr: vm_base,
                    vmsize: text_vmsize,
                    fileoff: 0,
                    filesize: text_filesize,
                    maxprot: 5,
                    initprot: 5,
                    flags: 0,
                    sections: vec![Section {
                        sectname: str_to_name("__text"),
                        segname: str_to_name("__TEXT"),
                        addr: vm_base + self.code_offset as u64,
                        size: self.code.len() as u64,
                        offset: self.code_offset as u32,
                        align: 4,
                        flags: 0x8000_0400,
                        ..Default::default()
                    }],
                },
                ctx,
            ),
            LoadCommand::segment(
                Segment {
                    segname: str_to_name("__LINKEDIT"),
                    vmaddr: vm_base + text_vmsize,
                    vmsize: align_up(self.linkedit_size.max(1), 0x4000) as u64,
                    fileoff: text_filesize,
                    filesize: self.linkedit_size as u64,
                    maxprot: 1,
                    initprot: 1,
                    ..Default::default()
                },
                ctx,
            ),
            LoadCommand {
                cmd: LC_SYMTAB,
                data: LoadCommandData::Symtab(Symtab {
                    symoff: 0,
                    nsyms: 0,
                    stroff: text_filesize as u32,
                    strsize: self.linkedit_size as u32,
                }),
                trailing: vec![],
            },
        ];

        if let Some((platform, minos, sdk)) = self.build_version {
            commands.push(LoadCommand {
                cmd: LC_BUILD_VERSION,
                data: LoadCommandData::BuildVersion(BuildVersion {
                    platform,
                    minos,
                    sdk,
                    ntools: 0,
                }),
                trailing: vec![],
            });
        }

        commands
    }

    /// Produce the image bytes.
    pub fn build(&self) -> Vec<u8> {
        let ctx = self.ctx();
        let commands = self.load_commands();

        let mut data = vec![0u8; self.file_size()];

        let mut offset = ctx.header_size();
        for lc in &commands {
            let bytes = lc.to_bytes(ctx).expect("synthetic load command serializes");
            data[offset..offset + bytes.len()].copy_from_slice(&bytes);
            offset += bytes.len();
        }
        assert!(
            offset <= self.code_offset,
            "load commands overlap __text section"
        );

        MachHeader {
            magic: if self.is_64 { MH_MAGIC_64 } else { MH_MAGIC },
            cputype: self.cputype,
            cpusubtype: self.cpusubtype,
            filetype: self.filetype,
            ncmds: commands.len() as u32,
            sizeofcmds: (offset - ctx.header_size()) as u32,
            flags: 0x0020_0085,
            reserved: 0,
        }
        .write(&mut data, ctx)
        .expect("header fits");

        data[self.code_offset..self.code_offset + self.code.len()].copy_from_slice(&self.code);

        let linkedit_start = self.text_filesize();
        for (i, b) in data[linkedit_start..].iter_mut().enumerate() {
            *b = b'A' + (i % 26) as u8;
        }

        data
    }
}
