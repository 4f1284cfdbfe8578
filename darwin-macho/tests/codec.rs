// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    darwin_macho::{
        create_universal_macho, load_command::Symtab, str_to_name, Ctx, FatBinary, LoadCommand,
        LoadCommandData, MachFile, MachHeader, MachOImage, Section, Segment,
    },
    goblin::mach::{
        header::{MH_EXECUTE, MH_MAGIC, MH_MAGIC_64},
        load_command::LC_SYMTAB,
        Mach, MachO,
    },
};

const CODE_OFFSET: usize = 0x400;
const LINKEDIT_SIZE: usize = 128;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// An executable with `__TEXT` holding `code_len` bytes of code, followed by
/// `__LINKEDIT` holding the string table.
fn executable(ctx: Ctx, cputype: u32, code_len: usize) -> Vec<u8> {
    let text_size = align_up(CODE_OFFSET + code_len, 0x1000);
    let vm_base = if ctx.is_64 { 0x1_0000_0000 } else { 0x1000 };

    let commands = vec![
        LoadCommand::segment(
            Segment {
                segname: str_to_name("__TEXT"),
                vmaddr: vm_base,
                vmsize: align_up(text_size, 0x4000) as u64,
                filesize: text_size as u64,
                maxprot: 5,
                initprot: 5,
                sections: vec![Section {
                    sectname: str_to_name("__text"),
                    segname: str_to_name("__TEXT"),
                    addr: vm_base + CODE_OFFSET as u64,
                    size: code_len as u64,
                    offset: CODE_OFFSET as u32,
                    align: 4,
                    ..Default::default()
                }],
                ..Default::default()
            },
            ctx,
        ),
        LoadCommand::segment(
            Segment {
                segname: str_to_name("__LINKEDIT"),
                vmaddr: vm_base + align_up(text_size, 0x4000) as u64,
                vmsize: 0x4000,
                fileoff: text_size as u64,
                filesize: LINKEDIT_SIZE as u64,
                maxprot: 1,
                initprot: 1,
                ..Default::default()
            },
            ctx,
        ),
        LoadCommand {
            cmd: LC_SYMTAB,
            data: LoadCommandData::Symtab(Symtab {
                stroff: text_size as u32,
                strsize: LINKEDIT_SIZE as u32,
                ..Default::default()
            }),
            trailing: vec![],
        },
    ];

    let mut data = vec![0u8; text_size + LINKEDIT_SIZE];
    let mut offset = ctx.header_size();
    for lc in &commands {
        let bytes = lc.to_bytes(ctx).unwrap();
        data[offset..offset + bytes.len()].copy_from_slice(&bytes);
        offset += bytes.len();
    }
    assert!(offset <= CODE_OFFSET);

    MachHeader {
        magic: if ctx.is_64 { MH_MAGIC_64 } else { MH_MAGIC },
        cputype,
        filetype: MH_EXECUTE,
        ncmds: commands.len() as u32,
        sizeofcmds: (offset - ctx.header_size()) as u32,
        ..Default::default()
    }
    .write(&mut data, ctx)
    .unwrap();

    for (i, b) in data[CODE_OFFSET..CODE_OFFSET + code_len].iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }

    data
}

fn x86_64() -> Vec<u8> {
    executable(
        Ctx {
            endian: scroll::LE,
            is_64: true,
        },
        0x0100_0007,
        5000,
    )
}

fn arm64() -> Vec<u8> {
    executable(
        Ctx {
            endian: scroll::LE,
            is_64: true,
        },
        0x0100_000c,
        9000,
    )
}

fn universal(binaries: &[&[u8]]) -> Vec<u8> {
    let mut data = vec![];
    create_universal_macho(&mut data, binaries.iter().copied()).unwrap();
    data
}

#[test]
fn thin_round_trip() {
    let ppc = executable(
        Ctx {
            endian: scroll::BE,
            is_64: false,
        },
        18,
        3000,
    );
    let i386 = executable(
        Ctx {
            endian: scroll::LE,
            is_64: false,
        },
        7,
        3000,
    );

    for data in [x86_64(), i386, ppc] {
        let image = MachOImage::parse(&data).unwrap();
        assert_eq!(image.serialize().unwrap(), data);

        let macho = MachO::parse(&data, 0).unwrap();
        assert_eq!(macho.segments.len(), 2);
        assert_eq!(
            image.segment("__TEXT").unwrap().section("__text").unwrap().size,
            macho
                .segments
                .sections()
                .map(|s| s.collect::<Result<Vec<_>, _>>())
                .collect::<Result<Vec<_>, _>>()
                .unwrap()[0][0]
                .0
                .size
        );
    }
}

#[test]
fn fat_round_trip() {
    let x86 = x86_64();
    let arm = arm64();
    let data = universal(&[&x86, &arm]);

    let fat = FatBinary::parse(&data).unwrap();
    assert_eq!(fat.slices().len(), 2);
    assert_eq!(fat.serialize().unwrap(), data);

    match MachFile::parse(&data).unwrap() {
        MachFile::Fat(fat) => {
            let images = fat.slices().iter().map(|s| s.image.serialize().unwrap());
            assert_eq!(images.collect::<Vec<_>>(), vec![x86, arm]);
        }
        MachFile::Thin(_) => panic!("expected a universal binary"),
    }
}

#[test]
fn fat_growth_moves_following_slice() {
    let x86 = x86_64();
    let arm = arm64();
    let data = universal(&[&x86, &arm]);
    let growth = 0x5000usize;

    let mut fat = FatBinary::parse(&data).unwrap();
    let original_arm_offset = fat.slices()[1].arch.offset as usize;
    let align = fat.slices()[1].arch.alignment() as usize;
    {
        let image = &mut fat.slices_mut()[0].image;
        let linkedit = image.segment("__LINKEDIT").unwrap().clone();
        image
            .resize_segment("__LINKEDIT", linkedit.filesize + growth as u64, linkedit.vmsize * 2)
            .unwrap();
    }
    let written = fat.serialize().unwrap();

    let x86_offset = fat.slices()[0].arch.offset as usize;
    let original_padding = original_arm_offset - (x86_offset + x86.len());
    let first_end = x86_offset + x86.len() + growth;
    let arm_offset = align_up(first_end, align);
    assert!(arm_offset > original_arm_offset);

    // Slice growth plus the change in padding needed to realign what follows.
    assert_eq!(written.len(), arm_offset + arm.len());
    assert_eq!(
        written.len() + original_padding,
        data.len() + growth + (arm_offset - first_end)
    );

    // goblin is an independent reader of the rewritten header.
    let multi = match Mach::parse(&written).unwrap() {
        Mach::Fat(multi) => multi,
        Mach::Binary(_) => panic!("expected a universal binary"),
    };
    let arches = multi.arches().unwrap();
    assert_eq!(arches.len(), 2);
    assert_eq!(arches[0].size as usize, x86.len() + growth);
    assert_eq!(arches[1].offset as usize, arm_offset);
    assert_eq!(arches[1].offset as usize % align, 0);

    let arm_data = &written[arm_offset..arm_offset + arches[1].size as usize];
    assert_eq!(arm_data, arm.as_slice());
    MachO::parse(arm_data, 0).unwrap();

    let reparsed = FatBinary::parse(&written).unwrap();
    assert_eq!(reparsed.serialize().unwrap(), written);
}
