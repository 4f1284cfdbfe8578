// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembling universal binaries from thin images.

use {
    crate::{
        error::MachOError,
        fat::{FatArch, MachFile},
        image::MachOImage,
    },
    goblin::mach::fat::{FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER},
    scroll::{IOwrite, Pwrite},
    std::io::Write,
};

/// Slices are aligned to 16k, the page size of aarch64.
const ALIGN_VALUE: u32 = 14;

/// Interface for constructing a universal Mach-O binary.
#[derive(Clone, Default)]
pub struct UniversalBinaryBuilder {
    binaries: Vec<Vec<u8>>,
}

impl UniversalBinaryBuilder {
    /// Add a thin or universal binary. Returns the number of images added.
    pub fn add_binary(&mut self, data: impl AsRef<[u8]>) -> Result<usize, MachOError> {
        let data = data.as_ref();

        match MachFile::parse(data)? {
            MachFile::Thin(_) => {
                self.binaries.push(data.to_vec());
                Ok(1)
            }
            MachFile::Fat(fat) => {
                for slice in fat.slices() {
                    self.binaries.push(slice.image.serialize()?);
                }

                Ok(fat.slices().len())
            }
        }
    }

    /// Write a universal Mach-O to the given writer.
    pub fn write(&self, writer: &mut impl Write) -> Result<(), MachOError> {
        create_universal_macho(writer, self.binaries.iter().map(|x| x.as_slice()))
    }
}

/// Create a universal mach-o binary from existing thin mach-o binaries.
///
/// Because the size of the individual Mach-O binaries must be written into a
/// header, all content is buffered internally.
pub fn create_universal_macho<'a>(
    writer: &mut impl Write,
    binaries: impl Iterator<Item = &'a [u8]>,
) -> Result<(), MachOError> {
    let align = 2u64.pow(ALIGN_VALUE);

    let mut records = vec![];
    let mut offset = align;

    for binary in binaries {
        let image = MachOImage::parse(binary)?;

        // This will be 0 for the 1st binary.
        let pad_bytes = match offset % align {
            0 => 0,
            x => align - x,
        };

        offset += pad_bytes;

        let arch = FatArch {
            cputype: image.header().cputype,
            cpusubtype: image.header().cpusubtype,
            offset,
            size: binary.len() as u64,
            align: ALIGN_VALUE,
            reserved: 0,
        };

        offset += arch.size;

        records.push((arch, pad_bytes as usize, binary));
    }

    if offset > u32::MAX as u64 {
        return Err(MachOError::InsufficientSpace);
    }

    let header_size = SIZEOF_FAT_HEADER + records.len() * SIZEOF_FAT_ARCH;
    if header_size as u64 > align {
        return Err(MachOError::TooManyArchitectures);
    }

    writer.iowrite_with(FAT_MAGIC, scroll::BE)?;
    writer.iowrite_with(records.len() as u32, scroll::BE)?;

    for (arch, _, _) in &records {
        let mut buffer = [0u8; SIZEOF_FAT_ARCH];
        let cursor = &mut 0;
        buffer.gwrite_with(arch.cputype, cursor, scroll::BE)?;
        buffer.gwrite_with(arch.cpusubtype, cursor, scroll::BE)?;
        buffer.gwrite_with(arch.offset as u32, cursor, scroll::BE)?;
        buffer.gwrite_with(arch.size as u32, cursor, scroll::BE)?;
        buffer.gwrite_with(arch.align, cursor, scroll::BE)?;
        writer.write_all(&buffer)?;
    }

    // Pad NULL until first mach-o binary.
    writer.write_all(&b"\0".repeat(align as usize - header_size))?;

    for (_, pad_bytes, macho_data) in records {
        writer.write_all(&b"\0".repeat(pad_bytes))?;
        writer.write_all(macho_data)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testing::SyntheticImage};

    #[test]
    fn builder_flattens_universal_inputs() {
        let x86 = SyntheticImage::default().build();
        let arm = SyntheticImage::arm64().build();

        let mut inner = vec![];
        create_universal_macho(&mut inner, [x86.as_slice()].into_iter()).unwrap();

        let mut builder = UniversalBinaryBuilder::default();
        assert_eq!(builder.add_binary(&inner).unwrap(), 1);
        assert_eq!(builder.add_binary(&arm).unwrap(), 1);

        let mut out = vec![];
        builder.write(&mut out).unwrap();

        let file = MachFile::parse(&out).unwrap();
        let images = file.images();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].serialize().unwrap(), x86);
        assert_eq!(images[1].serialize().unwrap(), arm);
    }

    #[test]
    fn rejects_non_macho() {
        let mut out = vec![];
        assert!(matches!(
            create_universal_macho(&mut out, [&b"garbage data"[..]].into_iter()),
            Err(MachOError::MalformedBinary(_))
        ));
    }
}
