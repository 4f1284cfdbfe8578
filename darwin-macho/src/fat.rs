// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Universal (fat) binaries.

use {
    crate::{error::MachOError, image::MachOImage},
    goblin::mach::fat::{FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER},
    log::debug,
    scroll::{Pread, Pwrite},
};

/// Magic of fat headers with 64-bit offsets and sizes.
pub const FAT_MAGIC_64: u32 = 0xcafe_babf;
pub const SIZEOF_FAT_ARCH_64: usize = 32;

/// Upper bound on architectures, rejecting other formats sharing `FAT_MAGIC`.
const MAX_FAT_ARCHES: u32 = 128;

fn align_up(value: u64, align: u64) -> u64 {
    match value % align {
        0 => value,
        rem => value + (align - rem),
    }
}

/// An entry in the fat header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u64,
    pub size: u64,
    /// Power of 2 alignment of the slice.
    pub align: u32,
    /// Only present in 64-bit fat headers.
    pub reserved: u32,
}

impl FatArch {
    pub fn alignment(&self) -> u64 {
        1u64 << self.align
    }
}

/// A single architecture within a [FatBinary].
#[derive(Clone, Debug)]
pub struct FatSlice {
    pub arch: FatArch,
    pub image: MachOImage,
}

/// A universal binary holding several Mach-O images.
#[derive(Clone, Debug)]
pub struct FatBinary {
    is_64: bool,
    slices: Vec<FatSlice>,
    /// The original bytes, for preserving padding between slices.
    data: Vec<u8>,
}

impl FatBinary {
    /// Whether data begins with a fat magic.
    pub fn is_fat(data: &[u8]) -> bool {
        matches!(
            data.pread_with::<u32>(0, scroll::BE),
            Ok(FAT_MAGIC) | Ok(FAT_MAGIC_64)
        )
    }

    pub fn parse(data: &[u8]) -> Result<Self, MachOError> {
        if data.len() < SIZEOF_FAT_HEADER {
            return Err(MachOError::malformed("data too short for fat header"));
        }

        let offset = &mut 0;
        let magic = data.gread_with::<u32>(offset, scroll::BE)?;
        let is_64 = match magic {
            FAT_MAGIC => false,
            FAT_MAGIC_64 => true,
            _ => {
                return Err(MachOError::malformed(format!(
                    "unrecognized fat magic 0x{:08x}",
                    magic
                )))
            }
        };
        let nfat_arch = data.gread_with::<u32>(offset, scroll::BE)?;

        let entry_size = if is_64 {
            SIZEOF_FAT_ARCH_64
        } else {
            SIZEOF_FAT_ARCH
        };
        let header_end = SIZEOF_FAT_HEADER + nfat_arch as usize * entry_size;
        if nfat_arch > MAX_FAT_ARCHES || header_end > data.len() {
            return Err(MachOError::malformed(format!(
                "fat header declares {} architectures which do not fit",
                nfat_arch
            )));
        }

        let mut arches = Vec::with_capacity(nfat_arch as usize);
        for _ in 0..nfat_arch {
            let mut arch = FatArch {
                cputype: data.gread_with(offset, scroll::BE)?,
                cpusubtype: data.gread_with(offset, scroll::BE)?,
                ..Default::default()
            };
            if is_64 {
                arch.offset = data.gread_with(offset, scroll::BE)?;
                arch.size = data.gread_with(offset, scroll::BE)?;
                arch.align = data.gread_with(offset, scroll::BE)?;
                arch.reserved = data.gread_with(offset, scroll::BE)?;
            } else {
                arch.offset = data.gread_with::<u32>(offset, scroll::BE)? as u64;
                arch.size = data.gread_with::<u32>(offset, scroll::BE)? as u64;
                arch.align = data.gread_with(offset, scroll::BE)?;
            }

            if arch.align > 31 {
                return Err(MachOError::malformed(format!(
                    "fat slice alignment 2^{} is unsupported",
                    arch.align
                )));
            }
            if arch.offset < header_end as u64 || arch.offset % arch.alignment() != 0 {
                return Err(MachOError::malformed(format!(
                    "fat slice offset {} is invalid",
                    arch.offset
                )));
            }
            if arch
                .offset
                .checked_add(arch.size)
                .map_or(true, |end| end > data.len() as u64)
            {
                return Err(MachOError::malformed(
                    "fat slice extends past end of data",
                ));
            }

            arches.push(arch);
        }

        let mut sorted = arches.clone();
        sorted.sort_by_key(|arch| arch.offset);
        for pair in sorted.windows(2) {
            if pair[0].offset + pair[0].size > pair[1].offset {
                return Err(MachOError::malformed("fat slices overlap"));
            }
        }

        let slices = arches
            .into_iter()
            .map(|arch| {
                let start = arch.offset as usize;
                let image = MachOImage::parse(&data[start..start + arch.size as usize])?;

                Ok(FatSlice { arch, image })
            })
            .collect::<Result<Vec<_>, MachOError>>()?;

        Ok(Self {
            is_64,
            slices,
            data: data.to_vec(),
        })
    }

    /// Whether the fat header uses 64-bit offsets.
    pub fn is_64(&self) -> bool {
        self.is_64
    }

    pub fn slices(&self) -> &[FatSlice] {
        &self.slices
    }

    pub fn slices_mut(&mut self) -> &mut [FatSlice] {
        &mut self.slices
    }

    fn entry_size(&self) -> usize {
        if self.is_64 {
            SIZEOF_FAT_ARCH_64
        } else {
            SIZEOF_FAT_ARCH
        }
    }

    /// Serialize the universal binary.
    ///
    /// Slices are laid out in their original file order. A slice keeps its
    /// offset unless the preceding slice grew into it, in which case it moves
    /// to the next boundary of its alignment. Padding is copied from the
    /// original data wherever the layout around it is unchanged.
    pub fn serialize(&self) -> Result<Vec<u8>, MachOError> {
        let header_end = SIZEOF_FAT_HEADER + self.slices.len() * self.entry_size();

        let mut order = (0..self.slices.len()).collect::<Vec<_>>();
        order.sort_by_key(|i| self.slices[*i].arch.offset);

        let mut out = vec![0u8; header_end];
        let mut arches = self
            .slices
            .iter()
            .map(|slice| slice.arch)
            .collect::<Vec<_>>();
        let mut original_end = header_end as u64;

        for index in order {
            let slice = &self.slices[index];
            let data = slice.image.serialize()?;

            let offset = slice
                .arch
                .offset
                .max(align_up(out.len() as u64, slice.arch.alignment()));

            if offset == slice.arch.offset && out.len() as u64 == original_end {
                out.extend_from_slice(&self.data[original_end as usize..offset as usize]);
            } else {
                out.resize(offset as usize, 0);
            }

            if offset != slice.arch.offset {
                debug!(
                    "moving fat slice {} from offset {} to {}",
                    index, slice.arch.offset, offset
                );
            }

            original_end = slice.arch.offset + slice.arch.size;
            out.extend_from_slice(&data);

            arches[index].offset = offset;
            arches[index].size = data.len() as u64;
        }

        if out.len() as u64 == original_end {
            out.extend_from_slice(&self.data[original_end as usize..]);
        }

        let magic = if self.is_64 { FAT_MAGIC_64 } else { FAT_MAGIC };
        let cursor = &mut 0;
        out.gwrite_with(magic, cursor, scroll::BE)?;
        out.gwrite_with(arches.len() as u32, cursor, scroll::BE)?;
        for arch in arches {
            out.gwrite_with(arch.cputype, cursor, scroll::BE)?;
            out.gwrite_with(arch.cpusubtype, cursor, scroll::BE)?;
            if self.is_64 {
                out.gwrite_with(arch.offset, cursor, scroll::BE)?;
                out.gwrite_with(arch.size, cursor, scroll::BE)?;
                out.gwrite_with(arch.align, cursor, scroll::BE)?;
                out.gwrite_with(arch.reserved, cursor, scroll::BE)?;
            } else {
                let narrow =
                    |v: u64| u32::try_from(v).map_err(|_| MachOError::InsufficientSpace);
                out.gwrite_with(narrow(arch.offset)?, cursor, scroll::BE)?;
                out.gwrite_with(narrow(arch.size)?, cursor, scroll::BE)?;
                out.gwrite_with(arch.align, cursor, scroll::BE)?;
            }
        }

        Ok(out)
    }
}

/// A parsed Mach-O file, either thin or universal.
#[derive(Clone, Debug)]
pub enum MachFile {
    Thin(MachOImage),
    Fat(FatBinary),
}

impl MachFile {
    pub fn parse(data: &[u8]) -> Result<Self, MachOError> {
        if FatBinary::is_fat(data) {
            Ok(Self::Fat(FatBinary::parse(data)?))
        } else {
            Ok(Self::Thin(MachOImage::parse(data)?))
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, MachOError> {
        match self {
            Self::Thin(image) => image.serialize(),
            Self::Fat(fat) => fat.serialize(),
        }
    }

    /// All images in the file, in header order.
    pub fn images(&self) -> Vec<&MachOImage> {
        match self {
            Self::Thin(image) => vec![image],
            Self::Fat(fat) => fat.slices.iter().map(|s| &s.image).collect(),
        }
    }
}
