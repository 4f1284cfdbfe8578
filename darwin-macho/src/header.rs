// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O header and byte order handling.

use {
    crate::error::MachOError,
    goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64},
    scroll::{Endian, Pread, Pwrite},
};

pub const SIZEOF_MACH_HEADER: usize = 28;
pub const SIZEOF_MACH_HEADER_64: usize = 32;

/// Byte order and word size of a single Mach-O image.
///
/// Derived from the header magic and applied to every subsequent read and
/// write of the image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ctx {
    pub endian: Endian,
    pub is_64: bool,
}

impl Ctx {
    /// Resolve the context from the first 4 bytes of an image.
    pub fn from_magic(data: &[u8]) -> Result<Self, MachOError> {
        if data.len() < 4 {
            return Err(MachOError::malformed("data too short for Mach-O magic"));
        }

        // Magic constants are defined in the native order of the file, so
        // reading big endian tells us how the file was written.
        let magic = data.pread_with::<u32>(0, scroll::BE)?;

        match magic {
            MH_MAGIC => Ok(Self {
                endian: scroll::BE,
                is_64: false,
            }),
            MH_MAGIC_64 => Ok(Self {
                endian: scroll::BE,
                is_64: true,
            }),
            MH_CIGAM => Ok(Self {
                endian: scroll::LE,
                is_64: false,
            }),
            MH_CIGAM_64 => Ok(Self {
                endian: scroll::LE,
                is_64: true,
            }),
            _ => Err(MachOError::malformed(format!(
                "unrecognized magic 0x{:08x}",
                magic
            ))),
        }
    }

    pub fn header_size(&self) -> usize {
        if self.is_64 {
            SIZEOF_MACH_HEADER_64
        } else {
            SIZEOF_MACH_HEADER
        }
    }

    /// Size in bytes of address and file offset fields in segments.
    pub fn word_size(&self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    pub(crate) fn read_word(&self, data: &[u8], offset: &mut usize) -> Result<u64, MachOError> {
        Ok(if self.is_64 {
            data.gread_with::<u64>(offset, self.endian)?
        } else {
            data.gread_with::<u32>(offset, self.endian)? as u64
        })
    }

    pub(crate) fn write_word(
        &self,
        data: &mut [u8],
        offset: &mut usize,
        value: u64,
    ) -> Result<(), MachOError> {
        if self.is_64 {
            data.gwrite_with(value, offset, self.endian)?;
        } else {
            let value = u32::try_from(value).map_err(|_| MachOError::InsufficientSpace)?;
            data.gwrite_with(value, offset, self.endian)?;
        }

        Ok(())
    }

    /// Largest file offset representable in segment fields.
    pub fn max_offset(&self) -> u64 {
        if self.is_64 {
            u64::MAX
        } else {
            u32::MAX as u64
        }
    }
}

/// The Mach-O header.
///
/// `magic` is stored as read with the image's byte order, so it is always
/// `MH_MAGIC` or `MH_MAGIC_64`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MachHeader {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    /// Only present in 64-bit headers.
    pub reserved: u32,
}

impl MachHeader {
    pub fn parse(data: &[u8], ctx: Ctx) -> Result<Self, MachOError> {
        if data.len() < ctx.header_size() {
            return Err(MachOError::malformed("data too short for Mach-O header"));
        }

        let offset = &mut 0;
        let mut header = Self {
            magic: data.gread_with(offset, ctx.endian)?,
            cputype: data.gread_with(offset, ctx.endian)?,
            cpusubtype: data.gread_with(offset, ctx.endian)?,
            filetype: data.gread_with(offset, ctx.endian)?,
            ncmds: data.gread_with(offset, ctx.endian)?,
            sizeofcmds: data.gread_with(offset, ctx.endian)?,
            flags: data.gread_with(offset, ctx.endian)?,
            reserved: 0,
        };

        if ctx.is_64 {
            header.reserved = data.gread_with(offset, ctx.endian)?;
        }

        Ok(header)
    }

    pub fn write(&self, data: &mut [u8], ctx: Ctx) -> Result<(), MachOError> {
        let offset = &mut 0;
        data.gwrite_with(self.magic, offset, ctx.endian)?;
        data.gwrite_with(self.cputype, offset, ctx.endian)?;
        data.gwrite_with(self.cpusubtype, offset, ctx.endian)?;
        data.gwrite_with(self.filetype, offset, ctx.endian)?;
        data.gwrite_with(self.ncmds, offset, ctx.endian)?;
        data.gwrite_with(self.sizeofcmds, offset, ctx.endian)?;
        data.gwrite_with(self.flags, offset, ctx.endian)?;
        if ctx.is_64 {
            data.gwrite_with(self.reserved, offset, ctx.endian)?;
        }

        Ok(())
    }

    /// Human readable architecture name, if known.
    pub fn arch_name(&self) -> Option<&'static str> {
        // The high byte of the subtype carries capability bits.
        goblin::mach::cputype::get_arch_name_from_types(self.cputype, self.cpusubtype & 0x00ff_ffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_resolution() {
        let ctx = Ctx::from_magic(&[0xcf, 0xfa, 0xed, 0xfe]).unwrap();
        assert_eq!(ctx.endian, scroll::LE);
        assert!(ctx.is_64);

        let ctx = Ctx::from_magic(&[0xfe, 0xed, 0xfa, 0xce]).unwrap();
        assert_eq!(ctx.endian, scroll::BE);
        assert!(!ctx.is_64);

        assert!(matches!(
            Ctx::from_magic(b"\x7fELF"),
            Err(MachOError::MalformedBinary(_))
        ));
        assert!(matches!(
            Ctx::from_magic(&[0xcf, 0xfa]),
            Err(MachOError::MalformedBinary(_))
        ));
    }

    #[test]
    fn header_roundtrip() {
        let ctx = Ctx {
            endian: scroll::BE,
            is_64: false,
        };
        let header = MachHeader {
            magic: MH_MAGIC,
            cputype: 18,
            cpusubtype: 0,
            filetype: 2,
            ncmds: 3,
            sizeofcmds: 200,
            flags: 0x85,
            reserved: 0,
        };

        let mut buf = vec![0u8; ctx.header_size()];
        header.write(&mut buf, ctx).unwrap();
        assert_eq!(&buf[0..4], &[0xfe, 0xed, 0xfa, 0xce]);
        assert_eq!(MachHeader::parse(&buf, ctx).unwrap(), header);
    }

    #[test]
    fn narrow_word_overflow() {
        let ctx = Ctx {
            endian: scroll::LE,
            is_64: false,
        };
        let mut buf = [0u8; 4];
        assert!(matches!(
            ctx.write_word(&mut buf, &mut 0, u32::MAX as u64 + 1),
            Err(MachOError::InsufficientSpace)
        ));
    }
}
