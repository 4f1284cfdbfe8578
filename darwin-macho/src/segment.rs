// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Segments and sections.
//!
//! 32 and 64-bit variants share one representation. Addresses and sizes are
//! widened to `u64` on read and checked against the image's word size on
//! write.

use {
    crate::{error::MachOError, header::Ctx, load_command::SIZEOF_LOAD_COMMAND_HEADER},
    scroll::{Pread, Pwrite},
};

pub const SIZEOF_SEGMENT_COMMAND_32: usize = 56;
pub const SIZEOF_SEGMENT_COMMAND_64: usize = 72;
pub const SIZEOF_SECTION_32: usize = 68;
pub const SIZEOF_SECTION_64: usize = 80;

const SECTION_TYPE: u32 = 0xff;
const S_ZEROFILL: u32 = 0x1;
const S_GB_ZEROFILL: u32 = 0xc;
const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;

/// Convert a fixed size, NUL padded name to a string.
pub fn name_to_str(name: &[u8; 16]) -> &str {
    let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
    std::str::from_utf8(&name[..end]).unwrap_or("<invalid>")
}

/// Convert a string into a fixed size, NUL padded name. Truncates at 16 bytes.
pub fn str_to_name(s: &str) -> [u8; 16] {
    let mut name = [0u8; 16];
    let len = s.len().min(16);
    name[..len].copy_from_slice(&s.as_bytes()[..len]);
    name
}

fn read_name(data: &[u8], offset: &mut usize) -> Result<[u8; 16], MachOError> {
    let mut name = [0u8; 16];
    let source = data
        .get(*offset..*offset + name.len())
        .ok_or_else(|| MachOError::malformed("name extends past end of command"))?;
    name.copy_from_slice(source);
    *offset += name.len();

    Ok(name)
}

fn write_name(data: &mut [u8], offset: &mut usize, name: &[u8; 16]) -> Result<(), MachOError> {
    let dest = data
        .get_mut(*offset..*offset + name.len())
        .ok_or(MachOError::WriteOutOfBounds(*offset, name.len()))?;
    dest.copy_from_slice(name);
    *offset += name.len();

    Ok(())
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Section {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    /// Only present in 64-bit sections.
    pub reserved3: u32,
}

impl Section {
    pub fn size_for(ctx: Ctx) -> usize {
        if ctx.is_64 {
            SIZEOF_SECTION_64
        } else {
            SIZEOF_SECTION_32
        }
    }

    pub(crate) fn parse(data: &[u8], offset: &mut usize, ctx: Ctx) -> Result<Self, MachOError> {
        let endian = ctx.endian;

        let mut section = Self {
            sectname: read_name(data, offset)?,
            segname: read_name(data, offset)?,
            addr: ctx.read_word(data, offset)?,
            size: ctx.read_word(data, offset)?,
            offset: data.gread_with(offset, endian)?,
            align: data.gread_with(offset, endian)?,
            reloff: data.gread_with(offset, endian)?,
            nreloc: data.gread_with(offset, endian)?,
            flags: data.gread_with(offset, endian)?,
            reserved1: data.gread_with(offset, endian)?,
            reserved2: data.gread_with(offset, endian)?,
            reserved3: 0,
        };

        if ctx.is_64 {
            section.reserved3 = data.gread_with(offset, endian)?;
        }

        Ok(section)
    }

    pub(crate) fn write(
        &self,
        data: &mut [u8],
        offset: &mut usize,
        ctx: Ctx,
    ) -> Result<(), MachOError> {
        let endian = ctx.endian;

        write_name(data, offset, &self.sectname)?;
        write_name(data, offset, &self.segname)?;
        ctx.write_word(data, offset, self.addr)?;
        ctx.write_word(data, offset, self.size)?;
        for value in [
            self.offset,
            self.align,
            self.reloff,
            self.nreloc,
            self.flags,
            self.reserved1,
            self.reserved2,
        ] {
            data.gwrite_with(value, offset, endian)?;
        }
        if ctx.is_64 {
            data.gwrite_with(self.reserved3, offset, endian)?;
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        name_to_str(&self.sectname)
    }

    /// Whether the section occupies no file data.
    pub fn is_zerofill(&self) -> bool {
        matches!(
            self.flags & SECTION_TYPE,
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
        )
    }

    /// The file range of section data, if it has any.
    pub fn file_range(&self) -> Option<(u64, u64)> {
        if self.is_zerofill() || self.offset == 0 || self.size == 0 {
            None
        } else {
            Some((self.offset as u64, self.offset as u64 + self.size))
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl Segment {
    /// Size of a segment command holding `nsects` sections.
    pub fn command_size(ctx: Ctx, nsects: usize) -> usize {
        let header = if ctx.is_64 {
            SIZEOF_SEGMENT_COMMAND_64
        } else {
            SIZEOF_SEGMENT_COMMAND_32
        };

        header + nsects * Section::size_for(ctx)
    }

    /// Parse segment fields following `cmd`/`cmdsize`. Returns the declared section count.
    pub(crate) fn parse_header(
        data: &[u8],
        offset: &mut usize,
        ctx: Ctx,
    ) -> Result<(Self, u32), MachOError> {
        let endian = ctx.endian;

        let segment = Self {
            segname: read_name(data, offset)?,
            vmaddr: ctx.read_word(data, offset)?,
            vmsize: ctx.read_word(data, offset)?,
            fileoff: ctx.read_word(data, offset)?,
            filesize: ctx.read_word(data, offset)?,
            maxprot: data.gread_with(offset, endian)?,
            initprot: data.gread_with(offset, endian)?,
            flags: 0,
            sections: vec![],
        };
        let nsects = data.gread_with::<u32>(offset, endian)?;
        let flags = data.gread_with::<u32>(offset, endian)?;

        Ok((Self { flags, ..segment }, nsects))
    }

    /// Write segment fields and sections following `cmd`/`cmdsize`.
    pub(crate) fn write(
        &self,
        data: &mut [u8],
        offset: &mut usize,
        ctx: Ctx,
    ) -> Result<(), MachOError> {
        let endian = ctx.endian;
        debug_assert!(*offset == SIZEOF_LOAD_COMMAND_HEADER);

        write_name(data, offset, &self.segname)?;
        ctx.write_word(data, offset, self.vmaddr)?;
        ctx.write_word(data, offset, self.vmsize)?;
        ctx.write_word(data, offset, self.fileoff)?;
        ctx.write_word(data, offset, self.filesize)?;
        data.gwrite_with(self.maxprot, offset, endian)?;
        data.gwrite_with(self.initprot, offset, endian)?;
        data.gwrite_with(self.sections.len() as u32, offset, endian)?;
        data.gwrite_with(self.flags, offset, endian)?;

        for section in &self.sections {
            section.write(data, offset, ctx)?;
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        name_to_str(&self.segname)
    }

    pub fn file_end(&self) -> u64 {
        self.fileoff + self.filesize
    }

    pub fn vm_end(&self) -> u64 {
        self.vmaddr + self.vmsize
    }

    /// Locate a section by name.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        let name = str_to_name("__LINKEDIT");
        assert_eq!(&name[..10], b"__LINKEDIT");
        assert_eq!(name[10], 0);
        assert_eq!(name_to_str(&name), "__LINKEDIT");
        assert_eq!(name_to_str(&str_to_name("0123456789abcdefXYZ")), "0123456789abcdef");
    }

    #[test]
    fn command_sizes() {
        let ctx32 = Ctx {
            endian: scroll::LE,
            is_64: false,
        };
        let ctx64 = Ctx {
            endian: scroll::LE,
            is_64: true,
        };

        assert_eq!(Segment::command_size(ctx32, 2), 56 + 2 * 68);
        assert_eq!(Segment::command_size(ctx64, 1), 72 + 80);
    }

    #[test]
    fn zerofill_sections_have_no_file_range() {
        let section = Section {
            sectname: str_to_name("__bss"),
            offset: 0,
            size: 0x100,
            flags: S_ZEROFILL,
            ..Default::default()
        };
        assert!(section.is_zerofill());
        assert!(section.file_range().is_none());
    }
}
