// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed load commands.
//!
//! Commands this crate needs to mutate are decoded into typed records.
//! Everything else is kept as opaque bytes. Bytes following the typed
//! portion of a command (e.g. build tool entries or alignment padding) are
//! retained so unmodified commands serialize identically.

use {
    crate::{
        error::MachOError,
        header::Ctx,
        segment::{Section, Segment},
    },
    goblin::mach::load_command::{
        LC_BUILD_VERSION, LC_CODE_SIGNATURE, LC_DATA_IN_CODE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY,
        LC_DYLIB_CODE_SIGN_DRS, LC_DYSYMTAB, LC_FUNCTION_STARTS, LC_LINKER_OPTIMIZATION_HINT,
        LC_SEGMENT, LC_SEGMENT_64, LC_SEGMENT_SPLIT_INFO, LC_SYMTAB, LC_VERSION_MIN_IPHONEOS,
        LC_VERSION_MIN_MACOSX, LC_VERSION_MIN_TVOS, LC_VERSION_MIN_WATCHOS,
    },
    scroll::{Pread, Pwrite},
};

pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x8000_0033;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x8000_0034;

pub const SIZEOF_LOAD_COMMAND_HEADER: usize = 8;
pub const SIZEOF_LINKEDIT_DATA_COMMAND: usize = 16;
const SIZEOF_SYMTAB_COMMAND: usize = 24;
const SIZEOF_DYSYMTAB_COMMAND: usize = 80;
const SIZEOF_DYLD_INFO_COMMAND: usize = 48;
const SIZEOF_BUILD_VERSION_COMMAND: usize = 24;
const SIZEOF_VERSION_MIN_COMMAND: usize = 16;

/// Whether a command is a `linkedit_data_command`.
pub fn is_linkedit_data_command(cmd: u32) -> bool {
    matches!(
        cmd,
        LC_CODE_SIGNATURE
            | LC_SEGMENT_SPLIT_INFO
            | LC_FUNCTION_STARTS
            | LC_DATA_IN_CODE
            | LC_DYLIB_CODE_SIGN_DRS
            | LC_LINKER_OPTIMIZATION_HINT
            | LC_DYLD_EXPORTS_TRIE
            | LC_DYLD_CHAINED_FIXUPS
    )
}

/// A `linkedit_data_command`, pointing at a blob in `__LINKEDIT`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LinkeditData {
    pub dataoff: u32,
    pub datasize: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Symtab {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

/// `dysymtab_command` fields after `cmd`/`cmdsize`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Dysymtab {
    pub fields: [u32; 18],
}

impl Dysymtab {
    /// Indices of fields holding file offsets.
    ///
    /// tocoff, modtaboff, extrefsymoff, indirectsymoff, extreloff, locreloff.
    pub const OFFSET_FIELDS: [usize; 6] = [6, 8, 10, 12, 14, 16];
}

/// `dyld_info_command` offset/size pairs (rebase, bind, weak bind, lazy bind, export).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DyldInfo {
    pub ranges: [(u32, u32); 5],
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BuildVersion {
    pub platform: u32,
    pub minos: u32,
    pub sdk: u32,
    pub ntools: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VersionMin {
    pub version: u32,
    pub sdk: u32,
}

/// Decoded body of a load command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoadCommandData {
    Segment(Segment),
    LinkeditData(LinkeditData),
    Symtab(Symtab),
    Dysymtab(Dysymtab),
    DyldInfo(DyldInfo),
    BuildVersion(BuildVersion),
    VersionMin(VersionMin),
    Other,
}

/// A single load command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadCommand {
    pub cmd: u32,
    pub data: LoadCommandData,
    /// Bytes between the typed portion of the command and `cmdsize`.
    pub trailing: Vec<u8>,
}

impl LoadCommand {
    /// Construct a `linkedit_data_command` of the given type.
    pub fn linkedit_data(cmd: u32, dataoff: u32, datasize: u32) -> Self {
        Self {
            cmd,
            data: LoadCommandData::LinkeditData(LinkeditData { dataoff, datasize }),
            trailing: vec![],
        }
    }

    /// Construct a segment command with the word size of `ctx`.
    pub fn segment(segment: Segment, ctx: Ctx) -> Self {
        Self {
            cmd: if ctx.is_64 { LC_SEGMENT_64 } else { LC_SEGMENT },
            data: LoadCommandData::Segment(segment),
            trailing: vec![],
        }
    }

    /// Parse a command from exactly `cmdsize` bytes.
    pub fn parse(data: &[u8], ctx: Ctx) -> Result<Self, MachOError> {
        let endian = ctx.endian;
        let cmd = data.pread_with::<u32>(0, endian)?;
        let mut cursor = SIZEOF_LOAD_COMMAND_HEADER;
        let offset = &mut cursor;

        let require = |size: usize| {
            if data.len() < size {
                Err(MachOError::malformed(format!(
                    "load command 0x{:x} has size {} smaller than its {} byte layout",
                    cmd,
                    data.len(),
                    size
                )))
            } else {
                Ok(())
            }
        };

        let body = match cmd {
            LC_SEGMENT | LC_SEGMENT_64 => {
                if (cmd == LC_SEGMENT_64) != ctx.is_64 {
                    return Err(MachOError::malformed(
                        "segment command word size does not match header",
                    ));
                }

                require(Segment::command_size(ctx, 0))?;
                let (mut segment, nsects) = Segment::parse_header(data, offset, ctx)?;
                require(Segment::command_size(ctx, nsects as usize))?;

                for _ in 0..nsects {
                    segment.sections.push(Section::parse(data, offset, ctx)?);
                }

                LoadCommandData::Segment(segment)
            }
            _ if is_linkedit_data_command(cmd) => {
                require(SIZEOF_LINKEDIT_DATA_COMMAND)?;
                LoadCommandData::LinkeditData(LinkeditData {
                    dataoff: data.gread_with(offset, endian)?,
                    datasize: data.gread_with(offset, endian)?,
                })
            }
            LC_SYMTAB => {
                require(SIZEOF_SYMTAB_COMMAND)?;
                LoadCommandData::Symtab(Symtab {
                    symoff: data.gread_with(offset, endian)?,
                    nsyms: data.gread_with(offset, endian)?,
                    stroff: data.gread_with(offset, endian)?,
                    strsize: data.gread_with(offset, endian)?,
                })
            }
            LC_DYSYMTAB => {
                require(SIZEOF_DYSYMTAB_COMMAND)?;
                let mut fields = [0u32; 18];
                for field in fields.iter_mut() {
                    *field = data.gread_with(offset, endian)?;
                }
                LoadCommandData::Dysymtab(Dysymtab { fields })
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                require(SIZEOF_DYLD_INFO_COMMAND)?;
                let mut ranges = [(0u32, 0u32); 5];
                for range in ranges.iter_mut() {
                    range.0 = data.gread_with(offset, endian)?;
                    range.1 = data.gread_with(offset, endian)?;
                }
                LoadCommandData::DyldInfo(DyldInfo { ranges })
            }
            LC_BUILD_VERSION => {
                require(SIZEOF_BUILD_VERSION_COMMAND)?;
                LoadCommandData::BuildVersion(BuildVersion {
                    platform: data.gread_with(offset, endian)?,
                    minos: data.gread_with(offset, endian)?,
                    sdk: data.gread_with(offset, endian)?,
                    ntools: data.gread_with(offset, endian)?,
                })
            }
            LC_VERSION_MIN_MACOSX
            | LC_VERSION_MIN_IPHONEOS
            | LC_VERSION_MIN_TVOS
            | LC_VERSION_MIN_WATCHOS => {
                require(SIZEOF_VERSION_MIN_COMMAND)?;
                LoadCommandData::VersionMin(VersionMin {
                    version: data.gread_with(offset, endian)?,
                    sdk: data.gread_with(offset, endian)?,
                })
            }
            _ => LoadCommandData::Other,
        };

        Ok(Self {
            cmd,
            data: body,
            trailing: data[*offset..].to_vec(),
        })
    }

    fn typed_size(&self, ctx: Ctx) -> usize {
        SIZEOF_LOAD_COMMAND_HEADER
            + match &self.data {
                LoadCommandData::Segment(segment) => {
                    Segment::command_size(ctx, segment.sections.len()) - SIZEOF_LOAD_COMMAND_HEADER
                }
                LoadCommandData::LinkeditData(_) => 8,
                LoadCommandData::Symtab(_) => 16,
                LoadCommandData::Dysymtab(_) => 72,
                LoadCommandData::DyldInfo(_) => 40,
                LoadCommandData::BuildVersion(_) => 16,
                LoadCommandData::VersionMin(_) => 8,
                LoadCommandData::Other => 0,
            }
    }

    /// The value written to `cmdsize`.
    pub fn cmdsize(&self, ctx: Ctx) -> usize {
        self.typed_size(ctx) + self.trailing.len()
    }

    /// Serialize this command.
    pub fn to_bytes(&self, ctx: Ctx) -> Result<Vec<u8>, MachOError> {
        let endian = ctx.endian;
        let size = self.cmdsize(ctx);
        let cmdsize = u32::try_from(size).map_err(|_| MachOError::InsufficientSpace)?;

        let mut buf = vec![0u8; size];
        let offset = &mut 0;
        buf.gwrite_with(self.cmd, offset, endian)?;
        buf.gwrite_with(cmdsize, offset, endian)?;

        match &self.data {
            LoadCommandData::Segment(segment) => {
                segment.write(&mut buf, offset, ctx)?;
            }
            LoadCommandData::LinkeditData(lc) => {
                buf.gwrite_with(lc.dataoff, offset, endian)?;
                buf.gwrite_with(lc.datasize, offset, endian)?;
            }
            LoadCommandData::Symtab(symtab) => {
                for value in [symtab.symoff, symtab.nsyms, symtab.stroff, symtab.strsize] {
                    buf.gwrite_with(value, offset, endian)?;
                }
            }
            LoadCommandData::Dysymtab(dysymtab) => {
                for value in dysymtab.fields {
                    buf.gwrite_with(value, offset, endian)?;
                }
            }
            LoadCommandData::DyldInfo(info) => {
                for (off, size) in info.ranges {
                    buf.gwrite_with(off, offset, endian)?;
                    buf.gwrite_with(size, offset, endian)?;
                }
            }
            LoadCommandData::BuildVersion(bv) => {
                for value in [bv.platform, bv.minos, bv.sdk, bv.ntools] {
                    buf.gwrite_with(value, offset, endian)?;
                }
            }
            LoadCommandData::VersionMin(vm) => {
                buf.gwrite_with(vm.version, offset, endian)?;
                buf.gwrite_with(vm.sdk, offset, endian)?;
            }
            LoadCommandData::Other => {}
        }

        buf[*offset..].copy_from_slice(&self.trailing);

        Ok(buf)
    }

    pub fn as_segment(&self) -> Option<&Segment> {
        match &self.data {
            LoadCommandData::Segment(segment) => Some(segment),
            _ => None,
        }
    }

    pub fn as_segment_mut(&mut self) -> Option<&mut Segment> {
        match &mut self.data {
            LoadCommandData::Segment(segment) => Some(segment),
            _ => None,
        }
    }

    pub fn as_linkedit_data(&self) -> Option<&LinkeditData> {
        match &self.data {
            LoadCommandData::LinkeditData(lc) => Some(lc),
            _ => None,
        }
    }

    /// Apply `shift` to every file offset in this command at or beyond `from`.
    ///
    /// Zero offsets denote absent data and are left alone.
    pub(crate) fn shift_file_offsets(
        &mut self,
        from: u64,
        shift: i64,
        ctx: Ctx,
    ) -> Result<(), MachOError> {
        let shift32 = |value: &mut u32| -> Result<(), MachOError> {
            if *value != 0 && *value as u64 >= from {
                *value = u32::try_from(apply_shift(*value as u64, shift)?)
                    .map_err(|_| MachOError::InsufficientSpace)?;
            }
            Ok(())
        };

        match &mut self.data {
            LoadCommandData::Segment(segment) => {
                if segment.filesize != 0 && segment.fileoff >= from {
                    segment.fileoff = apply_shift(segment.fileoff, shift)?;
                    if segment.fileoff > ctx.max_offset() {
                        return Err(MachOError::InsufficientSpace);
                    }
                }
                for section in segment.sections.iter_mut() {
                    shift32(&mut section.offset)?;
                    shift32(&mut section.reloff)?;
                }
            }
            LoadCommandData::LinkeditData(lc) => shift32(&mut lc.dataoff)?,
            LoadCommandData::Symtab(symtab) => {
                shift32(&mut symtab.symoff)?;
                shift32(&mut symtab.stroff)?;
            }
            LoadCommandData::Dysymtab(dysymtab) => {
                for index in Dysymtab::OFFSET_FIELDS {
                    shift32(&mut dysymtab.fields[index])?;
                }
            }
            LoadCommandData::DyldInfo(info) => {
                for (off, _) in info.ranges.iter_mut() {
                    shift32(off)?;
                }
            }
            LoadCommandData::BuildVersion(_)
            | LoadCommandData::VersionMin(_)
            | LoadCommandData::Other => {}
        }

        Ok(())
    }
}

fn apply_shift(value: u64, shift: i64) -> Result<u64, MachOError> {
    if shift >= 0 {
        value
            .checked_add(shift as u64)
            .ok_or(MachOError::InsufficientSpace)
    } else {
        value
            .checked_sub(shift.unsigned_abs())
            .ok_or_else(|| MachOError::malformed("file offset shifted below zero"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LE64: Ctx = Ctx {
        endian: scroll::LE,
        is_64: true,
    };
    const BE32: Ctx = Ctx {
        endian: scroll::BE,
        is_64: false,
    };

    #[test]
    fn linkedit_data_layout() {
        let lc = LoadCommand::linkedit_data(LC_CODE_SIGNATURE, 0x4000, 0x220);
        let bytes = lc.to_bytes(LE64).unwrap();
        assert_eq!(bytes.len(), SIZEOF_LINKEDIT_DATA_COMMAND);
        assert_eq!(
            bytes,
            vec![0x1d, 0, 0, 0, 16, 0, 0, 0, 0, 0x40, 0, 0, 0x20, 0x02, 0, 0]
        );
        assert_eq!(LoadCommand::parse(&bytes, LE64).unwrap(), lc);
    }

    #[test]
    fn unknown_command_preserved() {
        // LC_UUID with a fixed payload.
        let mut bytes = vec![0, 0, 0, 0x1b, 0, 0, 0, 24];
        bytes.extend(1u8..=16);

        let lc = LoadCommand::parse(&bytes, BE32).unwrap();
        assert_eq!(lc.data, LoadCommandData::Other);
        assert_eq!(lc.cmdsize(BE32), 24);
        assert_eq!(lc.to_bytes(BE32).unwrap(), bytes);
    }

    #[test]
    fn truncated_typed_command() {
        let bytes = vec![0x1d, 0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            LoadCommand::parse(&bytes, LE64),
            Err(MachOError::MalformedBinary(_))
        ));
    }

    #[test]
    fn shift_ignores_absent_offsets() {
        let mut lc = LoadCommand {
            cmd: LC_SYMTAB,
            data: LoadCommandData::Symtab(Symtab {
                symoff: 0,
                nsyms: 0,
                stroff: 0x5000,
                strsize: 32,
            }),
            trailing: vec![],
        };

        lc.shift_file_offsets(0x4000, 0x100, LE64).unwrap();
        assert_eq!(
            lc.data,
            LoadCommandData::Symtab(Symtab {
                symoff: 0,
                nsyms: 0,
                stroff: 0x5100,
                strsize: 32,
            })
        );
    }
}
