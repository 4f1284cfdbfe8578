// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single architecture Mach-O images.

use {
    crate::{
        error::MachOError,
        header::{Ctx, MachHeader},
        load_command::{
            LinkeditData, LoadCommand, LoadCommandData, SIZEOF_LOAD_COMMAND_HEADER,
        },
        segment::{Section, Segment},
    },
    goblin::mach::load_command::{
        LC_CODE_SIGNATURE, LC_VERSION_MIN_IPHONEOS, LC_VERSION_MIN_MACOSX, LC_VERSION_MIN_TVOS,
        LC_VERSION_MIN_WATCHOS,
    },
    log::debug,
    scroll::Pread,
};

/// Operating system platform a binary targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    MacOs,
    IOs,
    TvOs,
    WatchOs,
    BridgeOs,
    MacCatalyst,
    IOsSimulator,
    TvOsSimulator,
    WatchOsSimulator,
    DriverKit,
    Unknown(u32),
}

impl From<u32> for Platform {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::MacOs,
            2 => Self::IOs,
            3 => Self::TvOs,
            4 => Self::WatchOs,
            5 => Self::BridgeOs,
            6 => Self::MacCatalyst,
            7 => Self::IOsSimulator,
            8 => Self::TvOsSimulator,
            9 => Self::WatchOsSimulator,
            10 => Self::DriverKit,
            _ => Self::Unknown(v),
        }
    }
}

/// Targeting settings of a Mach-O binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachoTarget {
    pub platform: Platform,
    pub minimum_os_version: semver::Version,
    pub sdk_version: semver::Version,
}

/// Parse a version number packed as `xxxx.yy.zz` nibbles.
pub fn parse_version_nibbles(v: u32) -> semver::Version {
    let major = v >> 16;
    let minor = (v >> 8) & 0xff;
    let patch = v & 0xff;

    semver::Version::new(major as _, minor as _, patch as _)
}

/// A single architecture Mach-O binary.
///
/// The image owns its bytes. Load commands are held decoded and written back
/// into the load command area on [MachOImage::serialize]; everything else
/// is read and written in place.
#[derive(Clone, Debug)]
pub struct MachOImage {
    ctx: Ctx,
    header: MachHeader,
    load_commands: Vec<LoadCommand>,
    data: Vec<u8>,
    /// End of the load command area when the image was parsed.
    ///
    /// Bytes up to here may hold stale commands and are zeroed on write.
    commands_high_water: usize,
}

impl MachOImage {
    /// Parse a thin Mach-O image.
    pub fn parse(data: &[u8]) -> Result<Self, MachOError> {
        let ctx = Ctx::from_magic(data)?;
        let header = MachHeader::parse(data, ctx)?;

        let start = ctx.header_size();
        let end = start
            .checked_add(header.sizeofcmds as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| MachOError::malformed("load commands extend past end of data"))?;

        let mut load_commands = vec![];
        let mut offset = start;

        for index in 0..header.ncmds {
            if offset + SIZEOF_LOAD_COMMAND_HEADER > end {
                return Err(MachOError::malformed(format!(
                    "load command {} begins beyond sizeofcmds",
                    index
                )));
            }

            let cmdsize = data.pread_with::<u32>(offset + 4, ctx.endian)? as usize;

            if cmdsize < SIZEOF_LOAD_COMMAND_HEADER || cmdsize % 4 != 0 {
                return Err(MachOError::malformed(format!(
                    "load command {} has invalid size {}",
                    index, cmdsize
                )));
            }
            if cmdsize > end - offset {
                return Err(MachOError::malformed(format!(
                    "load command {} extends beyond sizeofcmds",
                    index
                )));
            }

            load_commands.push(LoadCommand::parse(&data[offset..offset + cmdsize], ctx)?);
            offset += cmdsize;
        }

        if offset != end {
            return Err(MachOError::malformed(format!(
                "load commands occupy {} bytes but sizeofcmds is {}",
                offset - start,
                header.sizeofcmds
            )));
        }

        let image = Self {
            ctx,
            header,
            load_commands,
            data: data.to_vec(),
            commands_high_water: end,
        };

        image.validate()?;

        Ok(image)
    }

    /// Verify that all file ranges referenced by load commands lie within the data.
    fn validate(&self) -> Result<(), MachOError> {
        let len = self.data.len() as u64;
        let within = |start: u64, size: u64| start.checked_add(size).map_or(false, |end| end <= len);

        let mut ranges = vec![];

        for lc in &self.load_commands {
            match &lc.data {
                LoadCommandData::Segment(segment) => {
                    if !within(segment.fileoff, segment.filesize) {
                        return Err(MachOError::malformed(format!(
                            "segment {} file range exceeds data",
                            segment.name()
                        )));
                    }
                    if segment.filesize > 0 {
                        ranges.push((segment.fileoff, segment.file_end(), segment.name()));
                    }

                    for section in &segment.sections {
                        if !section.is_zerofill()
                            && section.offset != 0
                            && !within(section.offset as u64, section.size)
                        {
                            return Err(MachOError::malformed(format!(
                                "section {},{} file range exceeds data",
                                segment.name(),
                                section.name()
                            )));
                        }
                    }
                }
                LoadCommandData::LinkeditData(ld) => {
                    if !within(ld.dataoff as u64, ld.datasize as u64) {
                        return Err(MachOError::malformed(format!(
                            "data of load command 0x{:x} exceeds data",
                            lc.cmd
                        )));
                    }
                }
                LoadCommandData::Symtab(symtab) => {
                    let nlist_size = if self.ctx.is_64 { 16 } else { 12 };
                    if !within(symtab.stroff as u64, symtab.strsize as u64)
                        || !within(symtab.symoff as u64, symtab.nsyms as u64 * nlist_size)
                    {
                        return Err(MachOError::malformed("symbol table exceeds data"));
                    }
                }
                _ => {}
            }
        }

        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(MachOError::malformed(format!(
                    "segments {} and {} overlap",
                    pair[0].2, pair[1].2
                )));
            }
        }

        Ok(())
    }

    pub fn ctx(&self) -> Ctx {
        self.ctx
    }

    pub fn is_64(&self) -> bool {
        self.ctx.is_64
    }

    pub fn header(&self) -> &MachHeader {
        &self.header
    }

    pub fn load_commands(&self) -> &[LoadCommand] {
        &self.load_commands
    }

    /// Size of the image in bytes.
    pub fn file_size(&self) -> usize {
        self.data.len()
    }

    /// Raw bytes of a file range.
    ///
    /// The load command area reflects the image as parsed. Use
    /// [MachOImage::serialize] to obtain bytes including mutations.
    pub fn file_data(&self, offset: usize, size: usize) -> Option<&[u8]> {
        self.data.get(offset..offset.checked_add(size)?)
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.load_commands.iter().filter_map(|lc| lc.as_segment())
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments().find(|s| s.name() == name)
    }

    /// Index of the load command defining a named segment.
    pub fn segment_command_index(&self, name: &str) -> Option<usize> {
        self.load_commands
            .iter()
            .position(|lc| lc.as_segment().map_or(false, |s| s.name() == name))
    }

    /// Find the first load command of a given type.
    pub fn find_command(&self, cmd: u32) -> Option<(usize, &LoadCommand)> {
        self.load_commands
            .iter()
            .enumerate()
            .find(|(_, lc)| lc.cmd == cmd)
    }

    /// The `LC_CODE_SIGNATURE` load command, if present.
    pub fn code_signature_command(&self) -> Option<LinkeditData> {
        self.find_command(LC_CODE_SIGNATURE)
            .and_then(|(_, lc)| lc.as_linkedit_data().copied())
    }

    /// Raw bytes of the embedded code signature, if present.
    pub fn code_signature_data(&self) -> Option<&[u8]> {
        let lc = self.code_signature_command()?;

        self.file_data(lc.dataoff as usize, lc.datasize as usize)
    }

    /// Offset just past the last load command.
    pub fn load_commands_end(&self) -> usize {
        self.ctx.header_size()
            + self
                .load_commands
                .iter()
                .map(|lc| lc.cmdsize(self.ctx))
                .sum::<usize>()
    }

    /// Lowest file offset holding segment or section data.
    ///
    /// Load commands must end at or before this offset.
    pub fn load_command_limit(&self) -> usize {
        let mut limit = self.data.len() as u64;

        for segment in self.segments() {
            if segment.fileoff > 0 && segment.filesize > 0 {
                limit = limit.min(segment.fileoff);
            }
            for section in &segment.sections {
                if let Some((start, _)) = section.file_range() {
                    limit = limit.min(start);
                }
            }
        }

        limit as usize
    }

    fn check_command_space(&self, new_end: usize) -> Result<(), MachOError> {
        if new_end > self.load_command_limit() {
            return Err(MachOError::LoadCommandNoRoom);
        }

        // Bytes past the original command area must be unused padding.
        let check_start = self.commands_high_water.max(self.load_commands_end());
        if new_end > check_start && self.data[check_start..new_end].iter().any(|b| *b != 0) {
            return Err(MachOError::LoadCommandNoRoom);
        }

        Ok(())
    }

    /// Append a load command.
    ///
    /// Requires unused space between the end of the load commands and the
    /// first section data. Returns the index of the new command.
    pub fn insert_load_command(&mut self, command: LoadCommand) -> Result<usize, MachOError> {
        let new_end = self.load_commands_end() + command.cmdsize(self.ctx);
        self.check_command_space(new_end)?;

        debug!(
            "inserting load command 0x{:x} ({} bytes)",
            command.cmd,
            command.cmdsize(self.ctx)
        );
        self.load_commands.push(command);

        Ok(self.load_commands.len() - 1)
    }

    /// Replace a load command, returning the old one.
    pub fn replace_load_command(
        &mut self,
        index: usize,
        command: LoadCommand,
    ) -> Result<LoadCommand, MachOError> {
        let existing = self
            .load_commands
            .get(index)
            .ok_or(MachOError::LoadCommandIndex(index))?;

        let old_size = existing.cmdsize(self.ctx);
        let new_size = command.cmdsize(self.ctx);
        if new_size > old_size {
            self.check_command_space(self.load_commands_end() + new_size - old_size)?;
        }

        Ok(std::mem::replace(&mut self.load_commands[index], command))
    }

    /// Remove a load command, returning it.
    pub fn remove_load_command(&mut self, index: usize) -> Result<LoadCommand, MachOError> {
        if index >= self.load_commands.len() {
            return Err(MachOError::LoadCommandIndex(index));
        }

        Ok(self.load_commands.remove(index))
    }

    /// Change the file and VM size of a segment.
    ///
    /// Bytes are inserted or removed at the end of the segment's file data.
    /// File offsets of all data following the segment are shifted by the
    /// size delta. The image is left untouched on error.
    pub fn resize_segment(
        &mut self,
        name: &str,
        filesize: u64,
        vmsize: u64,
    ) -> Result<(), MachOError> {
        let index = self
            .segment_command_index(name)
            .ok_or_else(|| MachOError::SegmentNotFound(name.to_string()))?;
        let segment = self.load_commands[index]
            .as_segment()
            .cloned()
            .ok_or_else(|| MachOError::SegmentNotFound(name.to_string()))?;

        let old_end = segment.file_end();
        let new_end = segment
            .fileoff
            .checked_add(filesize)
            .filter(|end| *end <= self.ctx.max_offset())
            .ok_or(MachOError::InsufficientSpace)?;

        let vm_end = segment
            .vmaddr
            .checked_add(vmsize)
            .filter(|end| *end <= self.ctx.max_offset())
            .ok_or(MachOError::InsufficientSpace)?;
        let next_vmaddr = self
            .segments()
            .filter(|s| s.vmaddr > segment.vmaddr)
            .map(|s| s.vmaddr)
            .min();
        if matches!(next_vmaddr, Some(next) if vm_end > next) {
            return Err(MachOError::SegmentOverlap(name.to_string()));
        }

        let delta = i64::try_from(filesize as i128 - segment.filesize as i128)
            .map_err(|_| MachOError::InsufficientSpace)?;

        let mut commands = self.load_commands.clone();

        if delta != 0 {
            for (i, lc) in commands.iter_mut().enumerate() {
                if i != index {
                    lc.shift_file_offsets(old_end, delta, self.ctx)?;
                }
            }
        }

        if let Some(segment) = commands[index].as_segment_mut() {
            segment.filesize = filesize;
            segment.vmsize = vmsize;
        }

        let new_len = (self.data.len() as i128 + delta as i128) as u64;
        if new_len > self.ctx.max_offset() {
            return Err(MachOError::InsufficientSpace);
        }

        debug!(
            "resizing segment {} file size {} -> {}",
            name, segment.filesize, filesize
        );

        let old_end = old_end as usize;
        let new_end = new_end as usize;
        if delta > 0 {
            self.data
                .splice(old_end..old_end, std::iter::repeat(0).take(delta as usize));
        } else if delta < 0 {
            self.data.drain(new_end..old_end);
        }

        self.load_commands = commands;

        Ok(())
    }

    /// Append a section header to a segment.
    ///
    /// The section's file data, if any, must lie within the segment.
    pub fn append_section(&mut self, segment_name: &str, section: Section) -> Result<(), MachOError> {
        let index = self
            .segment_command_index(segment_name)
            .ok_or_else(|| MachOError::SegmentNotFound(segment_name.to_string()))?;

        let (fileoff, file_end) = {
            let segment = self.load_commands[index]
                .as_segment()
                .ok_or_else(|| MachOError::SegmentNotFound(segment_name.to_string()))?;
            (segment.fileoff, segment.file_end())
        };

        let section_range = section.file_range();
        if let Some((start, end)) = section_range {
            if start < fileoff || end > file_end {
                return Err(MachOError::SectionOutsideSegment(segment_name.to_string()));
            }
        }

        let new_end = self.load_commands_end() + Section::size_for(self.ctx);
        self.check_command_space(new_end)?;
        if matches!(section_range, Some((start, _)) if (start as usize) < new_end) {
            return Err(MachOError::LoadCommandNoRoom);
        }

        if let Some(segment) = self.load_commands[index].as_segment_mut() {
            segment.sections.push(section);
        }

        Ok(())
    }

    /// Write bytes at a file offset.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), MachOError> {
        let dest = offset
            .checked_add(data.len())
            .and_then(|end| self.data.get_mut(offset..end))
            .ok_or(MachOError::WriteOutOfBounds(offset, data.len()))?;

        dest.copy_from_slice(data);

        Ok(())
    }

    /// Serialize the image to bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, MachOError> {
        let ctx = self.ctx;
        let mut out = self.data.clone();

        let sizeofcmds = self.load_commands_end() - ctx.header_size();
        if self.load_commands_end() > self.load_command_limit() {
            return Err(MachOError::LoadCommandNoRoom);
        }

        let header = MachHeader {
            ncmds: self.load_commands.len() as u32,
            sizeofcmds: u32::try_from(sizeofcmds).map_err(|_| MachOError::InsufficientSpace)?,
            ..self.header
        };
        header.write(&mut out, ctx)?;

        let mut offset = ctx.header_size();
        for lc in &self.load_commands {
            let bytes = lc.to_bytes(ctx)?;
            out[offset..offset + bytes.len()].copy_from_slice(&bytes);
            offset += bytes.len();
        }

        if self.commands_high_water > offset {
            out[offset..self.commands_high_water].fill(0);
        }

        Ok(out)
    }

    /// Resolve the targeting settings from build version load commands.
    pub fn find_targeting(&self) -> Option<MachoTarget> {
        self.load_commands.iter().find_map(|lc| match &lc.data {
            LoadCommandData::BuildVersion(bv) => Some(MachoTarget {
                platform: Platform::from(bv.platform),
                minimum_os_version: parse_version_nibbles(bv.minos),
                sdk_version: parse_version_nibbles(bv.sdk),
            }),
            LoadCommandData::VersionMin(vm) => {
                let platform = match lc.cmd {
                    LC_VERSION_MIN_MACOSX => Platform::MacOs,
                    LC_VERSION_MIN_IPHONEOS => Platform::IOs,
                    LC_VERSION_MIN_TVOS => Platform::TvOs,
                    LC_VERSION_MIN_WATCHOS => Platform::WatchOs,
                    cmd => Platform::Unknown(cmd),
                };

                Some(MachoTarget {
                    platform,
                    minimum_os_version: parse_version_nibbles(vm.version),
                    sdk_version: parse_version_nibbles(vm.sdk),
                })
            }
            _ => None,
        })
    }
}
