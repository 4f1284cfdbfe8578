// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, Blob, CodeSigningMagic, CodeSigningSlot, Digest,
            DigestType,
        },
        error::DarwinCodesignError,
    },
    darwin_macho::{MachoTarget, Platform},
    scroll::{IOwrite, Pread},
    semver::Version,
    std::{borrow::Cow, collections::BTreeMap, io::Write, str::FromStr},
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature.
    #[derive(Default)]
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        ///
        /// This signature should be ignored in any new signing operation.
        const LINKER_SIGNED = 0x20000;
    }
}

impl FromStr for CodeSignatureFlags {
    type Err = DarwinCodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::HOST),
            "hard" => Ok(Self::FORCE_HARD),
            "kill" => Ok(Self::FORCE_KILL),
            "expires" => Ok(Self::FORCE_EXPIRATION),
            "library" => Ok(Self::LIBRARY_VALIDATION),
            "runtime" => Ok(Self::RUNTIME),
            "linker-signed" => Ok(Self::LINKER_SIGNED),
            _ => Err(DarwinCodesignError::CodeSignatureUnknownFlag(s.to_string())),
        }
    }
}

impl CodeSignatureFlags {
    /// Attempt to convert a series of strings into a [CodeSignatureFlags].
    pub fn from_strs(s: &[&str]) -> Result<CodeSignatureFlags, DarwinCodesignError> {
        let mut flags = CodeSignatureFlags::empty();

        for s in s {
            flags |= Self::from_str(s)?;
        }

        Ok(flags)
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

/// Version of Code Directory data structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
    SupportsLinkage = 0x20600,
}

fn get_hashes(
    data: &[u8],
    offset: usize,
    count: usize,
    hash_size: usize,
) -> Result<Vec<Digest<'_>>, DarwinCodesignError> {
    if hash_size == 0 {
        return Err(DarwinCodesignError::CodeDirectoryMalformed("zero hash size"));
    }

    let end = count
        .checked_mul(hash_size)
        .and_then(|len| offset.checked_add(len))
        .ok_or(DarwinCodesignError::CodeDirectoryMalformed("digest range overflow"))?;

    Ok(data
        .get(offset..end)
        .ok_or(DarwinCodesignError::CodeDirectoryMalformed(
            "digests extend past blob",
        ))?
        .chunks(hash_size)
        .map(|data| Digest { data: data.into() })
        .collect())
}

fn read_c_string<'a>(
    data: &'a [u8],
    offset: u32,
    what: &'static str,
) -> Result<&'a str, DarwinCodesignError> {
    let tail = data
        .get(offset as usize..)
        .ok_or(DarwinCodesignError::CodeDirectoryMalformed(what))?;
    let end = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or(DarwinCodesignError::CodeDirectoryMalformed(what))?;

    std::str::from_utf8(&tail[..end]).map_err(|_| DarwinCodesignError::CodeDirectoryMalformed(what))
}

/// Represents a code directory blob entry.
///
/// This struct is versioned and has been extended over time.
///
/// The struct here represents a superset of all fields in all versions.
///
/// The parser will set `Option<T>` fields to `None` for instances
/// where the version is lower than the version that field was introduced in.
#[derive(Debug)]
pub struct CodeDirectoryBlob<'a> {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    // hash_offset, ident_offset, n_special_slots, and n_code_slots not stored
    // explicitly because they are redundant with derived fields.
    /// Limit to main image signature range.
    ///
    /// This is the file offset to stop digesting code data at, normally the
    /// start of the embedded signature data. 0 when `code_limit_64` is used.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Type of hash.
    pub hash_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// Page size in bytes. (stored as log u8)
    pub page_size: u32,
    /// Unused (must be 0).
    pub spare2: u32,
    // Version 0x20100
    /// Offset of optional scatter vector.
    pub scatter_offset: Option<u32>,
    // Version 0x20200
    // team_offset not stored because it is redundant with derived stored str.
    // Version 0x20300
    /// Unused (must be 0).
    pub spare3: Option<u32>,
    /// Limit to main image signature range, 64 bits.
    pub code_limit_64: Option<u64>,
    // Version 0x20400
    /// Offset of executable segment.
    pub exec_seg_base: Option<u64>,
    /// Limit of executable segment.
    pub exec_seg_limit: Option<u64>,
    /// Executable segment flags.
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    // Version 0x20500
    pub runtime: Option<u32>,
    pub pre_encrypt_offset: Option<u32>,
    // Version 0x20600
    pub linkage_hash_type: Option<u8>,
    pub linkage_truncated: Option<u8>,
    pub spare4: Option<u16>,
    pub linkage_offset: Option<u32>,
    pub linkage_size: Option<u32>,

    // End of blob header data / start of derived data.
    pub ident: Cow<'a, str>,
    pub team_name: Option<Cow<'a, str>>,
    pub code_digests: Vec<Digest<'a>>,
    pub special_digests: BTreeMap<CodeSigningSlot, Digest<'a>>,
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError> {
        read_and_validate_blob_header(data, Self::magic(), "code directory blob")?;

        let offset = &mut 8;

        let version: u32 = data.gread_with(offset, scroll::BE)?;
        let flags = CodeSignatureFlags::from_bits_truncate(data.gread_with::<u32>(offset, scroll::BE)?);
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let code_limit = data.gread_with(offset, scroll::BE)?;
        let hash_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let hash_type = data.gread_with::<u8>(offset, scroll::BE)?.into();
        let platform = data.gread_with(offset, scroll::BE)?;
        let page_size = data.gread_with::<u8>(offset, scroll::BE)?;
        if page_size >= 32 {
            return Err(DarwinCodesignError::CodeDirectoryMalformed("page size"));
        }
        let page_size = 2u32.pow(page_size as u32);
        let spare2 = data.gread_with(offset, scroll::BE)?;

        let at_least = |v: CodeDirectoryVersion| version >= v as u32;

        let scatter_offset = if at_least(CodeDirectoryVersion::SupportsScatter) {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };
        let team_offset = if at_least(CodeDirectoryVersion::SupportsTeamId) {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };

        let (spare3, code_limit_64) = if at_least(CodeDirectoryVersion::SupportsCodeLimit64) {
            (
                Some(data.gread_with(offset, scroll::BE)?),
                Some(data.gread_with(offset, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if at_least(CodeDirectoryVersion::SupportsExecutableSegment) {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(ExecutableSegmentFlags::from_bits_truncate(
                        data.gread_with::<u64>(offset, scroll::BE)?,
                    )),
                )
            } else {
                (None, None, None)
            };

        let (runtime, pre_encrypt_offset) = if at_least(CodeDirectoryVersion::SupportsRuntime) {
            (
                Some(data.gread_with(offset, scroll::BE)?),
                Some(data.gread_with(offset, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (linkage_hash_type, linkage_truncated, spare4, linkage_offset, linkage_size) =
            if at_least(CodeDirectoryVersion::SupportsLinkage) {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                )
            } else {
                (None, None, None, None, None)
            };

        let ident = Cow::from(read_c_string(data, ident_offset, "identifier")?);
        let team_name = team_offset
            .map(|offset| read_c_string(data, offset, "team identifier").map(Cow::from))
            .transpose()?;

        let code_digests = get_hashes(
            data,
            hash_offset as usize,
            n_code_slots as usize,
            hash_size as usize,
        )?;

        let specials_start = (hash_offset as usize)
            .checked_sub(hash_size as usize * n_special_slots as usize)
            .ok_or(DarwinCodesignError::CodeDirectoryMalformed(
                "special digests precede blob",
            ))?;

        let special_digests = get_hashes(
            data,
            specials_start,
            n_special_slots as usize,
            hash_size as usize,
        )?
        .into_iter()
        .enumerate()
        .map(|(i, h)| (CodeSigningSlot::from(n_special_slots - i as u32), h))
        .collect();

        Ok(Self {
            version,
            flags,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size,
            spare2,
            scatter_offset,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            pre_encrypt_offset,
            linkage_hash_type,
            linkage_truncated,
            spare4,
            linkage_offset,
            linkage_size,
            ident,
            team_name,
            code_digests,
            special_digests,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        // Offsets aren't known until the variable length data is written, so
        // placeholders are written and patched at the end.

        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits, scroll::BE)?;
        let hash_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        let ident_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;

        // Special digests live at negative indices before the code digests,
        // each at the index of its slot number. Missing slots below the
        // highest populated slot get null digests.
        let highest_slot = self
            .special_digests
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        cursor.iowrite_with(highest_slot, scroll::BE)?;
        cursor.iowrite_with(self.code_digests.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(self.hash_size, scroll::BE)?;
        cursor.iowrite_with(u8::from(self.hash_type), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        cursor.iowrite_with(self.page_size.trailing_zeros() as u8, scroll::BE)?;
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        let at_least = |v: CodeDirectoryVersion| self.version >= v as u32;

        let mut scatter_offset_cursor_position = None;
        let mut team_offset_cursor_position = None;

        if at_least(CodeDirectoryVersion::SupportsScatter) {
            scatter_offset_cursor_position = Some(cursor.position());
            cursor.iowrite_with(self.scatter_offset.unwrap_or(0), scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsTeamId) {
            team_offset_cursor_position = Some(cursor.position());
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsCodeLimit64) {
            cursor.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsExecutableSegment) {
            cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(
                self.exec_seg_flags
                    .unwrap_or_else(ExecutableSegmentFlags::empty)
                    .bits,
                scroll::BE,
            )?;
        }
        if at_least(CodeDirectoryVersion::SupportsRuntime) {
            cursor.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.pre_encrypt_offset.unwrap_or(0), scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsLinkage) {
            cursor.iowrite_with(self.linkage_hash_type.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_truncated.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.spare4.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_offset.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_size.unwrap_or(0), scroll::BE)?;
        }

        let identity_offset = cursor.position();
        cursor.write_all(self.ident.as_bytes())?;
        cursor.write_all(b"\0")?;

        let team_offset = cursor.position();
        if team_offset_cursor_position.is_some() {
            if let Some(team_name) = &self.team_name {
                cursor.write_all(team_name.as_bytes())?;
                cursor.write_all(b"\0")?;
            }
        }

        // Highest slot first, down to slot 1. Slot 0 is the first code digest.
        for slot_index in (1..highest_slot + 1).rev() {
            let slot = CodeSigningSlot::from(slot_index);
            if !slot.is_code_directory_specials_expressible() {
                return Err(DarwinCodesignError::SignatureBuilder(
                    "slot not expressible in code directory special digests",
                ));
            }

            if let Some(hash) = self.special_digests.get(&slot) {
                cursor.write_all(&hash.data)?;
            } else {
                cursor.write_all(&b"\0".repeat(self.hash_size as usize))?;
            }
        }

        let code_hashes_start_offset = cursor.position();

        for hash in &self.code_digests {
            cursor.write_all(&hash.data)?;
        }

        if scatter_offset_cursor_position.is_some() && self.scatter_offset.is_some() {
            return Err(DarwinCodesignError::Unimplemented("scatter offset"));
        }

        // Offsets are relative to the blob start, which includes the 8 byte
        // header not present in this buffer.
        cursor.set_position(hash_offset_cursor_position);
        cursor.iowrite_with(code_hashes_start_offset as u32 + 8, scroll::BE)?;

        cursor.set_position(ident_offset_cursor_position);
        cursor.iowrite_with(identity_offset as u32 + 8, scroll::BE)?;

        if let Some(offset) = team_offset_cursor_position {
            if self.team_name.is_some() {
                cursor.set_position(offset);
                cursor.iowrite_with(team_offset as u32 + 8, scroll::BE)?;
            }
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    /// Adjust the version of the data structure according to what fields are set.
    ///
    /// Returns the old version.
    pub fn adjust_version(&mut self, target: Option<&MachoTarget>) -> u32 {
        let old_version = self.version;

        let mut minimum_version = CodeDirectoryVersion::Initial;

        if self.scatter_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsScatter;
        }
        if self.team_name.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsTeamId;
        }
        if self.spare3.is_some() || self.code_limit_64.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsCodeLimit64;
        }
        if self.exec_seg_base.is_some()
            || self.exec_seg_limit.is_some()
            || self.exec_seg_flags.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsExecutableSegment;
        }
        if self.runtime.is_some() || self.pre_encrypt_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsRuntime;
        }
        if self.linkage_hash_type.is_some()
            || self.linkage_truncated.is_some()
            || self.spare4.is_some()
            || self.linkage_offset.is_some()
            || self.linkage_size.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsLinkage;
        }

        // Newer operating systems refuse signatures older than the
        // executable segment version.
        if let Some(target) = target {
            let target_minimum = match target.platform {
                Platform::IOs | Platform::IOsSimulator
                    if target.minimum_os_version >= Version::new(15, 0, 0) =>
                {
                    CodeDirectoryVersion::SupportsExecutableSegment
                }
                Platform::MacOs if target.minimum_os_version >= Version::new(12, 0, 0) => {
                    CodeDirectoryVersion::SupportsExecutableSegment
                }
                _ => CodeDirectoryVersion::Initial,
            };

            minimum_version = minimum_version.max(target_minimum);
        }

        self.version = minimum_version as u32;

        old_version
    }

    /// Clears optional fields that are newer than the current version.
    ///
    /// Fields not present in the current version would be silently dropped
    /// on serialization. This makes that explicit.
    pub fn clear_newer_fields(&mut self) {
        if self.version < CodeDirectoryVersion::SupportsScatter as u32 {
            self.scatter_offset = None;
        }
        if self.version < CodeDirectoryVersion::SupportsTeamId as u32 {
            self.team_name = None;
        }
        if self.version < CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            self.spare3 = None;
            self.code_limit_64 = None;
        }
        if self.version < CodeDirectoryVersion::SupportsExecutableSegment as u32 {
            self.exec_seg_base = None;
            self.exec_seg_limit = None;
            self.exec_seg_flags = None;
        }
        if self.version < CodeDirectoryVersion::SupportsRuntime as u32 {
            self.runtime = None;
            self.pre_encrypt_offset = None;
        }
        if self.version < CodeDirectoryVersion::SupportsLinkage as u32 {
            self.linkage_hash_type = None;
            self.linkage_truncated = None;
            self.spare4 = None;
            self.linkage_offset = None;
            self.linkage_size = None;
        }
    }

    /// The effective code limit, whichever field holds it.
    pub fn effective_code_limit(&self) -> u64 {
        match self.code_limit_64 {
            Some(limit) if self.code_limit == 0 && limit != 0 => limit,
            _ => self.code_limit as u64,
        }
    }

    /// Set the code limit, spilling into `code_limit_64` when it exceeds 32 bits.
    pub fn set_code_limit(&mut self, limit: u64) {
        match u32::try_from(limit) {
            Ok(limit) => {
                self.code_limit = limit;
                self.code_limit_64 = None;
            }
            Err(_) => {
                self.code_limit = 0;
                self.code_limit_64 = Some(limit);
            }
        }
    }

    /// Obtain the digest recorded for a special slot.
    pub fn slot_digest(&self, slot: CodeSigningSlot) -> Option<&Digest<'a>> {
        self.special_digests.get(&slot)
    }

    /// Record the digest of a special slot.
    pub fn set_slot_digest(
        &mut self,
        slot: CodeSigningSlot,
        digest: impl Into<Digest<'a>>,
    ) -> Result<(), DarwinCodesignError> {
        if !slot.is_code_directory_specials_expressible() {
            return Err(DarwinCodesignError::SignatureBuilder(
                "slot not expressible in code directory special digests",
            ));
        }

        let digest = digest.into();
        if digest.data.len() != self.hash_size as usize {
            return Err(DarwinCodesignError::SignatureBuilder(
                "slot digest length does not match code directory hash size",
            ));
        }

        self.special_digests.insert(slot, digest);

        Ok(())
    }

    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            code_limit: self.code_limit,
            hash_size: self.hash_size,
            hash_type: self.hash_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: self.spare2,
            scatter_offset: self.scatter_offset,
            spare3: self.spare3,
            code_limit_64: self.code_limit_64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            runtime: self.runtime,
            pre_encrypt_offset: self.pre_encrypt_offset,
            linkage_hash_type: self.linkage_hash_type,
            linkage_truncated: self.linkage_truncated,
            spare4: self.spare4,
            linkage_offset: self.linkage_offset,
            linkage_size: self.linkage_size,
            ident: Cow::Owned(self.ident.clone().into_owned()),
            team_name: self
                .team_name
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
            code_digests: self
                .code_digests
                .iter()
                .map(|h| h.to_owned())
                .collect::<Vec<_>>(),
            special_digests: self
                .special_digests
                .iter()
                .map(|(k, v)| (*k, v.to_owned()))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: CodeDirectoryVersion) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: version as u32,
            flags: CodeSignatureFlags::ADHOC | CodeSignatureFlags::RUNTIME,
            code_limit: 9000,
            hash_size: 32,
            hash_type: DigestType::Sha256,
            platform: 0,
            page_size: 4096,
            spare2: 0,
            scatter_offset: None,
            spare3: None,
            code_limit_64: None,
            exec_seg_base: Some(0),
            exec_seg_limit: Some(0x2000),
            exec_seg_flags: Some(ExecutableSegmentFlags::MAIN_BINARY),
            runtime: Some(0x000c_0300),
            pre_encrypt_offset: None,
            linkage_hash_type: None,
            linkage_truncated: None,
            spare4: None,
            linkage_offset: None,
            linkage_size: None,
            ident: "com.example.tool".into(),
            team_name: Some("TEAM123456".into()),
            code_digests: (0..3u8).map(|i| Digest::from(vec![i; 32])).collect(),
            special_digests: BTreeMap::new(),
        }
    }

    #[test]
    fn code_signature_flags_from_str() {
        assert_eq!(
            CodeSignatureFlags::from_str("host").unwrap(),
            CodeSignatureFlags::HOST
        );
        assert_eq!(
            CodeSignatureFlags::from_str("runtime").unwrap(),
            CodeSignatureFlags::RUNTIME
        );
        assert_eq!(
            CodeSignatureFlags::from_strs(&["kill", "hard"]).unwrap(),
            CodeSignatureFlags::FORCE_KILL | CodeSignatureFlags::FORCE_HARD
        );
        assert!(matches!(
            CodeSignatureFlags::from_str("bogus"),
            Err(DarwinCodesignError::CodeSignatureUnknownFlag(_))
        ));
    }

    #[test]
    fn parse_serialize_cycle() {
        let mut cd = sample(CodeDirectoryVersion::SupportsRuntime);
        cd.set_slot_digest(CodeSigningSlot::Entitlements, vec![0xaa; 32])
            .unwrap();
        cd.set_slot_digest(CodeSigningSlot::RequirementSet, vec![0xbb; 32])
            .unwrap();

        let bytes = cd.to_blob_bytes().unwrap();
        let parsed = CodeDirectoryBlob::from_blob_bytes(&bytes).unwrap();

        assert_eq!(parsed.version, 0x20500);
        assert_eq!(parsed.ident, "com.example.tool");
        assert_eq!(parsed.team_name.as_deref(), Some("TEAM123456"));
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.code_digests, cd.code_digests);
        assert_eq!(parsed.runtime, Some(0x000c_0300));
        assert_eq!(parsed.exec_seg_flags, Some(ExecutableSegmentFlags::MAIN_BINARY));

        // Slots 1 through 5 are written; 1, 3 and 4 are null.
        assert_eq!(parsed.special_digests.len(), 5);
        assert!(parsed.slot_digest(CodeSigningSlot::Info).unwrap().is_null());
        assert_eq!(
            parsed
                .slot_digest(CodeSigningSlot::Entitlements)
                .unwrap()
                .to_vec(),
            vec![0xaa; 32]
        );

        assert_eq!(parsed.to_blob_bytes().unwrap(), bytes);
    }

    #[test]
    fn special_digest_ordering() {
        let mut cd = sample(CodeDirectoryVersion::Initial);
        cd.team_name = None;
        cd.set_slot_digest(CodeSigningSlot::RequirementSet, vec![2; 32])
            .unwrap();
        cd.set_slot_digest(CodeSigningSlot::Entitlements, vec![5; 32])
            .unwrap();

        let bytes = cd.to_blob_bytes().unwrap();
        let hash_offset = bytes.pread_with::<u32>(16, scroll::BE).unwrap() as usize;
        assert_eq!(bytes.pread_with::<u32>(24, scroll::BE).unwrap(), 5);

        // Slot k is at hash_offset - k * hash_size.
        assert_eq!(&bytes[hash_offset - 32..hash_offset], &[0u8; 32][..]);
        assert_eq!(&bytes[hash_offset - 64..hash_offset - 32], &[2u8; 32][..]);
        assert_eq!(&bytes[hash_offset - 160..hash_offset - 128], &[5u8; 32][..]);
        assert_eq!(&bytes[hash_offset..hash_offset + 32], &[0u8; 32][..]);
    }

    #[test]
    fn version_adjustment() {
        let target = |platform, minos: (u64, u64)| MachoTarget {
            platform,
            minimum_os_version: Version::new(minos.0, minos.1, 0),
            sdk_version: Version::new(minos.0, minos.1, 0),
        };

        let mut cd = sample(CodeDirectoryVersion::Initial);
        cd.team_name = None;
        cd.exec_seg_base = None;
        cd.exec_seg_limit = None;
        cd.exec_seg_flags = None;
        cd.runtime = None;

        cd.adjust_version(None);
        assert_eq!(cd.version, CodeDirectoryVersion::Initial as u32);

        cd.adjust_version(Some(&target(Platform::MacOs, (11, 6))));
        assert_eq!(cd.version, CodeDirectoryVersion::Initial as u32);

        cd.adjust_version(Some(&target(Platform::MacOs, (12, 0))));
        assert_eq!(cd.version, 0x20400);

        cd.adjust_version(Some(&target(Platform::IOs, (15, 0))));
        assert_eq!(cd.version, 0x20400);

        cd.runtime = Some(1);
        cd.adjust_version(Some(&target(Platform::MacOs, (12, 0))));
        assert_eq!(cd.version, 0x20500);
    }

    #[test]
    fn large_code_limit() {
        let mut cd = sample(CodeDirectoryVersion::Initial);

        cd.set_code_limit(u32::MAX as u64 + 10);
        assert_eq!(cd.code_limit, 0);
        assert_eq!(cd.code_limit_64, Some(u32::MAX as u64 + 10));
        assert_eq!(cd.effective_code_limit(), u32::MAX as u64 + 10);
        cd.adjust_version(None);
        assert!(cd.version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32);

        cd.set_code_limit(4096);
        assert_eq!(cd.code_limit, 4096);
        assert_eq!(cd.code_limit_64, None);
    }

    #[test]
    fn rejects_truncated_digests() {
        let cd = sample(CodeDirectoryVersion::SupportsRuntime);
        let mut bytes = cd.to_blob_bytes().unwrap();

        // Claim more code slots than present.
        bytes[28..32].copy_from_slice(&100u32.to_be_bytes());
        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&bytes),
            Err(DarwinCodesignError::CodeDirectoryMalformed(_))
        ));
    }

    #[test]
    fn bad_slot_digests() {
        let mut cd = sample(CodeDirectoryVersion::Initial);
        assert!(cd
            .set_slot_digest(CodeSigningSlot::Signature, vec![0; 32])
            .is_err());
        assert!(cd
            .set_slot_digest(CodeSigningSlot::Entitlements, vec![0; 20])
            .is_err());
    }
}
