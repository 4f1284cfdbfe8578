// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature data structures (superblobs, blobs, magic values).
//!
//! Signature data referenced by `LC_CODE_SIGNATURE` is a *superblob*:
//!
//! * A header holding the superblob magic, the total length and the number
//!   of blobs that follow.
//! * An index of `(slot, offset)` pairs, one per blob. The slot says what the
//!   blob holds (code directory, entitlements, CMS signature, ...). Offsets
//!   are relative to the start of the superblob.
//! * The blobs. Each blob starts with its own big endian magic and length.
//!
//! All integers in these structures are big endian regardless of the
//! endianness of the Mach-O binary holding them.
//!
//! [EmbeddedSignature] is a lightly parsed superblob. Its [BlobEntry] values
//! can be turned into [ParsedBlob] for typed access.

use {
    crate::{code_directory::CodeDirectoryBlob, error::DarwinCodesignError},
    cryptographic_message_syntax::SignedData,
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        collections::BTreeMap,
        fmt::{Display, Formatter},
        io::Write,
        str::FromStr,
    },
};

/// Header magic of the various blob payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningMagic {
    /// Code requirement blob.
    Requirement,
    /// Code requirements blob.
    RequirementSet,
    /// CodeDirectory blob.
    CodeDirectory,
    /// Embedded signature. The magic of the superblob.
    EmbeddedSignature,
    /// Old embedded signature.
    EmbeddedSignatureOld,
    /// Entitlements blob.
    Entitlements,
    /// DER encoded entitlements blob.
    EntitlementsDer,
    /// Multi-arch collection of embedded signatures.
    DetachedSignature,
    /// Generic blob wrapper. The CMS signature is stored in this type.
    BlobWrapper,
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade0b02 => Self::EmbeddedSignatureOld,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0cc1 => Self::DetachedSignature,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::EmbeddedSignatureOld => 0xfade0b02,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::DetachedSignature => 0xfade0cc1,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// A well-known slot within a superblob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    AlternateCodeDirectory0,
    AlternateCodeDirectory1,
    AlternateCodeDirectory2,
    AlternateCodeDirectory3,
    AlternateCodeDirectory4,
    Signature,
    Identification,
    Ticket,
    Unknown(u32),
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            0x1000 => Self::AlternateCodeDirectory0,
            0x1001 => Self::AlternateCodeDirectory1,
            0x1002 => Self::AlternateCodeDirectory2,
            0x1003 => Self::AlternateCodeDirectory3,
            0x1004 => Self::AlternateCodeDirectory4,
            0x10000 => Self::Signature,
            0x10001 => Self::Identification,
            0x10002 => Self::Ticket,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::AlternateCodeDirectory0 => 0x1000,
            CodeSigningSlot::AlternateCodeDirectory1 => 0x1001,
            CodeSigningSlot::AlternateCodeDirectory2 => 0x1002,
            CodeSigningSlot::AlternateCodeDirectory3 => 0x1003,
            CodeSigningSlot::AlternateCodeDirectory4 => 0x1004,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Identification => 0x10001,
            CodeSigningSlot::Ticket => 0x10002,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl Display for CodeSigningSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CodeDirectory => "CodeDirectory",
            Self::Info => "Info",
            Self::RequirementSet => "RequirementSet",
            Self::ResourceDir => "Resources",
            Self::Application => "Application",
            Self::Entitlements => "Entitlements",
            Self::RepSpecific => "Rep Specific",
            Self::EntitlementsDer => "DER Entitlements",
            Self::AlternateCodeDirectory0 => "CodeDirectory Alternate #0",
            Self::AlternateCodeDirectory1 => "CodeDirectory Alternate #1",
            Self::AlternateCodeDirectory2 => "CodeDirectory Alternate #2",
            Self::AlternateCodeDirectory3 => "CodeDirectory Alternate #3",
            Self::AlternateCodeDirectory4 => "CodeDirectory Alternate #4",
            Self::Signature => "CMS Signature",
            Self::Identification => "Identification",
            Self::Ticket => "Ticket",
            Self::Unknown(_) => "Unknown",
        };

        write!(f, "{} ({})", name, u32::from(*self))
    }
}

impl CodeSigningSlot {
    /// Whether this slot has external data (as opposed to provided via a blob).
    pub fn has_external_content(&self) -> bool {
        matches!(self, Self::Info | Self::ResourceDir)
    }

    /// Whether the digest of this slot can be stored in a code directory.
    ///
    /// Only slots 1 through 7 have negative indices in the code directory.
    pub fn is_code_directory_specials_expressible(&self) -> bool {
        (1..=7).contains(&u32::from(*self))
    }

    /// The alternate code directory slot at an index, if there is one.
    pub fn alternate_code_directory(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::AlternateCodeDirectory0),
            1 => Some(Self::AlternateCodeDirectory1),
            2 => Some(Self::AlternateCodeDirectory2),
            3 => Some(Self::AlternateCodeDirectory3),
            4 => Some(Self::AlternateCodeDirectory4),
            _ => None,
        }
    }

    pub fn is_alternate_code_directory(&self) -> bool {
        (0x1000..=0x1004).contains(&u32::from(*self))
    }
}

/// Represents a digest type encountered in code signature data structures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl Default for DigestType {
    fn default() -> Self {
        Self::Sha256
    }
}

impl From<u8> for DigestType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Sha1,
            2 => Self::Sha256,
            3 => Self::Sha256Truncated,
            4 => Self::Sha384,
            5 => Self::Sha512,
            _ => Self::Unknown(v),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(v: DigestType) -> u8 {
        match v {
            DigestType::None => 0,
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha256Truncated => 3,
            DigestType::Sha384 => 4,
            DigestType::Sha512 => 5,
            DigestType::Unknown(v) => v,
        }
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestType::None => f.write_str("none"),
            DigestType::Sha1 => f.write_str("sha1"),
            DigestType::Sha256 => f.write_str("sha256"),
            DigestType::Sha256Truncated => f.write_str("sha256-truncated"),
            DigestType::Sha384 => f.write_str("sha384"),
            DigestType::Sha512 => f.write_str("sha512"),
            DigestType::Unknown(v) => write!(f, "unknown: {}", v),
        }
    }
}

impl FromStr for DigestType {
    type Err = DarwinCodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha256-truncated" => Ok(Self::Sha256Truncated),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(DarwinCodesignError::UnsupportedHashAlgorithm(s.to_string())),
        }
    }
}

impl DigestType {
    /// Obtain the size of hashes for this hash type.
    pub fn hash_len(&self) -> Result<usize, DarwinCodesignError> {
        Ok(self.digest_data(&[])?.len())
    }

    /// Obtain a hasher for this digest type.
    pub fn as_hasher(&self) -> Result<ring::digest::Context, DarwinCodesignError> {
        match self {
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 | Self::Sha256Truncated => {
                Ok(ring::digest::Context::new(&ring::digest::SHA256))
            }
            Self::Sha384 => Ok(ring::digest::Context::new(&ring::digest::SHA384)),
            Self::Sha512 => Ok(ring::digest::Context::new(&ring::digest::SHA512)),
            Self::None | Self::Unknown(_) => Err(DarwinCodesignError::UnsupportedHashAlgorithm(
                self.to_string(),
            )),
        }
    }

    /// Digest data given the configured hasher.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, DarwinCodesignError> {
        let mut hasher = self.as_hasher()?;

        hasher.update(data);
        let mut hash = hasher.finish().as_ref().to_vec();

        if matches!(self, Self::Sha256Truncated) {
            hash.truncate(20);
        }

        Ok(hash)
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    /// Whether this is the null hash (all 0s).
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }

    pub fn as_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

impl<'a> std::fmt::Debug for Digest<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl<'a> From<Vec<u8>> for Digest<'a> {
    fn from(v: Vec<u8>) -> Self {
        Self { data: v.into() }
    }
}

/// Read the header from a blob.
///
/// Blobs begin with a u32 magic and u32 length, inclusive.
fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), DarwinCodesignError> {
    let magic = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)? as usize;

    if length < 8 || length > data.len() {
        return Err(DarwinCodesignError::SuperblobMalformed);
    }

    Ok((magic, length, &data[8..length]))
}

pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], DarwinCodesignError> {
    let (magic, _, data) = read_blob_header(data)?;

    if magic != expected_magic {
        Err(DarwinCodesignError::BadMagic(what))
    } else {
        Ok(data)
    }
}

/// Create the binary content for a superblob.
///
/// Blobs are written in ascending slot order regardless of iteration order.
/// The result is zero padded to a multiple of 8 bytes and the padding is
/// counted in the declared length.
pub fn create_superblob<'a>(
    magic: CodeSigningMagic,
    blobs: impl Iterator<Item = &'a (CodeSigningSlot, Vec<u8>)>,
) -> Result<Vec<u8>, DarwinCodesignError> {
    let mut blobs = blobs.collect::<Vec<_>>();
    blobs.sort_by_key(|(slot, _)| *slot);

    // magic + total length + blob count + 8 bytes per index entry.
    let header_length = 12 + 8 * blobs.len();
    let payload_length = blobs.iter().map(|(_, blob)| blob.len()).sum::<usize>();
    let unpadded = header_length + payload_length;
    let total_length = (unpadded + 7) & !7;

    let total_length_u32 =
        u32::try_from(total_length).map_err(|_| DarwinCodesignError::InsufficientSpace)?;

    let mut cursor = std::io::Cursor::new(Vec::<u8>::with_capacity(total_length));
    cursor.iowrite_with(u32::from(magic), scroll::BE)?;
    cursor.iowrite_with(total_length_u32, scroll::BE)?;
    cursor.iowrite_with(blobs.len() as u32, scroll::BE)?;

    let mut offset = header_length as u32;
    for (slot, blob) in &blobs {
        cursor.iowrite_with(u32::from(*slot), scroll::BE)?;
        cursor.iowrite_with(offset, scroll::BE)?;
        offset += blob.len() as u32;
    }
    for (_, blob) in &blobs {
        cursor.write_all(blob)?;
    }

    let mut data = cursor.into_inner();
    data.resize(total_length, 0);

    Ok(data)
}

/// Represents a single blob as defined by a superblob index entry.
///
/// The blob data is unparsed in this type. The payloads can be turned into
/// [ParsedBlob] via `.try_into()`.
#[derive(Clone)]
pub struct BlobEntry<'a> {
    /// Our blob index within the superblob.
    pub index: usize,

    /// The slot type.
    pub slot: CodeSigningSlot,

    /// Our start offset within the superblob.
    pub offset: usize,

    /// The magic value appearing at the beginning of the blob.
    pub magic: CodeSigningMagic,

    /// The length of the blob, including its header.
    pub length: usize,

    /// The raw data in this blob, including magic and length.
    pub data: &'a [u8],
}

impl<'a> std::fmt::Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("BlobEntry")
            .field("index", &self.index)
            .field("slot", &self.slot)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("magic", &self.magic)
            .finish()
    }
}

impl<'a> BlobEntry<'a> {
    /// Attempt to convert to a [ParsedBlob].
    pub fn into_parsed_blob(self) -> Result<ParsedBlob<'a>, DarwinCodesignError> {
        self.try_into()
    }

    /// The data in the blob without the blob header.
    pub fn payload(&self) -> Result<&'a [u8], DarwinCodesignError> {
        Ok(read_blob_header(self.data)?.2)
    }

    /// Compute the content digest of this blob using the specified hash type.
    pub fn digest_with(&self, hash: DigestType) -> Result<Vec<u8>, DarwinCodesignError> {
        hash.digest_data(self.data)
    }
}

/// Provides common features for a parsed blob type.
pub trait Blob<'a>
where
    Self: Sized,
{
    /// The header magic that identifies this format.
    fn magic() -> u32;

    /// Attempt to construct an instance by parsing a bytes slice.
    ///
    /// The slice begins with the 8 byte blob header denoting the magic
    /// and length.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError>;

    /// Serialize the payload of this blob to bytes.
    ///
    /// Does not include the magic or length header fields common to blobs.
    fn serialize_payload(&self) -> Result<Vec<u8>, DarwinCodesignError>;

    /// Serialize this blob to bytes.
    ///
    /// This is [Blob::serialize_payload] with the blob magic and length
    /// prepended.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        let payload = self.serialize_payload()?;

        let mut res = Vec::with_capacity(payload.len() + 8);
        res.iowrite_with(Self::magic(), scroll::BE)?;
        res.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;
        res.extend(payload);

        Ok(res)
    }

    /// Obtain the digest of the serialized blob using the specified hasher.
    fn digest_with(&self, hash_type: DigestType) -> Result<Vec<u8>, DarwinCodesignError> {
        hash_type.digest_data(&self.to_blob_bytes()?)
    }
}

/// Kind of a requirement within a requirement set.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    Plugin,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(t: RequirementType) -> Self {
        match t {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

/// A compiled code requirement.
///
/// The payload is an opaque requirement expression as emitted by `csreq -b`.
pub struct RequirementBlob<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for RequirementBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Requirement)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "requirement blob")?;

        Ok(Self { data: data.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for RequirementBlob<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequirementBlob({})", hex::encode(&self.data))
    }
}

impl<'a> RequirementBlob<'a> {
    pub fn to_owned(&self) -> RequirementBlob<'static> {
        RequirementBlob {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }

    /// Construct an instance from requirement bytes.
    ///
    /// Accepts either a bare expression or a full blob with the requirement
    /// magic, as written by `csreq -b`.
    pub fn from_requirement_bytes(data: &[u8]) -> Result<RequirementBlob<'static>, DarwinCodesignError> {
        let magic = data.pread_with::<u32>(0, scroll::BE).ok();

        if magic == Some(Self::magic()) {
            Ok(RequirementBlob::from_blob_bytes(data)?.to_owned())
        } else {
            Ok(RequirementBlob {
                data: Cow::Owned(data.to_vec()),
            })
        }
    }
}

/// A requirement set blob, holding nested requirement blobs.
#[derive(Debug, Default)]
pub struct RequirementSetBlob<'a> {
    pub requirements: BTreeMap<RequirementType, RequirementBlob<'a>>,
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::RequirementSet)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError> {
        read_and_validate_blob_header(data, Self::magic(), "requirement set blob")?;

        // A count followed by `count` (type, offset) pairs. Offsets are
        // relative to the start of this blob.
        let offset = &mut 8;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        let mut indices = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            indices.push((
                data.gread_with::<u32>(offset, scroll::BE)?,
                data.gread_with::<u32>(offset, scroll::BE)?,
            ));
        }

        let mut requirements = BTreeMap::new();

        for (flavor, start) in indices {
            let requirement_data = data
                .get(start as usize..)
                .ok_or(DarwinCodesignError::SuperblobMalformed)?;

            requirements.insert(
                RequirementType::from(flavor),
                RequirementBlob::from_blob_bytes(requirement_data)?,
            );
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        let mut res = Vec::new();

        // Offsets are relative to the blob start, so account for the blob
        // header and the index.
        let data_start_offset = 8 + 4 + (8 * self.requirements.len() as u32);
        let blobs = self
            .requirements
            .values()
            .map(|requirement| requirement.to_blob_bytes())
            .collect::<Result<Vec<_>, _>>()?;

        res.iowrite_with(self.requirements.len() as u32, scroll::BE)?;

        let mut written = 0;
        for (typ, blob) in self.requirements.keys().zip(blobs.iter()) {
            res.iowrite_with(u32::from(*typ), scroll::BE)?;
            res.iowrite_with(data_start_offset + written, scroll::BE)?;
            written += blob.len() as u32;
        }

        for blob in blobs {
            res.write_all(&blob)?;
        }

        Ok(res)
    }
}

impl<'a> RequirementSetBlob<'a> {
    pub fn to_owned(&self) -> RequirementSetBlob<'static> {
        RequirementSetBlob {
            requirements: self
                .requirements
                .iter()
                .map(|(flavor, blob)| (*flavor, blob.to_owned()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    /// Set the requirement for a given [RequirementType].
    pub fn set_requirements(&mut self, slot: RequirementType, blob: RequirementBlob<'a>) {
        self.requirements.insert(slot, blob);
    }
}

/// An entitlements blob.
///
/// Holds an XML plist with a dict whose keys are the requested entitlements.
#[derive(Debug)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Entitlements)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "entitlements blob")?;
        let s = std::str::from_utf8(data).map_err(DarwinCodesignError::EntitlementsBadUtf8)?;

        Ok(Self { plist: s.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

impl<'a> EntitlementsBlob<'a> {
    /// Construct an instance using any string as the payload.
    pub fn from_string(s: &(impl ToString + ?Sized)) -> Self {
        Self {
            plist: s.to_string().into(),
        }
    }

    /// Obtain the plist representation as a string.
    pub fn as_str(&self) -> &str {
        &self.plist
    }
}

impl<'a> Display for EntitlementsBlob<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.plist)
    }
}

/// DER encoded entitlements. Only ever parsed.
#[derive(Debug)]
pub struct EntitlementsDerBlob<'a> {
    der: &'a [u8],
}

impl<'a> Blob<'a> for EntitlementsDerBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::EntitlementsDer)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError> {
        let der = read_and_validate_blob_header(data, Self::magic(), "DER entitlements blob")?;

        Ok(Self { der })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        Ok(self.der.to_vec())
    }
}

/// A generic blob wrapper, holding the CMS signature.
pub struct BlobWrapperBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError> {
        Ok(Self {
            data: read_and_validate_blob_header(data, Self::magic(), "blob wrapper blob")?.into(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for BlobWrapperBlob<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl BlobWrapperBlob<'static> {
    /// Construct an instance with payload data.
    pub fn from_data_owned(data: Vec<u8>) -> BlobWrapperBlob<'static> {
        Self { data: data.into() }
    }
}

/// Represents an unknown blob type.
pub struct OtherBlob<'a> {
    pub magic: u32,
    pub data: &'a [u8],
}

impl<'a> Blob<'a> for OtherBlob<'a> {
    fn magic() -> u32 {
        // There is no self binding here, so no way to return the real magic.
        u32::MAX
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError> {
        let (magic, _, data) = read_blob_header(data)?;

        Ok(Self { magic, data })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        Ok(self.data.to_vec())
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        let mut res = Vec::with_capacity(self.data.len() + 8);
        res.iowrite_with(self.magic, scroll::BE)?;
        res.iowrite_with(self.data.len() as u32 + 8, scroll::BE)?;
        res.write_all(self.data)?;

        Ok(res)
    }
}

impl<'a> std::fmt::Debug for OtherBlob<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}: {}", self.magic, hex::encode(self.data))
    }
}

/// Represents a single, parsed blob entry/slot.
///
/// Each variant corresponds to a [CodeSigningMagic] blob type.
#[derive(Debug)]
pub enum BlobData<'a> {
    Requirement(Box<RequirementBlob<'a>>),
    RequirementSet(Box<RequirementSetBlob<'a>>),
    CodeDirectory(Box<CodeDirectoryBlob<'a>>),
    Entitlements(Box<EntitlementsBlob<'a>>),
    EntitlementsDer(Box<EntitlementsDerBlob<'a>>),
    BlobWrapper(Box<BlobWrapperBlob<'a>>),
    Other(Box<OtherBlob<'a>>),
}

impl<'a> Blob<'a> for BlobData<'a> {
    fn magic() -> u32 {
        u32::MAX
    }

    /// Parse blob data by reading its magic and feeding into magic-specific parser.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError> {
        let (magic, length, _) = read_blob_header(data)?;
        let data = &data[0..length];

        Ok(match CodeSigningMagic::from(magic) {
            CodeSigningMagic::Requirement => {
                Self::Requirement(Box::new(RequirementBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::RequirementSet => {
                Self::RequirementSet(Box::new(RequirementSetBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::CodeDirectory => {
                Self::CodeDirectory(Box::new(CodeDirectoryBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::Entitlements => {
                Self::Entitlements(Box::new(EntitlementsBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::EntitlementsDer => {
                Self::EntitlementsDer(Box::new(EntitlementsDerBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::BlobWrapper => {
                Self::BlobWrapper(Box::new(BlobWrapperBlob::from_blob_bytes(data)?))
            }
            _ => Self::Other(Box::new(OtherBlob::from_blob_bytes(data)?)),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        match self {
            Self::Requirement(b) => b.serialize_payload(),
            Self::RequirementSet(b) => b.serialize_payload(),
            Self::CodeDirectory(b) => b.serialize_payload(),
            Self::Entitlements(b) => b.serialize_payload(),
            Self::EntitlementsDer(b) => b.serialize_payload(),
            Self::BlobWrapper(b) => b.serialize_payload(),
            Self::Other(b) => b.serialize_payload(),
        }
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        match self {
            Self::Requirement(b) => b.to_blob_bytes(),
            Self::RequirementSet(b) => b.to_blob_bytes(),
            Self::CodeDirectory(b) => b.to_blob_bytes(),
            Self::Entitlements(b) => b.to_blob_bytes(),
            Self::EntitlementsDer(b) => b.to_blob_bytes(),
            Self::BlobWrapper(b) => b.to_blob_bytes(),
            Self::Other(b) => b.to_blob_bytes(),
        }
    }
}

impl<'a> From<RequirementSetBlob<'a>> for BlobData<'a> {
    fn from(b: RequirementSetBlob<'a>) -> Self {
        Self::RequirementSet(Box::new(b))
    }
}

impl<'a> From<CodeDirectoryBlob<'a>> for BlobData<'a> {
    fn from(b: CodeDirectoryBlob<'a>) -> Self {
        Self::CodeDirectory(Box::new(b))
    }
}

impl<'a> From<EntitlementsBlob<'a>> for BlobData<'a> {
    fn from(b: EntitlementsBlob<'a>) -> Self {
        Self::Entitlements(Box::new(b))
    }
}

impl<'a> From<BlobWrapperBlob<'a>> for BlobData<'a> {
    fn from(b: BlobWrapperBlob<'a>) -> Self {
        Self::BlobWrapper(Box::new(b))
    }
}

/// Represents the parsed content of a blob entry.
#[derive(Debug)]
pub struct ParsedBlob<'a> {
    /// The blob record this blob came from.
    pub blob_entry: BlobEntry<'a>,

    /// The parsed blob data.
    pub blob: BlobData<'a>,
}

impl<'a> ParsedBlob<'a> {
    /// Compute the content digest of this blob using the specified hash type.
    pub fn digest_with(&self, hash: DigestType) -> Result<Vec<u8>, DarwinCodesignError> {
        hash.digest_data(self.blob_entry.data)
    }
}

impl<'a> TryFrom<BlobEntry<'a>> for ParsedBlob<'a> {
    type Error = DarwinCodesignError;

    fn try_from(blob_entry: BlobEntry<'a>) -> Result<Self, Self::Error> {
        let blob = BlobData::from_blob_bytes(blob_entry.data)?;

        Ok(Self { blob_entry, blob })
    }
}

/// A lightly parsed superblob with [CodeSigningMagic::EmbeddedSignature].
pub struct EmbeddedSignature<'a> {
    /// Magic value from header.
    pub magic: CodeSigningMagic,
    /// Length of this super blob.
    pub length: u32,
    /// Number of blobs in this super blob.
    pub count: u32,

    /// Raw data backing this super blob.
    pub data: &'a [u8],

    /// All the blobs within this super blob.
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> std::fmt::Debug for EmbeddedSignature<'a> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("SuperBlob")
            .field("magic", &self.magic)
            .field("length", &self.length)
            .field("count", &self.count)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl<'a> EmbeddedSignature<'a> {
    /// Parse an embedded signature superblob.
    ///
    /// The input is the data `LC_CODE_SIGNATURE` points at. It may carry
    /// trailing zero padding past the superblob's declared length.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, DarwinCodesignError> {
        let offset = &mut 0;

        let magic = data.gread_with::<u32>(offset, scroll::BE)?.into();

        if magic != CodeSigningMagic::EmbeddedSignature {
            return Err(DarwinCodesignError::BadMagic(
                "embedded signature super blob",
            ));
        }

        let length = data.gread_with::<u32>(offset, scroll::BE)?;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        let data = data
            .get(..length as usize)
            .ok_or(DarwinCodesignError::SuperblobMalformed)?;

        let mut blob_indices = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let typ = data.gread_with::<u32>(offset, scroll::BE)?;
            let blob_offset = data.gread_with::<u32>(offset, scroll::BE)?;
            blob_indices.push((typ, blob_offset as usize));
        }

        let mut blobs = Vec::with_capacity(blob_indices.len());

        for (i, (typ, blob_offset)) in blob_indices.iter().enumerate() {
            // Bound each blob by the next index entry so a bogus length
            // can't reach into a neighbour.
            let end_offset = blob_indices
                .get(i + 1)
                .map(|(_, next)| *next)
                .unwrap_or(data.len());

            let full_slice = data
                .get(*blob_offset..end_offset)
                .ok_or(DarwinCodesignError::SuperblobMalformed)?;
            let (blob_magic, blob_length, _) = read_blob_header(full_slice)?;

            blobs.push(BlobEntry {
                index: i,
                slot: (*typ).into(),
                offset: *blob_offset,
                magic: blob_magic.into(),
                length: blob_length,
                data: &full_slice[..blob_length],
            });
        }

        Ok(Self {
            magic,
            length,
            count,
            data,
            blobs,
        })
    }

    /// Find the first occurrence of the specified slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    pub fn find_slot_parsed(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<ParsedBlob<'a>>, DarwinCodesignError> {
        if let Some(entry) = self.find_slot(slot) {
            Ok(Some(entry.clone().into_parsed_blob()?))
        } else {
            Ok(None)
        }
    }

    /// Resolve the primary code directory.
    ///
    /// Returns `Ok(None)` if there is no code directory slot.
    pub fn code_directory(&self) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, DarwinCodesignError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::CodeDirectory)? {
            if let BlobData::CodeDirectory(cd) = parsed.blob {
                Ok(Some(cd))
            } else {
                Err(DarwinCodesignError::BadMagic("code directory blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Resolve all code directories, primary first.
    pub fn all_code_directories(&self) -> Result<Vec<Box<CodeDirectoryBlob<'a>>>, DarwinCodesignError> {
        let mut res = Vec::new();

        for entry in self.blobs.iter().filter(|e| {
            e.slot == CodeSigningSlot::CodeDirectory || e.slot.is_alternate_code_directory()
        }) {
            match entry.clone().into_parsed_blob()?.blob {
                BlobData::CodeDirectory(cd) => res.push(cd),
                _ => return Err(DarwinCodesignError::BadMagic("code directory blob")),
            }
        }

        Ok(res)
    }

    /// Resolve the entitlements blob.
    pub fn entitlements(&self) -> Result<Option<Box<EntitlementsBlob<'a>>>, DarwinCodesignError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::Entitlements)? {
            if let BlobData::Entitlements(entitlements) = parsed.blob {
                Ok(Some(entitlements))
            } else {
                Err(DarwinCodesignError::BadMagic("entitlements blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Resolve the requirement set blob.
    pub fn code_requirements(
        &self,
    ) -> Result<Option<Box<RequirementSetBlob<'a>>>, DarwinCodesignError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::RequirementSet)? {
            if let BlobData::RequirementSet(reqs) = parsed.blob {
                Ok(Some(reqs))
            } else {
                Err(DarwinCodesignError::BadMagic("requirements blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Raw CMS signature data, if present.
    ///
    /// The returned data is likely DER PKCS#7 with the root object
    /// pkcs7-signedData (1.2.840.113549.1.7.2).
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, DarwinCodesignError> {
        if let Some(entry) = self.find_slot(CodeSigningSlot::Signature) {
            ParsedBlob::try_from(entry.clone())?;

            Ok(Some(entry.payload()?))
        } else {
            Ok(None)
        }
    }

    /// Obtain the parsed CMS [SignedData].
    pub fn signed_data(&self) -> Result<Option<SignedData>, DarwinCodesignError> {
        match self.signature_data()? {
            // An empty wrapper is treated as no signature at all.
            Some(data) if !data.is_empty() => Ok(Some(SignedData::parse_ber(data)?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_types() {
        assert_eq!(DigestType::Sha256.hash_len().unwrap(), 32);
        assert_eq!(DigestType::Sha1.hash_len().unwrap(), 20);
        assert_eq!(DigestType::Sha256Truncated.hash_len().unwrap(), 20);
        assert_eq!(DigestType::Sha384.hash_len().unwrap(), 48);

        assert!(matches!(
            DigestType::None.digest_data(b"foo"),
            Err(DarwinCodesignError::UnsupportedHashAlgorithm(_))
        ));
        assert!(matches!(
            DigestType::Unknown(42).hash_len(),
            Err(DarwinCodesignError::UnsupportedHashAlgorithm(_))
        ));
        assert!(matches!(
            DigestType::from_str("md5"),
            Err(DarwinCodesignError::UnsupportedHashAlgorithm(_))
        ));
        assert_eq!(DigestType::from_str("sha384").unwrap(), DigestType::Sha384);
        assert_eq!(DigestType::from(2), DigestType::Sha256);
    }

    #[test]
    fn superblob_sorted_and_aligned() {
        let blobs = vec![
            (
                CodeSigningSlot::Signature,
                BlobWrapperBlob::from_data_owned(vec![1, 2, 3])
                    .to_blob_bytes()
                    .unwrap(),
            ),
            (
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string("<plist/>")
                    .to_blob_bytes()
                    .unwrap(),
            ),
            (
                CodeSigningSlot::RequirementSet,
                RequirementSetBlob::default().to_blob_bytes().unwrap(),
            ),
        ];

        let data = create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter()).unwrap();
        assert_eq!(data.len() % 8, 0);
        assert_eq!(
            data.pread_with::<u32>(4, scroll::BE).unwrap() as usize,
            data.len()
        );

        let sig = EmbeddedSignature::from_bytes(&data).unwrap();
        assert_eq!(sig.count, 3);
        let slots = sig.blobs.iter().map(|b| b.slot).collect::<Vec<_>>();
        assert_eq!(
            slots,
            vec![
                CodeSigningSlot::RequirementSet,
                CodeSigningSlot::Entitlements,
                CodeSigningSlot::Signature
            ]
        );

        assert_eq!(sig.entitlements().unwrap().unwrap().as_str(), "<plist/>");
        assert!(sig.code_requirements().unwrap().unwrap().requirements.is_empty());
        assert_eq!(sig.signature_data().unwrap().unwrap(), &[1, 2, 3]);
        assert!(sig.code_directory().unwrap().is_none());

        for blob in &sig.blobs {
            assert_eq!(blob.offset % 4, 0);
        }
    }

    #[test]
    fn empty_requirement_set_layout() {
        let blob = RequirementSetBlob::default().to_blob_bytes().unwrap();
        assert_eq!(blob, vec![0xfa, 0xde, 0x0c, 0x01, 0, 0, 0, 0x0c, 0, 0, 0, 0]);
    }

    #[test]
    fn requirement_set_nesting() {
        let mut set = RequirementSetBlob::default();
        set.set_requirements(
            RequirementType::Designated,
            RequirementBlob::from_requirement_bytes(&[0, 0, 0, 1, 0, 0, 0, 6]).unwrap(),
        );
        let bytes = set.to_blob_bytes().unwrap();

        let parsed = RequirementSetBlob::from_blob_bytes(&bytes).unwrap();
        let req = &parsed.requirements[&RequirementType::Designated];
        assert_eq!(req.data.as_ref(), &[0, 0, 0, 1, 0, 0, 0, 6]);

        // A full requirement blob is accepted verbatim.
        let full = req.to_blob_bytes().unwrap();
        let again = RequirementBlob::from_requirement_bytes(&full).unwrap();
        assert_eq!(again.data, req.data);
    }

    #[test]
    fn malformed_superblobs() {
        assert!(matches!(
            EmbeddedSignature::from_bytes(&[0xfa, 0xde, 0x0c, 0xc1, 0, 0, 0, 12, 0, 0, 0, 0]),
            Err(DarwinCodesignError::BadMagic(_))
        ));

        // Declared length past the end of data.
        assert!(EmbeddedSignature::from_bytes(&[
            0xfa, 0xde, 0x0c, 0xc0, 0, 0, 1, 0, 0, 0, 0, 0
        ])
        .is_err());

        // Blob offset past the end of data.
        let data = [
            0xfa, 0xde, 0x0c, 0xc0, 0, 0, 0, 20, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0x40,
        ];
        assert!(EmbeddedSignature::from_bytes(&data).is_err());

        // Blob with a length larger than its slice.
        let data = [
            0xfa, 0xde, 0x0c, 0xc0, 0, 0, 0, 28, 0, 0, 0, 1, 0, 0, 0, 5, 0, 0, 0, 20, 0xfa, 0xde,
            0x71, 0x71, 0, 0, 0, 0x20,
        ];
        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(DarwinCodesignError::SuperblobMalformed)
        ));
    }

    #[test]
    fn special_slot_ranges() {
        assert!(CodeSigningSlot::Entitlements.is_code_directory_specials_expressible());
        assert!(CodeSigningSlot::Info.is_code_directory_specials_expressible());
        assert!(!CodeSigningSlot::CodeDirectory.is_code_directory_specials_expressible());
        assert!(!CodeSigningSlot::Signature.is_code_directory_specials_expressible());
        assert_eq!(
            CodeSigningSlot::alternate_code_directory(1),
            Some(CodeSigningSlot::AlternateCodeDirectory1)
        );
        assert_eq!(CodeSigningSlot::alternate_code_directory(5), None);
        assert_eq!(CodeSigningSlot::Signature.to_string(), "CMS Signature (65536)");
    }
}
