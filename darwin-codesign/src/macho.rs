// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O primitives related to code signing.

Signature data lives at the end of the `__LINKEDIT` segment and is referenced
by the `LC_CODE_SIGNATURE` load command. Everything in the file before the
signature data is covered by the code directory's page digests.
*/

use {
    crate::{
        embedded_signature::EmbeddedSignature, error::DarwinCodesignError,
        signing_settings::SigningSettings,
    },
    darwin_macho::{LoadCommand, MachOImage, Segment},
    goblin::mach::load_command::LC_CODE_SIGNATURE,
    log::debug,
};

pub const SEG_TEXT: &str = "__TEXT";
pub const SEG_LINKEDIT: &str = "__LINKEDIT";

/// Page size used for code digests.
pub const CODE_PAGE_SIZE: usize = 4096;

/// Alignment of the signature data within the file.
const SIGNATURE_ALIGNMENT: u64 = 16;

/// `__LINKEDIT` virtual sizes are rounded to this boundary.
const LINKEDIT_VM_ALIGNMENT: u64 = 16384;

fn align_up(value: u64, alignment: u64) -> u64 {
    match value % alignment {
        0 => value,
        remainder => value + alignment - remainder,
    }
}

/// Code signing operations on a single Mach-O image.
pub trait MachOSignable {
    /// Obtain the code signature in the image.
    ///
    /// Returns `Ok(None)` if no signature exists, `Ok(Some)` if it does, or
    /// `Err` if there is a parse error.
    fn code_signature(&self) -> Result<Option<EmbeddedSignature<'_>>, DarwinCodesignError>;

    /// File offsets of the start and end of the executable segment.
    fn executable_segment_boundary(&self) -> Result<(u64, u64), DarwinCodesignError>;

    /// The byte offset within the binary at which point "code" stops.
    ///
    /// If a signature is present, this is the offset of the signature data.
    /// Else it is where signature data would be placed.
    fn code_limit_binary_offset(&self) -> Result<u64, DarwinCodesignError>;

    /// Determines whether signature data can be written into this image.
    fn check_signing_capability(&self) -> Result<(), DarwinCodesignError>;

    /// Estimate the size in bytes of an embedded code signature.
    fn estimate_embedded_signature_size(
        &self,
        settings: &SigningSettings,
    ) -> Result<usize, DarwinCodesignError>;

    /// Write signature data, replacing any existing signature.
    ///
    /// `__LINKEDIT` is resized to end exactly at the end of the new data.
    fn write_signature_data(&mut self, signature: &[u8]) -> Result<(), DarwinCodesignError>;
}

fn linkedit_segment(image: &MachOImage) -> Result<&Segment, DarwinCodesignError> {
    image
        .segment(SEG_LINKEDIT)
        .ok_or(DarwinCodesignError::MissingLinkedit)
}

impl MachOSignable for MachOImage {
    fn code_signature(&self) -> Result<Option<EmbeddedSignature<'_>>, DarwinCodesignError> {
        match self.code_signature_command() {
            Some(lc) if lc.datasize > 0 => {
                let data = self
                    .file_data(lc.dataoff as usize, lc.datasize as usize)
                    .ok_or(DarwinCodesignError::SuperblobMalformed)?;

                Ok(Some(EmbeddedSignature::from_bytes(data)?))
            }
            _ => Ok(None),
        }
    }

    fn executable_segment_boundary(&self) -> Result<(u64, u64), DarwinCodesignError> {
        let segment = self
            .segment(SEG_TEXT)
            .ok_or(DarwinCodesignError::MissingText)?;

        Ok((segment.fileoff, segment.file_end()))
    }

    fn code_limit_binary_offset(&self) -> Result<u64, DarwinCodesignError> {
        let linkedit = linkedit_segment(self)?;

        match self.code_signature_command() {
            Some(lc) => Ok(lc.dataoff as u64),
            None => Ok(align_up(linkedit.file_end(), SIGNATURE_ALIGNMENT)),
        }
    }

    fn check_signing_capability(&self) -> Result<(), DarwinCodesignError> {
        let linkedit = linkedit_segment(self)?;

        // Growing __LINKEDIT only shifts data when it is the final segment.
        let last = self
            .segments()
            .filter(|s| s.filesize > 0)
            .max_by_key(|s| s.fileoff)
            .ok_or(DarwinCodesignError::MissingLinkedit)?;
        if last.name() != SEG_LINKEDIT {
            return Err(DarwinCodesignError::LinkeditNotLast);
        }

        if let Some(lc) = self.code_signature_command() {
            let start = lc.dataoff as u64;
            let end = start + lc.datasize as u64;

            if start < linkedit.fileoff || end != linkedit.file_end() {
                return Err(DarwinCodesignError::DataAfterSignature);
            }
        }

        Ok(())
    }

    fn estimate_embedded_signature_size(
        &self,
        settings: &SigningSettings,
    ) -> Result<usize, DarwinCodesignError> {
        // Assume the common data structures are 1024 bytes.
        let mut size = 1024;

        // Reserve room for the code digests, which are proportional to the
        // signed range.
        let pages = (self.code_limit_binary_offset()? as usize + CODE_PAGE_SIZE - 1)
            / CODE_PAGE_SIZE;
        let digests = std::iter::once(settings.digest_type())
            .chain(settings.extra_digests().iter().copied());
        for digest in digests {
            size += pages * digest.hash_len()?;
        }

        if let Some(entitlements) = settings.entitlements_xml() {
            size += entitlements.len();
        }
        if let Some(requirement) = settings.designated_requirement() {
            size += requirement.len();
        }

        // Assume the CMS data will take a fixed size.
        if settings.signing_key().is_some() {
            size += 4096;
        }

        // Long certificate chains could blow up the size. Account for those.
        for cert in settings.certificate_chain() {
            size += cert.constructed_data().len();
        }

        // Time-stamp tokens carry the server's certificates.
        if settings.time_stamp_url().is_some() {
            size += 8192;
        }

        // Align on 1k boundaries.
        size += 1024 - size % 1024;

        Ok(size)
    }

    fn write_signature_data(&mut self, signature: &[u8]) -> Result<(), DarwinCodesignError> {
        self.check_signing_capability()?;

        let linkedit = linkedit_segment(self)?;
        let linkedit_fileoff = linkedit.fileoff;
        let signature_offset = self.code_limit_binary_offset()?;

        let filesize = signature_offset - linkedit_fileoff + signature.len() as u64;
        let vmsize = align_up(filesize, LINKEDIT_VM_ALIGNMENT);

        let dataoff =
            u32::try_from(signature_offset).map_err(|_| DarwinCodesignError::InsufficientSpace)?;
        let datasize =
            u32::try_from(signature.len()).map_err(|_| DarwinCodesignError::InsufficientSpace)?;

        debug!(
            "writing {} bytes of signature data at offset {}",
            signature.len(),
            signature_offset
        );

        self.resize_segment(SEG_LINKEDIT, filesize, vmsize)?;

        let command = LoadCommand::linkedit_data(LC_CODE_SIGNATURE, dataoff, datasize);
        match self.find_command(LC_CODE_SIGNATURE) {
            Some((index, _)) => {
                self.replace_load_command(index, command)?;
            }
            None => {
                self.insert_load_command(command)?;
            }
        }

        self.write_bytes(signature_offset as usize, signature)?;

        Ok(())
    }
}
