// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing mach-o binaries.

use {
    crate::{
        code_directory::{CodeDirectoryBlob, CodeSignatureFlags, ExecutableSegmentFlags},
        code_hash::paged_digests,
        embedded_signature::{
            BlobData, CodeSigningSlot, Digest, DigestType, EmbeddedSignature, EntitlementsBlob,
            RequirementBlob, RequirementSetBlob, RequirementType,
        },
        embedded_signature_builder::EmbeddedSignatureBuilder,
        error::DarwinCodesignError,
        macho::{MachOSignable, CODE_PAGE_SIZE},
        signing_settings::SigningSettings,
    },
    darwin_macho::{parse_version_nibbles, MachFile, MachOImage},
    goblin::mach::header::MH_EXECUTE,
    log::{debug, info, warn},
    std::{borrow::Cow, collections::BTreeMap},
};

/// Convert a [semver::Version] to a u32 with nibble encoding used by Mach-O.
pub fn semver_to_macho_target_version(version: &semver::Version) -> u32 {
    let major = version.major as u32;
    let minor = version.minor as u32;
    let patch = version.patch as u32;

    (major << 16) | ((minor & 0xff) << 8) | (patch & 0xff)
}

/// Mach-O binary signer.
///
/// Handles thin and fat binaries. Each architecture is signed independently.
///
/// # Circular Dependency
///
/// The code directory digests the file up to the signature data, which
/// includes the load commands recording the signature's offset and size.
/// Those can't be known until the code directory and CMS blob exist. So the
/// signature size is estimated first, a zero-filled placeholder of that size
/// is embedded, the code directory is computed over the resulting image, and
/// the real signature is written padded to the placeholder size.
#[derive(Debug)]
pub struct MachOSigner {
    file: MachFile,
}

impl MachOSigner {
    /// Construct an instance from unparsed Mach-O data, thin or fat.
    pub fn new(macho_data: &[u8]) -> Result<Self, DarwinCodesignError> {
        let file = MachFile::parse(macho_data)?;

        for image in file.images() {
            image.check_signing_capability()?;
        }

        Ok(Self { file })
    }

    /// Produce the signed binary.
    ///
    /// Slices of a fat binary are signed concurrently, one thread per slice.
    /// A failure in any slice fails the whole operation.
    pub fn sign(&self, settings: &SigningSettings) -> Result<Vec<u8>, DarwinCodesignError> {
        match &self.file {
            MachFile::Thin(image) => {
                info!("signing thin Mach-O binary");
                Ok(sign_image(image, settings)?.serialize()?)
            }
            MachFile::Fat(fat) => {
                let mut fat = fat.clone();

                let signed = std::thread::scope(|scope| {
                    let handles = fat
                        .slices()
                        .iter()
                        .enumerate()
                        .map(|(index, slice)| {
                            let image = &slice.image;
                            scope.spawn(move || {
                                info!("signing Mach-O binary at index {}", index);
                                sign_image(image, settings)
                            })
                        })
                        .collect::<Vec<_>>();

                    handles
                        .into_iter()
                        .enumerate()
                        .map(|(index, handle)| {
                            let result = handle.join().unwrap_or_else(|_| {
                                Err(DarwinCodesignError::SignatureBuilder(
                                    "signing thread panicked",
                                ))
                            });

                            result.map_err(|e| DarwinCodesignError::SliceSigning {
                                index,
                                source: Box::new(e),
                            })
                        })
                        .collect::<Vec<_>>()
                });

                for (slice, image) in fat.slices_mut().iter_mut().zip(signed) {
                    slice.image = image?;
                }

                Ok(fat.serialize()?)
            }
        }
    }
}

/// Sign a single image, returning the signed image.
pub fn sign_image(
    original: &MachOImage,
    settings: &SigningSettings,
) -> Result<MachOImage, DarwinCodesignError> {
    let previous_signature = original.code_signature()?;

    let placeholder_len = original.estimate_embedded_signature_size(settings)?;

    // Derive an intermediate image with placeholder NULLs for signature
    // data so code directory digests over the load commands are correct.
    let mut intermediate = original.clone();
    intermediate.write_signature_data(&vec![0u8; placeholder_len])?;
    let intermediate_data = intermediate.serialize()?;

    // Reparsing also catches malformed output.
    let intermediate = MachOImage::parse(&intermediate_data)?;

    let mut signature_data = create_superblob(
        settings,
        &intermediate,
        &intermediate_data,
        previous_signature.as_ref(),
    )?;
    info!("total signature size: {} bytes", signature_data.len());

    if signature_data.len() > placeholder_len {
        return Err(DarwinCodesignError::SignatureDataTooLarge {
            estimated: placeholder_len,
            actual: signature_data.len(),
        });
    }
    signature_data.resize(placeholder_len, 0);

    let mut signed = intermediate;
    signed.write_signature_data(&signature_data)?;

    Ok(signed)
}

/// Create data constituting the superblob embedded in `__LINKEDIT`.
///
/// `macho` and `macho_data` describe the image with the placeholder
/// signature already in place.
pub fn create_superblob(
    settings: &SigningSettings,
    macho: &MachOImage,
    macho_data: &[u8],
    previous_signature: Option<&EmbeddedSignature>,
) -> Result<Vec<u8>, DarwinCodesignError> {
    let mut builder = EmbeddedSignatureBuilder::default();

    for (slot, blob) in create_special_blobs(settings)? {
        builder.add_blob(slot, blob)?;
    }

    let code_directory = create_code_directory(
        settings,
        settings.digest_type(),
        macho,
        macho_data,
        previous_signature,
    )?;
    info!("code directory version: 0x{:x}", code_directory.version);

    builder.add_code_directory(code_directory)?;

    for digest_type in settings.extra_digests() {
        info!(
            "adding alternative code directory using digest {}",
            digest_type
        );
        let cd = create_code_directory(
            settings,
            *digest_type,
            macho,
            macho_data,
            previous_signature,
        )?;

        builder.add_alternative_code_directory(cd)?;
    }

    if let Some((signing_key, signing_cert)) = settings.signing_key() {
        builder.create_cms_signature(
            signing_key,
            signing_cert,
            settings.time_stamp_url(),
            settings.certificate_chain().iter().cloned(),
            settings.require_time_stamp(),
        )?;
    }

    builder.create_superblob()
}

/// Create the `CodeDirectory` for the current configuration.
pub fn create_code_directory(
    settings: &SigningSettings,
    digest_type: DigestType,
    macho: &MachOImage,
    macho_data: &[u8],
    previous_signature: Option<&EmbeddedSignature>,
) -> Result<CodeDirectoryBlob<'static>, DarwinCodesignError> {
    let target = macho.find_targeting();

    if let Some(target) = &target {
        info!(
            "binary targets {:?} >= {} with SDK {}",
            target.platform, target.minimum_os_version, target.sdk_version,
        );
    }

    let previous_cd = match previous_signature {
        Some(signature) => signature
            .all_code_directories()?
            .into_iter()
            .find(|cd| cd.hash_type == digest_type),
        None => None,
    };

    let mut flags = settings.code_signature_flags();

    // The adhoc flag is set when there is no CMS signature.
    if settings.signing_key().is_none() {
        info!("creating ad-hoc signature");
        flags |= CodeSignatureFlags::ADHOC;
    } else if flags.contains(CodeSignatureFlags::ADHOC) {
        info!("removing ad-hoc code signature flag");
        flags -= CodeSignatureFlags::ADHOC;
    }

    if flags.contains(CodeSignatureFlags::LINKER_SIGNED) {
        info!("removing linker signed flag from code signature");
        flags -= CodeSignatureFlags::LINKER_SIGNED;
    }

    let code_limit = macho.code_limit_binary_offset()?;

    let (exec_seg_base, exec_seg_limit) = macho.executable_segment_boundary()?;

    let exec_seg_flags = match settings.executable_segment_flags() {
        Some(flags) => Some(flags),
        None if macho.header().filetype == MH_EXECUTE => Some(ExecutableSegmentFlags::MAIN_BINARY),
        None => None,
    };

    // The runtime version is the SDK version from the targeting load commands.
    // Without it activation of the hardened runtime is incomplete.
    let runtime = if let Some(version) = settings.runtime_version() {
        info!(
            "using hardened runtime version {} from signing settings",
            version
        );
        Some(semver_to_macho_target_version(version))
    } else if let Some(version) = previous_cd.as_ref().and_then(|cd| cd.runtime) {
        info!(
            "copying hardened runtime version {} from previous code directory",
            parse_version_nibbles(version)
        );
        Some(version)
    } else if flags.contains(CodeSignatureFlags::RUNTIME) {
        match &target {
            Some(target) => {
                info!(
                    "using hardened runtime version {} derived from SDK version",
                    target.sdk_version
                );
                Some(semver_to_macho_target_version(&target.sdk_version))
            }
            None => {
                warn!("hardened runtime version required but unable to derive suitable version");
                None
            }
        }
    } else {
        None
    };

    let signed_data = macho_data
        .get(..code_limit as usize)
        .ok_or(DarwinCodesignError::InsufficientSpace)?;
    let code_digests = paged_digests(signed_data, digest_type, CODE_PAGE_SIZE)?
        .into_iter()
        .map(Digest::from)
        .collect::<Vec<_>>();
    debug!(
        "computed {} {} code digests over {} bytes",
        code_digests.len(),
        digest_type,
        code_limit
    );

    let ident = settings.binary_identifier().ok_or_else(|| {
        DarwinCodesignError::CliBadArgument("binary identifier is required".into())
    })?;

    let mut cd = CodeDirectoryBlob {
        version: 0,
        flags,
        code_limit: 0,
        hash_size: digest_type.hash_len()? as u8,
        hash_type: digest_type,
        platform: 0,
        page_size: CODE_PAGE_SIZE as u32,
        spare2: 0,
        scatter_offset: None,
        spare3: None,
        code_limit_64: None,
        exec_seg_base: Some(exec_seg_base),
        exec_seg_limit: Some(exec_seg_limit),
        exec_seg_flags,
        runtime,
        pre_encrypt_offset: None,
        linkage_hash_type: None,
        linkage_truncated: None,
        spare4: None,
        linkage_offset: None,
        linkage_size: None,
        ident: Cow::Owned(ident.to_string()),
        team_name: settings.team_id().map(|s| Cow::Owned(s.to_string())),
        code_digests,
        special_digests: BTreeMap::new(),
    };
    cd.set_code_limit(code_limit);

    // There is no corresponding blob for the info plist data since it is
    // provided externally to the embedded signature.
    if let Some(data) = settings.info_plist_data() {
        cd.set_slot_digest(CodeSigningSlot::Info, digest_type.digest_data(data)?)?;
    }

    cd.adjust_version(target.as_ref());
    cd.clear_newer_fields();

    Ok(cd)
}

/// Create blobs that need to be written given the current configuration.
///
/// This emits all blobs except `CodeDirectory` and `Signature`, which are
/// derived from the blobs emitted here.
pub fn create_special_blobs(
    settings: &SigningSettings,
) -> Result<Vec<(CodeSigningSlot, BlobData<'static>)>, DarwinCodesignError> {
    let mut res = Vec::new();

    let mut requirements = RequirementSetBlob::default();
    if let Some(expression) = settings.designated_requirement() {
        info!("using provided designated requirement");
        requirements.set_requirements(
            RequirementType::Designated,
            RequirementBlob {
                data: Cow::Owned(expression.to_vec()),
            },
        );
    }
    res.push((CodeSigningSlot::RequirementSet, requirements.into()));

    if let Some(entitlements) = settings.entitlements_xml() {
        info!("adding entitlements XML");
        res.push((
            CodeSigningSlot::Entitlements,
            EntitlementsBlob::from_string(entitlements).into(),
        ));
    }

    Ok(res)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        darwin_macho::{
            create_universal_macho,
            testing::{SyntheticImage, CPU_TYPE_X86_64},
            FatBinary,
        },
    };

    fn ad_hoc_settings(identifier: &str) -> SigningSettings<'static> {
        let mut settings = SigningSettings::default();
        settings.set_binary_identifier(identifier);
        settings
    }

    fn signed_code_directory(data: &[u8]) -> CodeDirectoryBlob<'static> {
        let image = MachOImage::parse(data).unwrap();
        let signature = image.code_signature().unwrap().unwrap();

        signature.code_directory().unwrap().unwrap().to_owned()
    }

    #[test]
    fn ad_hoc_thin() {
        let synthetic = SyntheticImage::default();
        let data = synthetic.build();

        let signed = MachOSigner::new(&data)
            .unwrap()
            .sign(&ad_hoc_settings("hello"))
            .unwrap();
        assert!(signed.len() >= data.len());

        let cd = signed_code_directory(&signed);
        assert_eq!(cd.ident, "hello");
        assert!(cd.flags.contains(CodeSignatureFlags::ADHOC));
        assert_eq!(cd.version, 0x20400);
        assert_eq!(cd.code_limit as usize, synthetic.file_size());
        assert_eq!(cd.code_digests.len(), 3);
        assert_eq!(cd.exec_seg_flags, Some(ExecutableSegmentFlags::MAIN_BINARY));
        assert!(cd.slot_digest(CodeSigningSlot::RequirementSet).is_some());

        // Page digests cover the signed output itself.
        for (i, digest) in cd.code_digests.iter().enumerate() {
            let start = i * CODE_PAGE_SIZE;
            let end = (start + CODE_PAGE_SIZE).min(cd.code_limit as usize);
            assert_eq!(
                digest.to_vec(),
                DigestType::Sha256.digest_data(&signed[start..end]).unwrap()
            );
        }
    }

    #[test]
    fn resigning_is_idempotent() {
        let data = SyntheticImage::arm64().build();
        let settings = ad_hoc_settings("idempotent");

        let first = MachOSigner::new(&data).unwrap().sign(&settings).unwrap();
        let second = MachOSigner::new(&first).unwrap().sign(&settings).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn hardened_runtime_uses_sdk_version() {
        let data = SyntheticImage::default().build();
        let mut settings = ad_hoc_settings("runtime");
        settings.add_code_signature_flags(
            CodeSignatureFlags::RUNTIME | CodeSignatureFlags::LINKER_SIGNED,
        );

        let signed = MachOSigner::new(&data).unwrap().sign(&settings).unwrap();
        let cd = signed_code_directory(&signed);

        assert_eq!(cd.runtime, Some(0x000c_0300));
        assert_eq!(cd.version, 0x20500);
        assert!(!cd.flags.contains(CodeSignatureFlags::LINKER_SIGNED));
    }

    #[test]
    fn alternate_digests_and_entitlements() {
        let data = SyntheticImage::default().build();
        let mut settings = ad_hoc_settings("multi");
        settings
            .set_digests([DigestType::Sha256, DigestType::Sha1])
            .unwrap();
        settings
            .set_entitlements_xml(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>com.apple.security.get-task-allow</key><true/></dict></plist>"#,
            )
            .unwrap();

        let signed = MachOSigner::new(&data).unwrap().sign(&settings).unwrap();
        let image = MachOImage::parse(&signed).unwrap();
        let signature = image.code_signature().unwrap().unwrap();

        let cds = signature.all_code_directories().unwrap();
        assert_eq!(cds.len(), 2);
        assert_eq!(cds[1].hash_type, DigestType::Sha1);
        assert!(signature
            .entitlements()
            .unwrap()
            .unwrap()
            .as_str()
            .contains("get-task-allow"));
        assert!(cds[0].slot_digest(CodeSigningSlot::Entitlements).is_some());
    }

    #[test]
    fn fat_slices_signed_independently() {
        let x86 = SyntheticImage::default().build();
        let arm = SyntheticImage::arm64().build();

        let mut fat_data = vec![];
        create_universal_macho(&mut fat_data, [x86.as_slice(), arm.as_slice()].into_iter())
            .unwrap();

        let signed = MachOSigner::new(&fat_data)
            .unwrap()
            .sign(&ad_hoc_settings("fat"))
            .unwrap();

        let fat = FatBinary::parse(&signed).unwrap();
        assert_eq!(fat.slices().len(), 2);
        assert_eq!(fat.slices()[0].arch.cputype, CPU_TYPE_X86_64);

        for (slice, original) in fat.slices().iter().zip([&x86, &arm]) {
            let data = slice.image.serialize().unwrap();
            // The unsigned prefix is unchanged apart from the load commands.
            let code_offset = 0x800;
            assert_eq!(data[code_offset..original.len()], original[code_offset..]);

            let thin_signed = MachOSigner::new(original)
                .unwrap()
                .sign(&ad_hoc_settings("fat"))
                .unwrap();
            assert_eq!(data, thin_signed);
        }
    }

    #[test]
    fn placeholder_too_small() {
        let data = SyntheticImage::default().build();
        let image = MachOImage::parse(&data).unwrap();
        let settings = ad_hoc_settings("small");

        let mut intermediate = image.clone();
        intermediate.write_signature_data(&[0u8; 16]).unwrap();
        let intermediate_data = intermediate.serialize().unwrap();
        let intermediate = MachOImage::parse(&intermediate_data).unwrap();

        let superblob = create_superblob(&settings, &intermediate, &intermediate_data, None).unwrap();
        assert!(superblob.len() > 16);
    }
}
