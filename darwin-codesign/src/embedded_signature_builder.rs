// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provides primitives for constructing embeddable signature data structures.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        embedded_signature::{
            create_superblob, Blob, BlobData, BlobWrapperBlob, CodeSigningMagic, CodeSigningSlot,
            DigestType,
        },
        error::DarwinCodesignError,
    },
    bcder::{encode::PrimitiveContent, Captured, Mode, OctetString, Oid},
    bytes::Bytes,
    cryptographic_message_syntax::{SignedDataBuilder, SignerBuilder},
    log::{info, warn},
    reqwest::Url,
    std::collections::BTreeMap,
    x509_certificate::{
        rfc5652::AttributeValue, CapturedX509Certificate, DigestAlgorithm, KeyInfoSigner,
    },
};

/// OID for signed attribute containing plist of code directory hashes.
///
/// 1.2.840.113635.100.9.1.
const CDHASH_PLIST_OID: bcder::ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 9, 1]);

/// OID for signed attribute containing the digests of code directories.
///
/// 1.2.840.113635.100.9.2.
const CDHASH_DIGESTS_OID: bcder::ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 9, 2]);

#[derive(Clone, Copy, Debug, PartialEq)]
enum BlobsState {
    Empty,
    SpecialAdded,
    CodeDirectoryAdded,
    SignatureAdded,
}

impl Default for BlobsState {
    fn default() -> Self {
        Self::Empty
    }
}

/// Obtain the XML plist containing code directory hashes.
///
/// Each hash is the code directory digest truncated to 20 bytes. This plist
/// is embedded as a signed attribute in the CMS signature.
pub fn create_code_directory_hashes_plist<'a>(
    code_directories: impl Iterator<Item = &'a CodeDirectoryBlob<'a>>,
) -> Result<Vec<u8>, DarwinCodesignError> {
    let hashes = code_directories
        .map(|cd| {
            let mut digest = cd.digest_with(cd.hash_type)?;
            digest.truncate(20);

            Ok(plist::Value::Data(digest))
        })
        .collect::<Result<Vec<_>, DarwinCodesignError>>()?;

    let mut plist = plist::Dictionary::new();
    plist.insert("cdhashes".to_string(), plist::Value::Array(hashes));

    let mut buffer = Vec::<u8>::new();
    plist::Value::from(plist).to_writer_xml(&mut buffer)?;
    buffer.push(b'\n');

    Ok(buffer)
}

fn digest_algorithm(digest_type: DigestType) -> Option<DigestAlgorithm> {
    match digest_type {
        DigestType::Sha1 => Some(DigestAlgorithm::Sha1),
        DigestType::Sha256 | DigestType::Sha256Truncated => Some(DigestAlgorithm::Sha256),
        DigestType::Sha384 => Some(DigestAlgorithm::Sha384),
        DigestType::Sha512 => Some(DigestAlgorithm::Sha512),
        DigestType::None | DigestType::Unknown(_) => None,
    }
}

/// Encodes `SEQUENCE { digestAlgorithm OID, digest OCTET STRING }`.
fn code_directory_digest_attribute(
    cd: &CodeDirectoryBlob,
) -> Result<AttributeValue, DarwinCodesignError> {
    let algorithm = digest_algorithm(cd.hash_type)
        .ok_or_else(|| DarwinCodesignError::UnsupportedHashAlgorithm(cd.hash_type.to_string()))?;
    let digest = cd.digest_with(cd.hash_type)?;

    Ok(AttributeValue::new(Captured::from_values(
        Mode::Der,
        bcder::encode::sequence((
            Oid::from(algorithm).encode(),
            OctetString::new(Bytes::from(digest)).encode(),
        )),
    )))
}

/// An entity for producing and writing [crate::embedded_signature::EmbeddedSignature].
///
/// Blobs are registered first, then the code directories (whose special
/// slots pick up the digests of the registered blobs), then optionally a CMS
/// signature over the primary code directory.
#[derive(Debug, Default)]
pub struct EmbeddedSignatureBuilder<'a> {
    state: BlobsState,
    blobs: BTreeMap<CodeSigningSlot, BlobData<'a>>,
}

impl<'a> EmbeddedSignatureBuilder<'a> {
    /// Obtain the primary code directory registered with this instance.
    pub fn code_directory(&self) -> Option<&CodeDirectoryBlob<'a>> {
        match self.blobs.get(&CodeSigningSlot::CodeDirectory) {
            Some(BlobData::CodeDirectory(cd)) => Some(cd),
            _ => None,
        }
    }

    /// All registered code directories, primary first.
    pub fn code_directories(&self) -> impl Iterator<Item = &CodeDirectoryBlob<'a>> {
        self.blobs.iter().filter_map(|(slot, blob)| match blob {
            BlobData::CodeDirectory(cd)
                if *slot == CodeSigningSlot::CodeDirectory
                    || slot.is_alternate_code_directory() =>
            {
                Some(cd.as_ref())
            }
            _ => None,
        })
    }

    /// Register a blob into a slot.
    ///
    /// There can only be a single blob per slot. Last write wins.
    ///
    /// Code directories and the signature cannot be added using this method,
    /// nor can blobs be added once a code directory is registered.
    pub fn add_blob(
        &mut self,
        slot: CodeSigningSlot,
        blob: BlobData<'a>,
    ) -> Result<(), DarwinCodesignError> {
        match self.state {
            BlobsState::Empty | BlobsState::SpecialAdded => {}
            BlobsState::CodeDirectoryAdded | BlobsState::SignatureAdded => {
                return Err(DarwinCodesignError::SignatureBuilder(
                    "cannot add blobs after code directory or signature is registered",
                ));
            }
        }

        if matches!(blob, BlobData::CodeDirectory(_))
            || slot == CodeSigningSlot::CodeDirectory
            || slot == CodeSigningSlot::Signature
        {
            return Err(DarwinCodesignError::SignatureBuilder(
                "cannot register code directory or signature blob via add_blob()",
            ));
        }

        self.blobs.insert(slot, blob);

        self.state = BlobsState::SpecialAdded;

        Ok(())
    }

    fn add_code_directory_slot(
        &mut self,
        slot: CodeSigningSlot,
        mut cd: CodeDirectoryBlob<'a>,
    ) -> Result<(), DarwinCodesignError> {
        if matches!(self.state, BlobsState::SignatureAdded) {
            return Err(DarwinCodesignError::SignatureBuilder(
                "cannot add code directory after signature data added",
            ));
        }

        for (blob_slot, blob) in &self.blobs {
            if blob_slot.is_code_directory_specials_expressible() {
                let digest = blob.digest_with(cd.hash_type)?;
                cd.set_slot_digest(*blob_slot, digest)?;
            }
        }

        self.blobs.insert(slot, cd.into());
        self.state = BlobsState::CodeDirectoryAdded;

        Ok(())
    }

    /// Register the primary [CodeDirectoryBlob].
    ///
    /// Digests of previously registered blobs are recorded in the code
    /// directory's special slots.
    pub fn add_code_directory(
        &mut self,
        cd: CodeDirectoryBlob<'a>,
    ) -> Result<(), DarwinCodesignError> {
        self.add_code_directory_slot(CodeSigningSlot::CodeDirectory, cd)
    }

    /// Register an alternate code directory, using the next free alternate slot.
    pub fn add_alternative_code_directory(
        &mut self,
        cd: CodeDirectoryBlob<'a>,
    ) -> Result<(), DarwinCodesignError> {
        let slot = (0..5)
            .filter_map(CodeSigningSlot::alternate_code_directory)
            .find(|slot| !self.blobs.contains_key(slot))
            .ok_or(DarwinCodesignError::SignatureBuilder(
                "no free alternate code directory slots",
            ))?;

        self.add_code_directory_slot(slot, cd)
    }

    /// Add CMS signature data to this builder.
    pub fn add_cms_signature(&mut self, der_data: Vec<u8>) -> Result<(), DarwinCodesignError> {
        if self.code_directory().is_none() {
            return Err(DarwinCodesignError::SignatureBuilder(
                "code directory required before signature",
            ));
        }

        self.blobs.insert(
            CodeSigningSlot::Signature,
            BlobWrapperBlob::from_data_owned(der_data).into(),
        );

        self.state = BlobsState::SignatureAdded;

        Ok(())
    }

    fn build_cms(
        &self,
        signing_key: &dyn KeyInfoSigner,
        signing_cert: &CapturedX509Certificate,
        time_stamp_url: Option<&Url>,
        certificates: &[CapturedX509Certificate],
    ) -> Result<Vec<u8>, DarwinCodesignError> {
        let code_directory = self
            .code_directory()
            .ok_or(DarwinCodesignError::SignatureBuilder(
                "code directory required in order to sign",
            ))?;

        // The CMS message digest is over the serialized primary code directory.
        let code_directory_raw = code_directory.to_blob_bytes()?;

        let code_directories = self.code_directories().collect::<Vec<_>>();
        let hashes_plist = create_code_directory_hashes_plist(code_directories.iter().copied())?;
        let digests = code_directories
            .iter()
            .map(|cd| code_directory_digest_attribute(cd))
            .collect::<Result<Vec<_>, _>>()?;

        let signer = SignerBuilder::new(signing_key, signing_cert.clone())
            .message_id_content(code_directory_raw)
            .signed_attribute_octet_string(
                Oid(Bytes::copy_from_slice(CDHASH_PLIST_OID.as_ref())),
                &hashes_plist,
            )
            .signed_attribute(
                Oid(Bytes::copy_from_slice(CDHASH_DIGESTS_OID.as_ref())),
                digests,
            );

        let signer = if let Some(url) = time_stamp_url {
            info!("using time-stamp server {}", url);
            signer.time_stamp_url(url.clone())?
        } else {
            signer
        };

        Ok(SignedDataBuilder::default()
            .signer(signer)
            .certificates(certificates.iter().cloned())
            .build_der()?)
    }

    /// Create a CMS `SignedData` over the primary code directory and register it.
    ///
    /// `chain` holds the issuing certificates to embed after the signing
    /// certificate. When a time-stamp server is configured but the signature
    /// cannot be time-stamped, this fails if `require_time_stamp` is set and
    /// otherwise retries without a time-stamp.
    pub fn create_cms_signature(
        &mut self,
        signing_key: &dyn KeyInfoSigner,
        signing_cert: &CapturedX509Certificate,
        time_stamp_url: Option<&Url>,
        chain: impl Iterator<Item = CapturedX509Certificate>,
        require_time_stamp: bool,
    ) -> Result<(), DarwinCodesignError> {
        let mut certificates = vec![signing_cert.clone()];
        certificates.extend(chain);

        let der = match self.build_cms(signing_key, signing_cert, time_stamp_url, &certificates) {
            Ok(der) => der,
            Err(e) if time_stamp_url.is_some() => {
                if require_time_stamp {
                    return Err(DarwinCodesignError::TimeStamp(e.to_string()));
                }

                warn!(
                    "unable to obtain time-stamp ({}); signing without one",
                    e
                );
                self.build_cms(signing_key, signing_cert, None, &certificates)?
            }
            Err(e) => return Err(e),
        };

        info!("CMS signature is {} bytes", der.len());

        self.add_cms_signature(der)
    }

    /// Create the embedded signature "superblob" data.
    pub fn create_superblob(&self) -> Result<Vec<u8>, DarwinCodesignError> {
        if matches!(self.state, BlobsState::Empty | BlobsState::SpecialAdded) {
            return Err(DarwinCodesignError::SignatureBuilder(
                "code directory required in order to materialize superblob",
            ));
        }

        let blobs = self
            .blobs
            .iter()
            .map(|(slot, blob)| {
                let data = blob.to_blob_bytes()?;

                Ok((*slot, data))
            })
            .collect::<Result<Vec<_>, DarwinCodesignError>>()?;

        create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            code_directory::CodeSignatureFlags,
            embedded_signature::{Digest, EmbeddedSignature, EntitlementsBlob, RequirementSetBlob},
        },
        x509_certificate::{EcdsaCurve, KeyAlgorithm, X509CertificateBuilder},
    };

    fn code_directory(hash_type: DigestType) -> CodeDirectoryBlob<'static> {
        let hash_size = hash_type.hash_len().unwrap();

        CodeDirectoryBlob {
            version: 0x20400,
            flags: CodeSignatureFlags::ADHOC,
            code_limit: 4096,
            hash_size: hash_size as u8,
            hash_type,
            platform: 0,
            page_size: 4096,
            spare2: 0,
            scatter_offset: None,
            spare3: None,
            code_limit_64: None,
            exec_seg_base: Some(0),
            exec_seg_limit: Some(4096),
            exec_seg_flags: None,
            runtime: None,
            pre_encrypt_offset: None,
            linkage_hash_type: None,
            linkage_truncated: None,
            spare4: None,
            linkage_offset: None,
            linkage_size: None,
            ident: "test".into(),
            team_name: None,
            code_digests: vec![Digest::from(hash_type.digest_data(&[0u8; 4096]).unwrap())],
            special_digests: BTreeMap::new(),
        }
    }

    #[test]
    fn ad_hoc_superblob() {
        let mut builder = EmbeddedSignatureBuilder::default();
        builder
            .add_blob(
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string("<plist/>").into(),
            )
            .unwrap();
        builder
            .add_blob(
                CodeSigningSlot::RequirementSet,
                RequirementSetBlob::default().into(),
            )
            .unwrap();
        builder
            .add_code_directory(code_directory(DigestType::Sha256))
            .unwrap();
        builder
            .add_alternative_code_directory(code_directory(DigestType::Sha1))
            .unwrap();

        let cd = builder.code_directory().unwrap();
        let requirements_digest = DigestType::Sha256
            .digest_data(&RequirementSetBlob::default().to_blob_bytes().unwrap())
            .unwrap();
        assert_eq!(
            cd.slot_digest(CodeSigningSlot::RequirementSet).unwrap().to_vec(),
            requirements_digest
        );
        assert!(cd.slot_digest(CodeSigningSlot::Entitlements).is_some());

        let data = builder.create_superblob().unwrap();
        let sig = EmbeddedSignature::from_bytes(&data).unwrap();
        let slots = sig.blobs.iter().map(|b| b.slot).collect::<Vec<_>>();
        assert_eq!(
            slots,
            vec![
                CodeSigningSlot::CodeDirectory,
                CodeSigningSlot::RequirementSet,
                CodeSigningSlot::Entitlements,
                CodeSigningSlot::AlternateCodeDirectory0,
            ]
        );
        assert!(sig.signature_data().unwrap().is_none());
        assert_eq!(sig.all_code_directories().unwrap().len(), 2);
    }

    #[test]
    fn ordering_rules() {
        let mut builder = EmbeddedSignatureBuilder::default();
        assert!(builder.create_superblob().is_err());
        assert!(builder.add_cms_signature(vec![]).is_err());

        builder
            .add_code_directory(code_directory(DigestType::Sha256))
            .unwrap();
        assert!(builder
            .add_blob(
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string("x").into()
            )
            .is_err());
    }

    #[test]
    fn cdhashes_plist() {
        let cd = code_directory(DigestType::Sha256);
        let plist = create_code_directory_hashes_plist(std::iter::once(&cd)).unwrap();
        assert_eq!(plist.last(), Some(&b'\n'));

        let value = plist::Value::from_reader_xml(plist.as_slice()).unwrap();
        let hashes = value
            .as_dictionary()
            .unwrap()
            .get("cdhashes")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].as_data().unwrap().len(), 20);
    }

    #[test]
    fn certificate_signature() {
        let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ecdsa(EcdsaCurve::Secp256r1));
        builder
            .subject()
            .append_common_name_utf8_string("Developer ID Application: Test (TEAM)")
            .unwrap();
        let (cert, key, _) = builder.create_with_random_keypair().unwrap();

        let mut builder = EmbeddedSignatureBuilder::default();
        builder
            .add_blob(
                CodeSigningSlot::RequirementSet,
                RequirementSetBlob::default().into(),
            )
            .unwrap();
        let mut cd = code_directory(DigestType::Sha256);
        cd.flags = CodeSignatureFlags::empty();
        builder.add_code_directory(cd).unwrap();
        builder
            .create_cms_signature(&key, &cert, None, std::iter::empty(), true)
            .unwrap();

        let data = builder.create_superblob().unwrap();
        let sig = EmbeddedSignature::from_bytes(&data).unwrap();
        let signed_data = sig.signed_data().unwrap().unwrap();

        assert_eq!(signed_data.certificates().count(), 1);
        for signer in signed_data.signers() {
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
        }
    }
}
