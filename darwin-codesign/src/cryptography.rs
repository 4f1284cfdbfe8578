// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cryptographic primitives for loading signing material.

use {
    crate::error::DarwinCodesignError,
    log::debug,
    x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, Sign},
    zeroize::Zeroizing,
};

/// Signing material extracted from PFX data.
pub struct PfxContents {
    /// The certificate whose public key matches the private key.
    pub certificate: CapturedX509Certificate,
    /// The private key.
    pub signing_key: InMemorySigningKeyPair,
    /// Every other certificate in the container, in container order.
    pub chain: Vec<CapturedX509Certificate>,
}

impl std::fmt::Debug for PfxContents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PfxContents")
            .field("certificate", &self.certificate)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

fn bmp_string(s: &str) -> Zeroizing<Vec<u8>> {
    let utf16: Vec<u16> = s.encode_utf16().collect();

    let mut bytes = Vec::with_capacity(utf16.len() * 2 + 2);
    for c in utf16 {
        bytes.push((c / 256) as u8);
        bytes.push((c % 256) as u8);
    }
    bytes.push(0x00);
    bytes.push(0x00);

    Zeroizing::new(bytes)
}

/// Parse PFX data into a key pair and certificates.
///
/// PFX data is commonly encountered in `.p12` files, such as those created
/// when exporting certificates from Apple's `Keychain Access` application.
/// If no password was provided to create the PFX data, the password may be
/// the empty string.
pub fn parse_pfx_data(data: &[u8], password: &str) -> Result<PfxContents, DarwinCodesignError> {
    let pfx = p12::PFX::parse(data).map_err(|e| {
        DarwinCodesignError::PfxParseError(format!("data does not appear to be PFX: {:?}", e))
    })?;

    if !pfx.verify_mac(password) {
        return Err(DarwinCodesignError::PfxBadPassword);
    }

    // Exports hold regular data content info with inner ContentInfo
    // components holding the key and certificates.
    let data = match pfx.auth_safe {
        p12::ContentInfo::Data(data) => data,
        _ => {
            return Err(DarwinCodesignError::PfxParseError(
                "unexpected PFX content info".to_string(),
            ));
        }
    };

    let content_infos = yasna::parse_der(&data, |reader| {
        reader.collect_sequence_of(p12::ContentInfo::parse)
    })
    .map_err(|e| {
        DarwinCodesignError::PfxParseError(format!("failed parsing inner ContentInfo: {:?}", e))
    })?;

    let bmp_password = bmp_string(password);

    let mut certificates = vec![];
    let mut signing_key = None;

    for content in content_infos {
        let bags_data = match content {
            p12::ContentInfo::Data(inner) => inner,
            p12::ContentInfo::EncryptedData(encrypted) => {
                encrypted.data(&bmp_password).ok_or_else(|| {
                    DarwinCodesignError::PfxParseError(
                        "failed decrypting inner EncryptedData".to_string(),
                    )
                })?
            }
            p12::ContentInfo::OtherContext(_) => {
                return Err(DarwinCodesignError::PfxParseError(
                    "unexpected OtherContent content in inner PFX data".to_string(),
                ));
            }
        };

        let bags = yasna::parse_ber(&bags_data, |reader| {
            reader.collect_sequence_of(p12::SafeBag::parse)
        })
        .map_err(|e| {
            DarwinCodesignError::PfxParseError(format!(
                "failed parsing SafeBag within inner Data: {:?}",
                e
            ))
        })?;

        for bag in bags {
            match bag.bag {
                p12::SafeBagKind::CertBag(p12::CertBag::X509(cert_data)) => {
                    certificates.push(CapturedX509Certificate::from_der(cert_data)?);
                }
                p12::SafeBagKind::CertBag(p12::CertBag::SDSI(_)) => {
                    return Err(DarwinCodesignError::PfxParseError(
                        "unexpected SDSI certificate data".to_string(),
                    ));
                }
                p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                    let decrypted =
                        Zeroizing::new(key_bag.decrypt(&bmp_password).ok_or_else(|| {
                            DarwinCodesignError::PfxParseError(
                                "error decrypting PKCS8 shrouded key bag".to_string(),
                            )
                        })?);

                    signing_key = Some(
                        InMemorySigningKeyPair::from_pkcs8_der(decrypted.as_slice())
                            .map_err(|e| DarwinCodesignError::InvalidKey(e.to_string()))?,
                    );
                }
                p12::SafeBagKind::OtherBagKind(_) => {
                    debug!("ignoring unsupported bag type in PFX content");
                }
            }
        }
    }

    let signing_key = signing_key.ok_or_else(|| {
        DarwinCodesignError::PfxParseError("failed to find signing key in PFX data".to_string())
    })?;

    let public_key = signing_key.public_key_data();
    let leaf_index = certificates
        .iter()
        .position(|cert| cert.public_key_data() == public_key)
        .ok_or_else(|| {
            DarwinCodesignError::PfxParseError(
                "failed to find x509 certificate matching the signing key in PFX data"
                    .to_string(),
            )
        })?;
    let certificate = certificates.remove(leaf_index);

    Ok(PfxContents {
        certificate,
        signing_key,
        chain: certificates,
    })
}

/// SHA-256 fingerprint of a certificate, as lowercase hex.
pub fn certificate_sha256_fingerprint(cert: &CapturedX509Certificate) -> String {
    hex::encode(ring::digest::digest(&ring::digest::SHA256, cert.constructed_data()).as_ref())
}
