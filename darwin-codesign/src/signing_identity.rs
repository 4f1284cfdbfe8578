// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing identities.
//!
//! An identity is either ad-hoc, carrying no key material, or a private key
//! with its certificate and issuing chain loaded from a PKCS#12 container.

use {
    crate::{
        cryptography::{parse_pfx_data, PfxContents},
        error::DarwinCodesignError,
    },
    log::{info, warn},
    std::path::Path,
    x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair},
    zeroize::Zeroizing,
};

/// Prefix of values naming an environment variable to read instead.
pub const ENV_PREFIX: &str = "env:";

/// Resolve `env:NAME` indirection.
///
/// Values without the prefix are returned as is.
pub fn resolve_env_indirection(value: &str) -> Result<Zeroizing<String>, DarwinCodesignError> {
    match value.strip_prefix(ENV_PREFIX) {
        Some(name) => {
            let resolved = std::env::var(name).map_err(|_| {
                DarwinCodesignError::SigningIdentity(format!(
                    "environment variable {} is not set",
                    name
                ))
            })?;

            Ok(Zeroizing::new(resolved))
        }
        None => Ok(Zeroizing::new(value.to_string())),
    }
}

/// Load PKCS#12 data given as a path, base64 content, or `env:NAME`.
///
/// An environment variable may itself hold either a path or base64 content.
pub fn resolve_p12_data(source: &str) -> Result<Zeroizing<Vec<u8>>, DarwinCodesignError> {
    let value = resolve_env_indirection(source)?;
    let value = value.trim();

    if value.is_empty() {
        return Err(DarwinCodesignError::SigningIdentity(
            "empty PKCS#12 source".to_string(),
        ));
    }

    let path = Path::new(value);
    if path.is_file() {
        info!("reading PKCS#12 data from {}", path.display());
        return Ok(Zeroizing::new(std::fs::read(path)?));
    }

    let compact = value
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect::<String>();

    base64::decode(compact).map(Zeroizing::new).map_err(|_| {
        DarwinCodesignError::SigningIdentity(
            "PKCS#12 source is neither an existing file nor base64 content".to_string(),
        )
    })
}

/// The material a binary is signed with.
pub enum SigningIdentity {
    /// Hash-only signature without a CMS blob.
    AdHoc,
    /// Certificate based signature.
    Certificate {
        signing_key: InMemorySigningKeyPair,
        certificate: CapturedX509Certificate,
        chain: Vec<CapturedX509Certificate>,
    },
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdHoc => f.write_str("AdHoc"),
            Self::Certificate {
                certificate, chain, ..
            } => f
                .debug_struct("Certificate")
                .field("certificate", certificate)
                .field("chain", chain)
                .finish_non_exhaustive(),
        }
    }
}

impl From<PfxContents> for SigningIdentity {
    fn from(contents: PfxContents) -> Self {
        Self::Certificate {
            signing_key: contents.signing_key,
            certificate: contents.certificate,
            chain: contents.chain,
        }
    }
}

impl SigningIdentity {
    /// Load an identity from a PKCS#12 source.
    ///
    /// `source` is a path, base64 content, or `env:NAME`. The password may
    /// also use `env:NAME`.
    pub fn from_p12_source(source: &str, password: &str) -> Result<Self, DarwinCodesignError> {
        let data = resolve_p12_data(source)?;
        let password = resolve_env_indirection(password)?;

        let contents = parse_pfx_data(&data, &password)?;
        info!(
            "loaded signing certificate with {} additional chain certificates",
            contents.chain.len()
        );
        if contents.chain.is_empty() {
            warn!("PKCS#12 data holds no issuing certificates");
        }

        Ok(contents.into())
    }

    pub fn is_ad_hoc(&self) -> bool {
        matches!(self, Self::AdHoc)
    }

    /// The private key and certificate used for CMS signatures.
    pub fn signing_key(&self) -> Option<(&InMemorySigningKeyPair, &CapturedX509Certificate)> {
        match self {
            Self::AdHoc => None,
            Self::Certificate {
                signing_key,
                certificate,
                ..
            } => Some((signing_key, certificate)),
        }
    }

    /// Issuing certificates accompanying the signing certificate.
    pub fn chain(&self) -> &[CapturedX509Certificate] {
        match self {
            Self::AdHoc => &[],
            Self::Certificate { chain, .. } => chain,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::cryptography::tests::make_pfx};

    #[test]
    fn ad_hoc() {
        let identity = SigningIdentity::AdHoc;
        assert!(identity.is_ad_hoc());
        assert!(identity.signing_key().is_none());
        assert!(identity.chain().is_empty());
    }

    #[test]
    fn p12_sources() {
        let (data, cert) = make_pfx("Leaf", None, None, "secret");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.p12");
        std::fs::write(&path, &data).unwrap();

        let from_path = SigningIdentity::from_p12_source(path.to_str().unwrap(), "secret").unwrap();
        let (_, loaded) = from_path.signing_key().unwrap();
        assert_eq!(loaded.constructed_data(), cert.constructed_data());

        let encoded = base64::encode(&data);
        let from_content = SigningIdentity::from_p12_source(&encoded, "secret").unwrap();
        assert!(!from_content.is_ad_hoc());

        std::env::set_var("DCODESIGN_TEST_P12_CONTENT", &encoded);
        std::env::set_var("DCODESIGN_TEST_P12_PASSWORD", "secret");
        let from_env = SigningIdentity::from_p12_source(
            "env:DCODESIGN_TEST_P12_CONTENT",
            "env:DCODESIGN_TEST_P12_PASSWORD",
        )
        .unwrap();
        assert!(from_env.signing_key().is_some());

        assert!(matches!(
            SigningIdentity::from_p12_source(&encoded, "wrong"),
            Err(DarwinCodesignError::PfxBadPassword)
        ));
    }

    #[test]
    fn bad_sources() {
        assert!(matches!(
            resolve_p12_data("env:DCODESIGN_TEST_UNSET_VARIABLE"),
            Err(DarwinCodesignError::SigningIdentity(_))
        ));
        assert!(matches!(
            resolve_p12_data("/nonexistent/file.p12"),
            Err(DarwinCodesignError::SigningIdentity(_))
        ));
        assert!(resolve_p12_data("").is_err());
    }
}
