// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing settings.

use {
    crate::{
        code_directory::{CodeSignatureFlags, ExecutableSegmentFlags},
        embedded_signature::{DigestType, RequirementBlob},
        error::DarwinCodesignError,
        signing_identity::SigningIdentity,
    },
    log::info,
    reqwest::{IntoUrl, Url},
    x509_certificate::{CapturedX509Certificate, KeyInfoSigner},
};

/// Time-stamp server used when none is configured.
pub const DEFAULT_TIME_STAMP_URL: &str = "http://timestamp.apple.com/ts01";

/// Represents code signing settings.
///
/// Instances are cheap to clone and hold borrowed references to the signing
/// key so one key can be shared by the threads signing fat binary slices.
#[derive(Clone, Default)]
pub struct SigningSettings<'key> {
    signing_key: Option<(&'key (dyn KeyInfoSigner + Sync), CapturedX509Certificate)>,
    certificates: Vec<CapturedX509Certificate>,
    time_stamp_url: Option<Url>,
    require_time_stamp: bool,
    digest_type: DigestType,
    extra_digests: Vec<DigestType>,
    identifier: Option<String>,
    team_id: Option<String>,
    entitlements_xml: Option<String>,
    designated_requirement: Option<Vec<u8>>,
    code_signature_flags: CodeSignatureFlags,
    executable_segment_flags: Option<ExecutableSegmentFlags>,
    info_plist_data: Option<Vec<u8>>,
    runtime_version: Option<semver::Version>,
}

impl<'key> std::fmt::Debug for SigningSettings<'key> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningSettings")
            .field("signing_certificate", &self.signing_key.as_ref().map(|(_, c)| c))
            .field("certificates", &self.certificates.len())
            .field("time_stamp_url", &self.time_stamp_url)
            .field("digest_type", &self.digest_type)
            .field("extra_digests", &self.extra_digests)
            .field("identifier", &self.identifier)
            .field("team_id", &self.team_id)
            .field("code_signature_flags", &self.code_signature_flags)
            .finish_non_exhaustive()
    }
}

impl<'key> SigningSettings<'key> {
    /// Construct settings bound to a [SigningIdentity].
    ///
    /// Ad-hoc identities leave the settings without a signing key.
    pub fn from_identity(identity: &'key SigningIdentity) -> Self {
        let mut settings = Self::default();

        if let Some((key, cert)) = identity.signing_key() {
            settings.set_signing_key(key, cert.clone());
            for cert in identity.chain() {
                settings.chain_certificate(cert.clone());
            }
        }

        settings
    }

    /// The primary digest type, used for the primary code directory.
    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    pub fn set_digest_type(&mut self, digest_type: DigestType) {
        self.digest_type = digest_type;
    }

    /// Digest types for alternate code directories.
    pub fn extra_digests(&self) -> &[DigestType] {
        &self.extra_digests
    }

    /// Register an alternate code directory digest type.
    ///
    /// Duplicates and the primary digest type are ignored.
    pub fn add_extra_digest(&mut self, digest_type: DigestType) {
        if digest_type != self.digest_type && !self.extra_digests.contains(&digest_type) {
            self.extra_digests.push(digest_type);
        }
    }

    /// Set the primary and alternate digests from an ordered list.
    pub fn set_digests(
        &mut self,
        digests: impl IntoIterator<Item = DigestType>,
    ) -> Result<(), DarwinCodesignError> {
        let mut digests = digests.into_iter();

        let primary = digests.next().ok_or_else(|| {
            DarwinCodesignError::CliBadArgument("at least one digest is required".into())
        })?;
        primary.hash_len()?;

        self.digest_type = primary;
        self.extra_digests.clear();
        for digest in digests {
            digest.hash_len()?;
            self.add_extra_digest(digest);
        }

        Ok(())
    }

    /// The signing key and certificate, if certificate signing is used.
    pub fn signing_key(&self) -> Option<(&'key (dyn KeyInfoSigner + Sync), &CapturedX509Certificate)> {
        self.signing_key.as_ref().map(|(key, cert)| (*key, cert))
    }

    pub fn set_signing_key(
        &mut self,
        private: &'key (dyn KeyInfoSigner + Sync),
        public: CapturedX509Certificate,
    ) {
        self.signing_key = Some((private, public));
    }

    /// Issuing certificates embedded after the signing certificate.
    pub fn certificate_chain(&self) -> &[CapturedX509Certificate] {
        &self.certificates
    }

    pub fn chain_certificate(&mut self, cert: CapturedX509Certificate) {
        self.certificates.push(cert);
    }

    pub fn time_stamp_url(&self) -> Option<&Url> {
        self.time_stamp_url.as_ref()
    }

    /// Set the time-stamp server.
    ///
    /// The value `none` disables time-stamping.
    pub fn set_time_stamp_url(&mut self, url: impl IntoUrl) -> Result<(), DarwinCodesignError> {
        let url = url.into_url()?;
        info!("using time-stamp server {}", url);
        self.time_stamp_url = Some(url);

        Ok(())
    }

    /// Set the time-stamp server from a configuration string.
    pub fn set_time_stamp_server(&mut self, value: &str) -> Result<(), DarwinCodesignError> {
        match value.trim() {
            "" | "none" => {
                info!("time-stamping disabled");
                self.time_stamp_url = None;
                Ok(())
            }
            url => self.set_time_stamp_url(url),
        }
    }

    /// Whether a time-stamp failure fails signing.
    pub fn require_time_stamp(&self) -> bool {
        self.require_time_stamp
    }

    pub fn set_require_time_stamp(&mut self, value: bool) {
        self.require_time_stamp = value;
    }

    pub fn binary_identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn set_binary_identifier(&mut self, value: impl ToString) {
        self.identifier = Some(value.to_string());
    }

    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    pub fn set_team_id(&mut self, value: impl ToString) {
        self.team_id = Some(value.to_string());
    }

    /// Entitlements plist XML.
    pub fn entitlements_xml(&self) -> Option<&str> {
        self.entitlements_xml.as_deref()
    }

    /// Set entitlements from plist XML.
    ///
    /// The content is validated as a plist before it is accepted.
    pub fn set_entitlements_xml(&mut self, value: impl ToString) -> Result<(), DarwinCodesignError> {
        let value = value.to_string();
        plist::Value::from_reader_xml(value.as_bytes())?;
        self.entitlements_xml = Some(value);

        Ok(())
    }

    /// Compiled designated requirement expression.
    pub fn designated_requirement(&self) -> Option<&[u8]> {
        self.designated_requirement.as_deref()
    }

    /// Set the designated requirement from compiled expression bytes.
    pub fn set_designated_requirement_bytes(
        &mut self,
        data: impl AsRef<[u8]>,
    ) -> Result<(), DarwinCodesignError> {
        let blob = RequirementBlob::from_requirement_bytes(data.as_ref())?;
        self.designated_requirement = Some(blob.data.to_vec());

        Ok(())
    }

    pub fn code_signature_flags(&self) -> CodeSignatureFlags {
        self.code_signature_flags
    }

    pub fn add_code_signature_flags(&mut self, flags: CodeSignatureFlags) {
        self.code_signature_flags |= flags;
    }

    pub fn executable_segment_flags(&self) -> Option<ExecutableSegmentFlags> {
        self.executable_segment_flags
    }

    pub fn set_executable_segment_flags(&mut self, flags: ExecutableSegmentFlags) {
        self.executable_segment_flags = Some(flags);
    }

    /// Info.plist content whose digest goes in the info special slot.
    pub fn info_plist_data(&self) -> Option<&[u8]> {
        self.info_plist_data.as_deref()
    }

    pub fn set_info_plist_data(&mut self, data: Vec<u8>) {
        self.info_plist_data = Some(data);
    }

    /// Explicit hardened runtime version, overriding the binary's SDK version.
    pub fn runtime_version(&self) -> Option<&semver::Version> {
        self.runtime_version.as_ref()
    }

    pub fn set_runtime_version(&mut self, version: semver::Version) {
        self.runtime_version = Some(version);
    }
}
