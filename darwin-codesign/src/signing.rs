// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High level signing primitives.

use {
    crate::{
        chain_policy::{ChainPolicy, IssuerLinkedChainPolicy},
        code_directory::ExecutableSegmentFlags,
        error::DarwinCodesignError,
        macho_signing::MachOSigner,
        signing_settings::SigningSettings,
    },
    log::{info, warn},
    std::{io::Write, path::Path},
};

/// Signs Mach-O files on the filesystem.
pub struct UnifiedSigner<'key> {
    settings: SigningSettings<'key>,
    chain_policy: Box<dyn ChainPolicy>,
    fail_without_full_chain: bool,
}

impl<'key> UnifiedSigner<'key> {
    /// Construct a new instance bound to a [SigningSettings].
    ///
    /// Chains are checked with [IssuerLinkedChainPolicy] and an incomplete
    /// chain fails signing.
    pub fn new(mut settings: SigningSettings<'key>) -> Self {
        settings.set_require_time_stamp(true);

        Self {
            settings,
            chain_policy: Box::new(IssuerLinkedChainPolicy::default()),
            fail_without_full_chain: true,
        }
    }

    /// Replace the chain completeness policy.
    pub fn with_chain_policy(mut self, policy: Box<dyn ChainPolicy>) -> Self {
        self.chain_policy = policy;
        self
    }

    /// Whether an incomplete chain or a failed time-stamp request is fatal.
    pub fn set_fail_without_full_chain(&mut self, value: bool) {
        self.fail_without_full_chain = value;
        self.settings.set_require_time_stamp(value);
    }

    pub fn settings(&self) -> &SigningSettings<'key> {
        &self.settings
    }

    /// Check the signing certificate chain against the chain policy.
    ///
    /// Ad-hoc signing always passes. This runs before any network access.
    pub fn check_chain(&self) -> Result<(), DarwinCodesignError> {
        let (_, cert) = match self.settings.signing_key() {
            Some(key) => key,
            None => return Ok(()),
        };

        match self
            .chain_policy
            .check_chain(cert, self.settings.certificate_chain())
        {
            Ok(()) => Ok(()),
            Err(e) if self.fail_without_full_chain => Err(e),
            Err(e) => {
                warn!("{}; continuing with incomplete chain", e);
                Ok(())
            }
        }
    }

    /// Sign a filesystem path in place.
    pub fn sign_path_in_place(&self, path: impl AsRef<Path>) -> Result<(), DarwinCodesignError> {
        let path = path.as_ref();

        self.sign_path(path, path)
    }

    /// Signs `input_path` and writes the signed output to `output_path`.
    ///
    /// Without an explicit identifier, the file name of `input_path` is used.
    /// Output is written to a temporary file next to `output_path` and
    /// renamed over it, so a failure leaves any existing file untouched.
    /// Permissions of the input are carried to the output.
    pub fn sign_path(
        &self,
        input_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<(), DarwinCodesignError> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        self.sign_macho(input_path, output_path)
            .map_err(|e| e.in_stage("signing", input_path))
    }

    fn sign_macho(&self, input_path: &Path, output_path: &Path) -> Result<(), DarwinCodesignError> {
        self.check_chain()?;

        let mut settings = self.settings.clone();

        if settings.binary_identifier().is_none() {
            let identifier = input_path
                .file_name()
                .ok_or_else(|| {
                    DarwinCodesignError::CliGeneralError(
                        "unable to resolve file name of binary".into(),
                    )
                })?
                .to_string_lossy();

            info!("setting binary identifier to {}", identifier);
            settings.set_binary_identifier(identifier);
        }

        if settings.executable_segment_flags().is_none() {
            settings.set_executable_segment_flags(ExecutableSegmentFlags::MAIN_BINARY);
        }

        info!("signing {} as a Mach-O binary", input_path.display());
        let macho_data = std::fs::read(input_path)?;
        let permissions = std::fs::metadata(input_path)?.permissions();

        let signer = MachOSigner::new(&macho_data)?;
        let signed = signer.sign(&settings)?;

        let directory = match output_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        info!("writing {}", output_path.display());
        let mut temp = tempfile::NamedTempFile::new_in(directory)?;
        temp.write_all(&signed)?;
        temp.as_file().sync_all()?;
        std::fs::set_permissions(temp.path(), permissions)?;
        temp.persist(output_path).map_err(|e| e.error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            cryptography::tests::{make_ca, make_pfx},
            macho::MachOSignable,
            signing_identity::SigningIdentity,
        },
        darwin_macho::{testing::SyntheticImage, MachOImage},
    };

    #[test]
    fn ad_hoc_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        let original = SyntheticImage::default().build();
        std::fs::write(&path, &original).unwrap();

        let identity = SigningIdentity::AdHoc;
        UnifiedSigner::new(SigningSettings::from_identity(&identity))
            .sign_path_in_place(&path)
            .unwrap();

        let signed = std::fs::read(&path).unwrap();
        assert!(signed.len() > original.len());

        let image = MachOImage::parse(&signed).unwrap();
        let signature = image.code_signature().unwrap().unwrap();
        assert_eq!(signature.code_directory().unwrap().unwrap().ident, "tool");
        assert!(signature.signed_data().unwrap().is_none());
    }

    #[test]
    fn full_chain_required_by_default() {
        let identity = SigningIdentity::AdHoc;

        let mut signer = UnifiedSigner::new(SigningSettings::from_identity(&identity));
        assert!(signer.fail_without_full_chain);
        assert!(signer.settings().require_time_stamp());

        signer.set_fail_without_full_chain(false);
        assert!(!signer.fail_without_full_chain);
        assert!(!signer.settings().require_time_stamp());
    }

    #[cfg(unix)]
    #[test]
    fn permissions_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exe");
        std::fs::write(&path, SyntheticImage::default().build()).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o751)).unwrap();

        let identity = SigningIdentity::AdHoc;
        UnifiedSigner::new(SigningSettings::from_identity(&identity))
            .sign_path_in_place(&path)
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o751);
    }

    #[test]
    fn failure_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, b"not a mach-o binary").unwrap();

        let identity = SigningIdentity::AdHoc;
        let err = UnifiedSigner::new(SigningSettings::from_identity(&identity))
            .sign_path_in_place(&path)
            .unwrap_err();

        assert!(matches!(err, DarwinCodesignError::Stage { stage: "signing", .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"not a mach-o binary");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn incomplete_chain_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signed");
        let original = SyntheticImage::default().build();
        std::fs::write(&path, &original).unwrap();

        let (p12, _) = make_pfx("Developer ID Application: Test", Some("Missing CA"), None, "");
        let identity = SigningIdentity::from_p12_source(&base64::encode(&p12), "").unwrap();

        // A time-stamp server that is never contacted: the chain check fails first.
        let mut settings = SigningSettings::from_identity(&identity);
        settings
            .set_time_stamp_server("http://127.0.0.1:9/unreachable")
            .unwrap();

        let err = UnifiedSigner::new(settings.clone())
            .sign_path_in_place(&path)
            .unwrap_err();
        assert!(err.to_string().contains("certificate chain is incomplete"));
        assert_eq!(std::fs::read(&path).unwrap(), original);

        // Without the policy the signature proceeds, without time-stamp.
        let mut signer = UnifiedSigner::new(settings);
        signer.set_fail_without_full_chain(false);
        signer.sign_path_in_place(&path).unwrap();

        let signed = std::fs::read(&path).unwrap();
        let image = MachOImage::parse(&signed).unwrap();
        let signature = image.code_signature().unwrap().unwrap();
        let signed_data = signature.signed_data().unwrap().unwrap();
        assert_eq!(signed_data.certificates().count(), 1);
        for signer in signed_data.signers() {
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
        }
    }

    #[test]
    fn complete_chain_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signed");
        std::fs::write(&path, SyntheticImage::arm64().build()).unwrap();

        let ca = make_ca("Test Intermediate", "Apple Root CA");
        let (p12, _) = make_pfx("Leaf", Some("Test Intermediate"), Some(&ca), "pw");
        let identity = SigningIdentity::from_p12_source(&base64::encode(&p12), "pw").unwrap();

        UnifiedSigner::new(SigningSettings::from_identity(&identity))
            .sign_path_in_place(&path)
            .unwrap();

        let image = MachOImage::parse(&std::fs::read(&path).unwrap()).unwrap();
        let signature = image.code_signature().unwrap().unwrap();
        assert_eq!(
            signature.signed_data().unwrap().unwrap().certificates().count(),
            2
        );
        assert!(!signature
            .code_directory()
            .unwrap()
            .unwrap()
            .flags
            .contains(crate::code_directory::CodeSignatureFlags::ADHOC));
    }
}
