// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Introspection of Mach-O binaries and signing material.

use {
    crate::{
        chain_policy::display_name,
        cryptography::{certificate_sha256_fingerprint, PfxContents},
        embedded_signature::{BlobEntry, DigestType, EmbeddedSignature},
        error::DarwinCodesignError,
        macho::MachOSignable,
    },
    cryptographic_message_syntax::{SignedData, SignerInfo},
    darwin_macho::{MachFile, MachOImage},
    goblin::mach::{header::filetype_to_str, load_command::cmd_to_str},
    serde::Serialize,
    std::fmt::Write,
    x509_certificate::CapturedX509Certificate,
};

#[derive(Clone, Debug, Serialize)]
pub struct BlobDescription {
    pub slot: String,
    pub magic: String,
    pub length: u32,
    pub sha256: String,
}

impl<'a> TryFrom<&BlobEntry<'a>> for BlobDescription {
    type Error = DarwinCodesignError;

    fn try_from(entry: &BlobEntry<'a>) -> Result<Self, Self::Error> {
        Ok(Self {
            slot: format!("{:?}", entry.slot),
            magic: format!("{:x}", u32::from(entry.magic)),
            length: entry.length as _,
            sha256: hex::encode(entry.digest_with(DigestType::Sha256)?),
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub sha256_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_algorithm: Option<String>,
}

impl From<&CapturedX509Certificate> for CertificateInfo {
    fn from(cert: &CapturedX509Certificate) -> Self {
        let serial: &[u8] = cert.serial_number_asn1().as_ref();

        Self {
            subject: display_name(cert.subject_name()),
            issuer: display_name(cert.issuer_name()),
            serial_number: hex::encode(serial),
            sha256_fingerprint: certificate_sha256_fingerprint(cert),
            key_algorithm: cert.key_algorithm().map(|x| x.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CmsSigner {
    pub issuer: String,
    pub digest_algorithm: String,
    pub signature_algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_time: Option<chrono::DateTime<chrono::Utc>>,
    pub signature_verifies: bool,
    pub time_stamped: bool,
}

impl CmsSigner {
    pub fn from_signer_info_and_signed_data(
        signer_info: &SignerInfo,
        signed_data: &SignedData,
    ) -> Result<Self, DarwinCodesignError> {
        let signing_time = signer_info
            .signed_attributes()
            .and_then(|sa| sa.signing_time().copied());

        Ok(Self {
            issuer: signer_info
                .certificate_issuer_and_serial()
                .map(|(name, _)| display_name(name))
                .unwrap_or_default(),
            digest_algorithm: signer_info.digest_algorithm().to_string(),
            signature_algorithm: signer_info.signature_algorithm().to_string(),
            signing_time,
            signature_verifies: signer_info
                .verify_signature_with_signed_data(signed_data)
                .is_ok(),
            time_stamped: signer_info.time_stamp_token_signed_data()?.is_some(),
        })
    }
}

/// High-level representation of a CMS signature.
#[derive(Clone, Debug, Serialize)]
pub struct CmsSignature {
    pub certificates: Vec<CertificateInfo>,
    pub signers: Vec<CmsSigner>,
}

impl TryFrom<SignedData> for CmsSignature {
    type Error = DarwinCodesignError;

    fn try_from(signed_data: SignedData) -> Result<Self, Self::Error> {
        let certificates = signed_data
            .certificates()
            .map(CertificateInfo::from)
            .collect::<Vec<_>>();

        let signers = signed_data
            .signers()
            .map(|x| CmsSigner::from_signer_info_and_signed_data(x, &signed_data))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            certificates,
            signers,
        })
    }
}

/// High level representation of a code signature.
#[derive(Clone, Debug, Serialize)]
pub struct CodeSignature {
    /// Length of the code signature data.
    pub superblob_length: u32,
    pub blob_count: u32,
    pub blobs: Vec<BlobDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_entity_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_segment_flags: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub slot_digests: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub code_digests: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternative_digest_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements_plist: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub code_requirements: Vec<String>,
    pub cms: Option<CmsSignature>,
}

impl<'a> TryFrom<EmbeddedSignature<'a>> for CodeSignature {
    type Error = DarwinCodesignError;

    fn try_from(sig: EmbeddedSignature<'a>) -> Result<Self, Self::Error> {
        let mut version = None;
        let mut flags = None;
        let mut identifier = None;
        let mut team_name = None;
        let mut signed_entity_size = None;
        let mut digest_type = None;
        let mut runtime_version = None;
        let mut executable_segment_flags = None;
        let mut slot_digests = vec![];
        let mut code_digests = vec![];
        let mut entitlements_plist = None;
        let mut code_requirements = vec![];
        let mut cms = None;

        if let Some(cd) = sig.code_directory()? {
            version = Some(format!("0x{:x}", cd.version));
            flags = Some(format!("{:?}", cd.flags));
            identifier = Some(cd.ident.to_string());
            team_name = cd.team_name.as_ref().map(|x| x.to_string());
            signed_entity_size = Some(cd.code_limit_64.unwrap_or(cd.code_limit as u64));
            digest_type = Some(format!("{}", cd.hash_type));
            runtime_version = cd
                .runtime
                .map(|x| darwin_macho::parse_version_nibbles(x).to_string());
            executable_segment_flags = cd.exec_seg_flags.map(|x| format!("{:?}", x));

            slot_digests = cd
                .special_digests
                .iter()
                .map(|(slot, digest)| format!("{:?}: {}", slot, digest.as_hex()))
                .collect::<Vec<_>>();

            code_digests = cd
                .code_digests
                .iter()
                .map(|digest| digest.as_hex())
                .collect::<Vec<_>>();
        }

        let alternative_digest_types = sig
            .all_code_directories()?
            .iter()
            .skip(1)
            .map(|cd| cd.hash_type.to_string())
            .collect::<Vec<_>>();

        if let Some(blob) = sig.entitlements()? {
            entitlements_plist = Some(blob.as_str().to_string());
        }

        if let Some(reqs) = sig.code_requirements()? {
            code_requirements = reqs
                .requirements
                .iter()
                .map(|(req, blob)| format!("{:?}: {} bytes", req, blob.data.len()))
                .collect::<Vec<_>>();
        }

        if let Some(signed_data) = sig.signed_data()? {
            cms = Some(signed_data.try_into()?);
        }

        Ok(Self {
            superblob_length: sig.length,
            blob_count: sig.count,
            blobs: sig
                .blobs
                .iter()
                .map(BlobDescription::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            version,
            flags,
            identifier,
            team_name,
            digest_type,
            signed_entity_size,
            runtime_version,
            executable_segment_flags,
            slot_digests,
            code_digests,
            alternative_digest_types,
            entitlements_plist,
            code_requirements,
            cms,
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HeaderDescription {
    pub magic: String,
    pub architecture: String,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: String,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadCommandDescription {
    pub index: usize,
    pub command: String,
    pub cmdsize: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct SegmentDescription {
    pub name: String,
    pub vmaddr: String,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: Vec<String>,
}

/// Structure of one Mach-O image.
#[derive(Clone, Debug, Serialize)]
pub struct MachOEntity {
    pub index: usize,
    pub file_size: usize,
    pub header: HeaderDescription,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub load_commands: Vec<LoadCommandDescription>,
    pub segments: Vec<SegmentDescription>,
    pub signature: Option<CodeSignature>,
}

impl MachOEntity {
    pub fn from_image(index: usize, image: &MachOImage) -> Result<Self, DarwinCodesignError> {
        let header = image.header();
        let ctx = image.ctx();

        Ok(Self {
            index,
            file_size: image.file_size(),
            header: HeaderDescription {
                magic: format!("{:x}", header.magic),
                architecture: header.arch_name().unwrap_or("unknown").to_string(),
                cputype: header.cputype,
                cpusubtype: header.cpusubtype,
                filetype: filetype_to_str(header.filetype).to_string(),
                ncmds: header.ncmds,
                sizeofcmds: header.sizeofcmds,
                flags: format!("0x{:x}", header.flags),
            },
            target: image.find_targeting().map(|target| {
                format!(
                    "{:?} {} (SDK {})",
                    target.platform, target.minimum_os_version, target.sdk_version
                )
            }),
            load_commands: image
                .load_commands()
                .iter()
                .enumerate()
                .map(|(index, lc)| LoadCommandDescription {
                    index,
                    command: cmd_to_str(lc.cmd).to_string(),
                    cmdsize: lc.cmdsize(ctx),
                })
                .collect(),
            segments: image
                .segments()
                .map(|segment| SegmentDescription {
                    name: segment.name().to_string(),
                    vmaddr: format!("0x{:x}", segment.vmaddr),
                    vmsize: segment.vmsize,
                    fileoff: segment.fileoff,
                    filesize: segment.filesize,
                    sections: segment
                        .sections
                        .iter()
                        .map(|section| section.name().to_string())
                        .collect(),
                })
                .collect(),
            signature: image
                .code_signature()?
                .map(CodeSignature::try_from)
                .transpose()?,
        })
    }
}

/// Report on a thin or fat Mach-O file.
#[derive(Clone, Debug, Serialize)]
pub struct MachOReport {
    pub fat: bool,
    pub images: Vec<MachOEntity>,
}

impl MachOReport {
    pub fn from_data(data: &[u8]) -> Result<Self, DarwinCodesignError> {
        let file = MachFile::parse(data)?;

        Ok(Self {
            fat: matches!(file, MachFile::Fat(_)),
            images: file
                .images()
                .into_iter()
                .enumerate()
                .map(|(index, image)| MachOEntity::from_image(index, image))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    pub fn to_json(&self) -> Result<String, DarwinCodesignError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Render a human readable report.
    ///
    /// `detail` adds load commands, sections, blobs and digests.
    pub fn to_text(&self, detail: bool) -> String {
        let mut s = String::new();

        // Writing to a String cannot fail.
        let _ = self.write_text(&mut s, detail);

        s
    }

    fn write_text(&self, s: &mut String, detail: bool) -> std::fmt::Result {
        if self.fat {
            writeln!(s, "universal binary with {} slices", self.images.len())?;
        }

        for entity in &self.images {
            let header = &entity.header;
            writeln!(
                s,
                "slice {}: {} {} ({} bytes)",
                entity.index, header.architecture, header.filetype, entity.file_size
            )?;
            if let Some(target) = &entity.target {
                writeln!(s, "  target: {}", target)?;
            }
            writeln!(
                s,
                "  header: magic {} flags {} ncmds {} sizeofcmds {}",
                header.magic, header.flags, header.ncmds, header.sizeofcmds
            )?;

            if detail {
                writeln!(s, "  load commands:")?;
                for lc in &entity.load_commands {
                    writeln!(s, "    {:>3} {} ({} bytes)", lc.index, lc.command, lc.cmdsize)?;
                }
            }

            writeln!(s, "  segments:")?;
            for segment in &entity.segments {
                writeln!(
                    s,
                    "    {:<16} vmaddr {} vmsize {} fileoff {} filesize {}",
                    segment.name, segment.vmaddr, segment.vmsize, segment.fileoff, segment.filesize
                )?;
                if detail {
                    for section in &segment.sections {
                        writeln!(s, "      {}", section)?;
                    }
                }
            }

            match &entity.signature {
                None => writeln!(s, "  signature: none")?,
                Some(sig) => write_signature_text(s, sig, detail)?,
            }
        }

        Ok(())
    }
}

fn write_signature_text(s: &mut String, sig: &CodeSignature, detail: bool) -> std::fmt::Result {
    writeln!(
        s,
        "  signature: {} bytes, {} blobs",
        sig.superblob_length, sig.blob_count
    )?;

    let fields = [
        ("identifier", &sig.identifier),
        ("team", &sig.team_name),
        ("version", &sig.version),
        ("flags", &sig.flags),
        ("digest", &sig.digest_type),
        ("runtime", &sig.runtime_version),
        ("exec segment flags", &sig.executable_segment_flags),
    ];
    for (name, value) in fields {
        if let Some(value) = value {
            writeln!(s, "    {}: {}", name, value)?;
        }
    }
    if let Some(size) = sig.signed_entity_size {
        writeln!(s, "    code limit: {}", size)?;
    }
    writeln!(s, "    code digests: {}", sig.code_digests.len())?;
    if !sig.alternative_digest_types.is_empty() {
        writeln!(
            s,
            "    alternative digests: {}",
            sig.alternative_digest_types.join(", ")
        )?;
    }

    match &sig.cms {
        None => writeln!(s, "    cms: none (ad-hoc)")?,
        Some(cms) => {
            for cert in &cms.certificates {
                writeln!(s, "    certificate: {}", cert.subject)?;
            }
            for signer in &cms.signers {
                writeln!(
                    s,
                    "    signer: {} (verifies: {}, time-stamped: {})",
                    signer.issuer, signer.signature_verifies, signer.time_stamped
                )?;
            }
        }
    }

    if detail {
        writeln!(s, "    blobs:")?;
        for blob in &sig.blobs {
            writeln!(
                s,
                "      {} magic {} length {} sha256 {}",
                blob.slot, blob.magic, blob.length, blob.sha256
            )?;
        }
        for digest in &sig.slot_digests {
            writeln!(s, "    slot {}", digest)?;
        }
        for requirement in &sig.code_requirements {
            writeln!(s, "    requirement {}", requirement)?;
        }
        for (index, digest) in sig.code_digests.iter().enumerate() {
            writeln!(s, "    page {}: {}", index, digest)?;
        }
        if let Some(entitlements) = &sig.entitlements_plist {
            writeln!(s, "    entitlements:")?;
            for line in entitlements.lines() {
                writeln!(s, "      {}", line)?;
            }
        }
    }

    Ok(())
}

/// Report on the contents of a PKCS#12 container.
#[derive(Clone, Debug, Serialize)]
pub struct P12Report {
    pub signing_certificate: CertificateInfo,
    pub has_private_key: bool,
    pub chain: Vec<CertificateInfo>,
}

impl From<&PfxContents> for P12Report {
    fn from(contents: &PfxContents) -> Self {
        Self {
            signing_certificate: (&contents.certificate).into(),
            has_private_key: true,
            chain: contents.chain.iter().map(CertificateInfo::from).collect(),
        }
    }
}

impl P12Report {
    pub fn to_text(&self) -> String {
        let mut s = String::new();

        let certs = std::iter::once(("signing certificate", &self.signing_certificate))
            .chain(self.chain.iter().map(|cert| ("chain certificate", cert)));

        for (role, cert) in certs {
            s.push_str(&format!("{}:\n", role));
            s.push_str(&format!("  subject: {}\n", cert.subject));
            s.push_str(&format!("  issuer: {}\n", cert.issuer));
            s.push_str(&format!("  serial: {}\n", cert.serial_number));
            s.push_str(&format!("  sha256 fingerprint: {}\n", cert.sha256_fingerprint));
        }
        s.push_str(&format!(
            "private key: {}\n",
            if self.has_private_key { "present" } else { "absent" }
        ));

        s
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            cryptography::{parse_pfx_data, tests::make_pfx},
            macho_signing::MachOSigner,
            signing_settings::SigningSettings,
        },
        darwin_macho::{create_universal_macho, testing::SyntheticImage},
    };

    fn ad_hoc_signed(data: &[u8]) -> Vec<u8> {
        let mut settings = SigningSettings::default();
        settings.set_binary_identifier("com.example.tool");

        MachOSigner::new(data).unwrap().sign(&settings).unwrap()
    }

    #[test]
    fn unsigned_thin() {
        let report = MachOReport::from_data(&SyntheticImage::default().build()).unwrap();

        assert!(!report.fat);
        assert_eq!(report.images.len(), 1);
        let entity = &report.images[0];
        assert_eq!(entity.header.architecture, "x86_64");
        assert_eq!(entity.header.filetype, "EXECUTE");
        assert!(entity.signature.is_none());
        assert!(entity.segments.iter().any(|s| s.name == "__LINKEDIT"));

        let text = report.to_text(false);
        assert!(text.contains("signature: none"));
        assert!(!text.contains("load commands:"));
        assert!(report.to_text(true).contains("load commands:"));
    }

    #[test]
    fn signed_fat_json() {
        let x86 = SyntheticImage::default().build();
        let arm = SyntheticImage::arm64().build();
        let mut fat = vec![];
        create_universal_macho(&mut fat, [x86.as_slice(), arm.as_slice()].into_iter()).unwrap();

        let signed = ad_hoc_signed(&fat);
        let report = MachOReport::from_data(&signed).unwrap();
        assert!(report.fat);
        assert_eq!(report.images.len(), 2);

        for entity in &report.images {
            let sig = entity.signature.as_ref().unwrap();
            assert_eq!(sig.identifier.as_deref(), Some("com.example.tool"));
            assert!(sig.cms.is_none());
            assert!(!sig.code_digests.is_empty());
        }

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["fat"], true);
        assert_eq!(
            json["images"][1]["signature"]["identifier"],
            "com.example.tool"
        );
        assert!(json["images"][0]["load_commands"].as_array().unwrap().len() > 1);

        let brief = report.to_text(false);
        assert!(brief.contains("universal binary with 2 slices"));
        assert!(brief.contains("cms: none (ad-hoc)"));
        assert!(!brief.contains("page 0:"));
        assert!(report.to_text(true).contains("page 0:"));
    }

    #[test]
    fn cms_signer_json() {
        let signer = CmsSigner {
            issuer: "CN=Developer ID Certification Authority".to_string(),
            digest_algorithm: "Sha256".to_string(),
            signature_algorithm: "EcdsaSha256".to_string(),
            signing_time: Some(chrono::DateTime::<chrono::Utc>::from(
                std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000),
            )),
            signature_verifies: true,
            time_stamped: false,
        };

        let json = serde_json::to_value(&signer).unwrap();
        assert!(json["signing_time"]
            .as_str()
            .unwrap()
            .starts_with("2020-09-13T12:26:40"));

        let unsigned = CmsSigner {
            signing_time: None,
            ..signer
        };
        assert!(serde_json::to_value(&unsigned).unwrap().get("signing_time").is_none());
    }

    #[test]
    fn p12_report() {
        let (data, _) = make_pfx("Developer ID Application: Example", None, None, "pw");
        let contents = parse_pfx_data(&data, "pw").unwrap();

        let report = P12Report::from(&contents);
        assert!(report.has_private_key);
        assert!(report.chain.is_empty());
        assert_eq!(report.signing_certificate.sha256_fingerprint.len(), 64);

        let text = report.to_text();
        assert!(text.contains("Developer ID Application: Example"));
        assert!(text.contains("private key: present"));
    }
}
