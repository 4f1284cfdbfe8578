// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::CmsError, darwin_macho::MachOError, std::path::PathBuf,
    thiserror::Error, x509_certificate::X509CertificateError,
};

/// Broad classes of failures.
///
/// Callers use this to decide whether an operation is worth retrying and how
/// to report it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    /// Malformed or unsupported input binary.
    Format,
    /// Unusable signing or API credentials.
    Identity,
    /// Offsets or sizes overflowing the binary's fields.
    Capacity,
    /// Remote service or transport failure.
    Network,
    /// A submission did not reach a verdict in time.
    Timeout,
    /// Bad invocation or configuration.
    Usage,
    /// Everything else.
    Internal,
}

impl ErrorCategory {
    /// Exit code of the command line tool for errors of this category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Internal => 1,
            Self::Usage => 2,
            Self::Format => 3,
            Self::Identity => 4,
            Self::Capacity => 5,
            Self::Network => 6,
            Self::Timeout => 7,
        }
    }
}

/// Unified error type for signing and notarization.
#[derive(Debug, Error)]
pub enum DarwinCodesignError {
    #[error("{0}")]
    CliGeneralError(String),

    #[error("bad argument: {0}")]
    CliBadArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mach-O error: {0}")]
    MachO(#[from] MachOError),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("superblob data is malformed")]
    SuperblobMalformed,

    #[error("code directory is malformed: {0}")]
    CodeDirectoryMalformed(&'static str),

    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHashAlgorithm(String),

    #[error("unknown code signature flag: {0}")]
    CodeSignatureUnknownFlag(String),

    #[error("entitlements data is not valid UTF-8: {0}")]
    EntitlementsBadUtf8(std::str::Utf8Error),

    #[error("unable to locate __TEXT segment")]
    MissingText,

    #[error("unable to locate __LINKEDIT segment")]
    MissingLinkedit,

    #[error("__LINKEDIT is not the final segment")]
    LinkeditNotLast,

    #[error("existing signature data is not at the end of __LINKEDIT")]
    DataAfterSignature,

    #[error("signature data too large (estimated {estimated} bytes, needed {actual})")]
    SignatureDataTooLarge { estimated: usize, actual: usize },

    #[error("offsets exceed the range of the binary's offset fields")]
    InsufficientSpace,

    #[error("signature builder error: {0}")]
    SignatureBuilder(&'static str),

    #[error("functionality not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("error parsing PFX data: {0}")]
    PfxParseError(String),

    #[error("bad PFX password")]
    PfxBadPassword,

    #[error("certificate chain is incomplete: {0}")]
    IncompleteChain(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("signing identity error: {0}")]
    SigningIdentity(String),

    #[error("time-stamp server error: {0}")]
    TimeStamp(String),

    #[error("notary service returned HTTP {status}: {message}")]
    NotaryHttp { status: u16, message: String },

    #[error("upload to notary storage failed: {0}")]
    Upload(String),

    #[error("submission {submission_id} still in progress after {waited_seconds}s")]
    PollTimeout {
        submission_id: String,
        waited_seconds: u64,
    },

    #[error("waiting on submission {0} was cancelled")]
    PollCancelled(String),

    #[error("gave up after {attempts} attempts: {source}")]
    PollRetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DarwinCodesignError>,
    },

    #[error("notarization of submission {submission_id} finished with status {status}")]
    NotarizationFailed {
        submission_id: String,
        status: String,
    },

    #[error("error signing slice {index}: {source}")]
    SliceSigning {
        index: usize,
        #[source]
        source: Box<DarwinCodesignError>,
    },

    #[error("{stage} {}: {source}", path.display())]
    Stage {
        stage: &'static str,
        path: PathBuf,
        #[source]
        source: Box<DarwinCodesignError>,
    },
}

impl DarwinCodesignError {
    /// Wrap an error with the stage and file it occurred in.
    pub fn in_stage(self, stage: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::Stage {
            stage,
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// Resolve the category of this error, looking through wrapping variants.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CliGeneralError(_) | Self::CliBadArgument(_) | Self::Config(_) => {
                ErrorCategory::Usage
            }
            Self::SerdeYaml(_) => ErrorCategory::Usage,
            Self::MachO(MachOError::InsufficientSpace) | Self::InsufficientSpace => {
                ErrorCategory::Capacity
            }
            Self::MachO(_)
            | Self::Scroll(_)
            | Self::BadMagic(_)
            | Self::SuperblobMalformed
            | Self::CodeDirectoryMalformed(_)
            | Self::UnsupportedHashAlgorithm(_)
            | Self::EntitlementsBadUtf8(_)
            | Self::MissingText
            | Self::MissingLinkedit
            | Self::LinkeditNotLast
            | Self::DataAfterSignature => ErrorCategory::Format,
            Self::X509(_)
            | Self::PfxParseError(_)
            | Self::PfxBadPassword
            | Self::IncompleteChain(_)
            | Self::InvalidKey(_)
            | Self::SigningIdentity(_)
            | Self::Jwt(_) => ErrorCategory::Identity,
            Self::Reqwest(_)
            | Self::NotaryHttp { .. }
            | Self::Upload(_)
            | Self::TimeStamp(_)
            | Self::PollRetriesExhausted { .. }
            | Self::NotarizationFailed { .. } => ErrorCategory::Network,
            Self::PollTimeout { .. } | Self::PollCancelled(_) => ErrorCategory::Timeout,
            Self::SliceSigning { source, .. } | Self::Stage { source, .. } => source.category(),
            _ => ErrorCategory::Internal,
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Transport failures, HTTP 5xx and HTTP 429 are transient. Everything
    /// else, including authentication rejections, is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Reqwest(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error() || status.as_u16() == 429
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            }
            Self::NotaryHttp { status, .. } => *status >= 500 || *status == 429,
            Self::Upload(_) => true,
            Self::Stage { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(
            DarwinCodesignError::PfxBadPassword.category(),
            ErrorCategory::Identity
        );
        assert_eq!(
            DarwinCodesignError::MachO(MachOError::InsufficientSpace).category(),
            ErrorCategory::Capacity
        );
        assert_eq!(
            DarwinCodesignError::MachO(MachOError::LoadCommandNoRoom).category(),
            ErrorCategory::Format
        );

        let wrapped = DarwinCodesignError::SliceSigning {
            index: 1,
            source: Box::new(DarwinCodesignError::InsufficientSpace),
        }
        .in_stage("signing", "/tmp/bin");
        assert_eq!(wrapped.category(), ErrorCategory::Capacity);
        assert!(wrapped.to_string().starts_with("signing /tmp/bin: error signing slice 1"));

        assert_eq!(
            DarwinCodesignError::PollTimeout {
                submission_id: "abc".into(),
                waited_seconds: 30
            }
            .category(),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(
            DarwinCodesignError::CliBadArgument("x".into())
                .category()
                .exit_code(),
            2
        );
        assert_eq!(
            DarwinCodesignError::IncompleteChain("x".into())
                .in_stage("signing", "/tmp/bin")
                .category()
                .exit_code(),
            4
        );
        assert_eq!(
            DarwinCodesignError::PollCancelled("abc".into())
                .category()
                .exit_code(),
            7
        );
        assert_eq!(DarwinCodesignError::Unimplemented("x").category().exit_code(), 1);
    }

    #[test]
    fn transient_statuses() {
        let http = |status| DarwinCodesignError::NotaryHttp {
            status,
            message: String::new(),
        };

        assert!(http(500).is_transient());
        assert!(http(503).is_transient());
        assert!(http(429).is_transient());
        assert!(!http(401).is_transient());
        assert!(!http(404).is_transient());
        assert!(!DarwinCodesignError::SuperblobMalformed.is_transient());
    }
}
