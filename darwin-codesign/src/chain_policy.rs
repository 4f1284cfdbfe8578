// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Certificate chain completeness policies.

Before a certificate signature is produced, the signing certificate and the
chain that accompanies it are checked for completeness. A signature whose
chain cannot be followed to a recognized root will be refused by Apple's
verifiers, so it is better to fail early, before the time-stamp server or
the notary service is contacted.

Completeness is expressed through the [ChainPolicy] trait so callers can
substitute their own rules. [IssuerLinkedChainPolicy] is the default.
*/

use {
    crate::error::DarwinCodesignError,
    log::{debug, info},
    x509_certificate::{rfc3280::Name, CapturedX509Certificate},
};

/// Common names of Apple's root certificate authorities.
pub const APPLE_ROOT_COMMON_NAMES: &[&str] =
    &["Apple Root CA", "Apple Root CA - G2", "Apple Root CA - G3"];

/// Decides whether a signing certificate and its chain form a complete chain.
pub trait ChainPolicy: Send + Sync {
    /// Check `leaf` with its issuing `chain`.
    ///
    /// Returns [DarwinCodesignError::IncompleteChain] when the chain is
    /// incomplete.
    fn check_chain(
        &self,
        leaf: &CapturedX509Certificate,
        chain: &[CapturedX509Certificate],
    ) -> Result<(), DarwinCodesignError>;
}

/// Resolve the first common name in a name, if any.
pub fn common_name(name: &Name) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|atv| atv.to_string().ok())
}

/// Render a name for humans.
pub fn display_name(name: &Name) -> String {
    name.user_friendly_str()
        .unwrap_or_else(|_| "<unprintable name>".to_string())
}

/// Follows issuer names from the leaf through the chain.
///
/// The chain is complete when the walk reaches a self-issued certificate or
/// a certificate issued by one of the trusted root names. Signatures on the
/// certificates are not verified here.
#[derive(Clone, Debug)]
pub struct IssuerLinkedChainPolicy {
    trusted_roots: Vec<String>,
}

impl Default for IssuerLinkedChainPolicy {
    fn default() -> Self {
        Self {
            trusted_roots: APPLE_ROOT_COMMON_NAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl IssuerLinkedChainPolicy {
    /// Construct an instance trusting roots with the given common names.
    pub fn with_trusted_roots(roots: impl IntoIterator<Item = impl ToString>) -> Self {
        Self {
            trusted_roots: roots.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    fn is_trusted_issuer(&self, cert: &CapturedX509Certificate) -> bool {
        match common_name(cert.issuer_name()) {
            Some(cn) => self.trusted_roots.iter().any(|root| *root == cn),
            None => false,
        }
    }
}

impl ChainPolicy for IssuerLinkedChainPolicy {
    fn check_chain(
        &self,
        leaf: &CapturedX509Certificate,
        chain: &[CapturedX509Certificate],
    ) -> Result<(), DarwinCodesignError> {
        let mut current = leaf;

        // Every step consumes a distinct certificate, so a walk longer than
        // the chain means the issuer names form a cycle.
        for _ in 0..=chain.len() {
            debug!(
                "checking issuer of certificate {}",
                display_name(current.subject_name())
            );

            if current.subject_is_issuer() {
                info!(
                    "certificate chain ends at self-issued {}",
                    display_name(current.subject_name())
                );
                return Ok(());
            }

            if self.is_trusted_issuer(current) {
                info!(
                    "certificate chain ends at trusted root {}",
                    display_name(current.issuer_name())
                );
                return Ok(());
            }

            current = chain
                .iter()
                .find(|cert| cert.subject_name() == current.issuer_name())
                .ok_or_else(|| {
                    DarwinCodesignError::IncompleteChain(format!(
                        "no certificate for issuer {}",
                        display_name(current.issuer_name())
                    ))
                })?;
        }

        Err(DarwinCodesignError::IncompleteChain(
            "certificate issuers form a cycle".to_string(),
        ))
    }
}
