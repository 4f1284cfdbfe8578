// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! App Store Connect API tokens.

use {
    crate::{
        clock::{Clock, SystemClock},
        error::DarwinCodesignError,
        signing_identity::resolve_env_indirection,
    },
    jsonwebtoken::{Algorithm, EncodingKey, Header},
    log::debug,
    ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING},
    serde::{Deserialize, Serialize},
    std::{path::Path, sync::Mutex},
    zeroize::Zeroizing,
};

/// Audience claim expected by App Store Connect.
pub const TOKEN_AUDIENCE: &str = "appstoreconnect-v1";

/// Lifetime of issued tokens, in seconds.
pub const TOKEN_LIFETIME_SECONDS: u64 = 1200;

/// Cached tokens are replaced once they are this close to expiring.
pub const TOKEN_REFRESH_MARGIN_SECONDS: u64 = 60;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ConnectTokenClaims {
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
    pub aud: String,
}

/// A JWT Token for use with App Store Connect API.
pub type AppStoreConnectToken = String;

fn parse_pem_private_key(data: &[u8]) -> Result<Zeroizing<Vec<u8>>, DarwinCodesignError> {
    let parsed = pem::parse(data)
        .map_err(|e| DarwinCodesignError::InvalidKey(format!("error parsing PEM: {}", e)))?;

    if parsed.tag != "PRIVATE KEY" {
        return Err(DarwinCodesignError::InvalidKey(format!(
            "expected a PRIVATE KEY PEM block; got {}",
            parsed.tag
        )));
    }

    Ok(Zeroizing::new(parsed.contents))
}

/// Resolve an API private key to PKCS#8 DER.
///
/// `source` is a path to a `.p8` PEM or DER file, PEM content, or `env:NAME`
/// naming a variable holding either.
pub fn resolve_private_key(source: &str) -> Result<Zeroizing<Vec<u8>>, DarwinCodesignError> {
    let value = resolve_env_indirection(source)?;
    let value = value.trim();

    if value.starts_with("-----BEGIN") {
        return parse_pem_private_key(value.as_bytes());
    }

    let path = Path::new(value);
    if !value.is_empty() && path.is_file() {
        debug!("reading API private key from {}", path.display());
        let data = Zeroizing::new(std::fs::read(path)?);

        return if data.starts_with(b"-----BEGIN") {
            parse_pem_private_key(&data)
        } else {
            Ok(data)
        };
    }

    Err(DarwinCodesignError::InvalidKey(
        "private key is neither PEM content nor an existing file".to_string(),
    ))
}

/// Issues JWTs for App Store Connect from an API key.
///
/// App Store Connect API tokens are derived from:
///
/// * A key identifier. This is a short alphanumeric string like `DEADBEEF42`.
/// * An issuer ID. This is likely a UUID.
/// * An ECDSA P-256 private key.
///
/// All these are issued by Apple.
#[derive(Clone)]
pub struct ConnectTokenEncoder {
    key_id: String,
    issuer_id: String,
    encoding_key: EncodingKey,
}

impl std::fmt::Debug for ConnectTokenEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTokenEncoder")
            .field("key_id", &self.key_id)
            .field("issuer_id", &self.issuer_id)
            .finish_non_exhaustive()
    }
}

impl ConnectTokenEncoder {
    /// Construct an instance from a PKCS#8 DER encoded ECDSA P-256 private key.
    pub fn from_pkcs8_der(
        key_id: impl ToString,
        issuer_id: impl ToString,
        der_data: &[u8],
    ) -> Result<Self, DarwinCodesignError> {
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der_data).map_err(|e| {
            DarwinCodesignError::InvalidKey(format!("not a PKCS#8 P-256 private key: {}", e))
        })?;

        Ok(Self {
            key_id: key_id.to_string(),
            issuer_id: issuer_id.to_string(),
            encoding_key: EncodingKey::from_ec_der(der_data),
        })
    }

    /// Construct an instance from a private key source.
    ///
    /// See [resolve_private_key] for accepted sources.
    pub fn from_private_key_source(
        key_id: impl ToString,
        issuer_id: impl ToString,
        source: &str,
    ) -> Result<Self, DarwinCodesignError> {
        let der = resolve_private_key(source)?;

        Self::from_pkcs8_der(key_id, issuer_id, &der)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    /// Mint a token issued at `issued_at` seconds past the UNIX epoch.
    pub fn new_token_at(&self, issued_at: u64) -> Result<AppStoreConnectToken, DarwinCodesignError> {
        let header = Header {
            kid: Some(self.key_id.clone()),
            alg: Algorithm::ES256,
            ..Default::default()
        };

        let claims = ConnectTokenClaims {
            iss: self.issuer_id.clone(),
            iat: issued_at,
            exp: issued_at + TOKEN_LIFETIME_SECONDS,
            aud: TOKEN_AUDIENCE.to_string(),
        };

        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding_key)?)
    }
}

struct CachedToken {
    token: AppStoreConnectToken,
    expires: u64,
}

/// Hands out tokens, reusing one until it nears expiry.
///
/// The mutex is held while a replacement is minted, so concurrent callers
/// never generate more than one token at a time.
pub struct TokenCache {
    encoder: ConnectTokenEncoder,
    clock: Box<dyn Clock>,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(encoder: ConnectTokenEncoder) -> Self {
        Self::with_clock(encoder, Box::new(SystemClock))
    }

    pub fn with_clock(encoder: ConnectTokenEncoder, clock: Box<dyn Clock>) -> Self {
        Self {
            encoder,
            clock,
            cached: Mutex::new(None),
        }
    }

    /// Obtain a token valid for at least the refresh margin.
    pub fn token(&self) -> Result<AppStoreConnectToken, DarwinCodesignError> {
        // A panic while holding the lock leaves at worst a stale entry, which
        // the expiry check below replaces.
        let mut cached = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = self.clock.now().as_secs();

        match cached.as_ref() {
            Some(entry) if now + TOKEN_REFRESH_MARGIN_SECONDS < entry.expires => {
                Ok(entry.token.clone())
            }
            _ => {
                debug!("issuing App Store Connect token for key {}", self.encoder.key_id);
                let token = self.encoder.new_token_at(now)?;
                *cached = Some(CachedToken {
                    token: token.clone(),
                    expires: now + TOKEN_LIFETIME_SECONDS,
                });

                Ok(token)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::clock::tests::ManualClock,
        jsonwebtoken::{DecodingKey, Validation},
        ring::{
            rand::SystemRandom,
            signature::{Ed25519KeyPair, KeyPair},
        },
        std::time::Duration,
    };

    /// Generate a PKCS#8 P-256 key and its uncompressed public point.
    pub(crate) fn p256_key() -> (Vec<u8>, Vec<u8>) {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .unwrap()
            .as_ref()
            .to_vec();
        let public = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8)
            .unwrap()
            .public_key()
            .as_ref()
            .to_vec();

        (pkcs8, public)
    }

    fn decode(token: &str, public: &[u8]) -> ConnectTokenClaims {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.validate_exp = false;

        jsonwebtoken::decode::<ConnectTokenClaims>(
            token,
            &DecodingKey::from_ec_der(public),
            &validation,
        )
        .unwrap()
        .claims
    }

    #[test]
    fn token_claims() {
        let (pkcs8, public) = p256_key();
        let encoder = ConnectTokenEncoder::from_pkcs8_der("DEADBEEF42", "issuer", &pkcs8).unwrap();

        let token = encoder.new_token_at(1_000_000).unwrap();

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.kid.as_deref(), Some("DEADBEEF42"));

        let claims = decode(&token, &public);
        assert_eq!(claims.iss, "issuer");
        assert_eq!(claims.iat, 1_000_000);
        assert_eq!(claims.exp, 1_001_200);
        assert_eq!(claims.aud, TOKEN_AUDIENCE);
    }

    #[test]
    fn invalid_keys() {
        assert!(matches!(
            ConnectTokenEncoder::from_pkcs8_der("k", "i", b"garbage"),
            Err(DarwinCodesignError::InvalidKey(_))
        ));

        let ed25519 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        assert!(matches!(
            ConnectTokenEncoder::from_pkcs8_der("k", "i", ed25519.as_ref()),
            Err(DarwinCodesignError::InvalidKey(_))
        ));

        let certificate_pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(matches!(
            resolve_private_key(certificate_pem),
            Err(DarwinCodesignError::InvalidKey(_))
        ));
    }

    #[test]
    fn private_key_sources() {
        let (pkcs8, _) = p256_key();
        let pem_text = pem::encode(&pem::Pem {
            tag: "PRIVATE KEY".to_string(),
            contents: pkcs8.clone(),
        });

        assert_eq!(resolve_private_key(&pem_text).unwrap().as_slice(), pkcs8);

        let dir = tempfile::tempdir().unwrap();
        let p8_path = dir.path().join("AuthKey_DEADBEEF42.p8");
        std::fs::write(&p8_path, &pem_text).unwrap();
        assert_eq!(
            resolve_private_key(p8_path.to_str().unwrap()).unwrap().as_slice(),
            pkcs8
        );

        let der_path = dir.path().join("key.der");
        std::fs::write(&der_path, &pkcs8).unwrap();
        assert_eq!(
            resolve_private_key(der_path.to_str().unwrap()).unwrap().as_slice(),
            pkcs8
        );

        std::env::set_var("DCODESIGN_TEST_API_KEY", &pem_text);
        let encoder =
            ConnectTokenEncoder::from_private_key_source("k", "i", "env:DCODESIGN_TEST_API_KEY")
                .unwrap();
        assert_eq!(encoder.key_id(), "k");

        assert!(resolve_private_key("/nonexistent/AuthKey.p8").is_err());
    }

    #[test]
    fn cache_refreshes_near_expiry() {
        let (pkcs8, public) = p256_key();
        let encoder = ConnectTokenEncoder::from_pkcs8_der("k", "i", &pkcs8).unwrap();
        let clock = ManualClock::new(5000);
        let cache = TokenCache::with_clock(encoder, Box::new(clock.clone()));

        let first = cache.token().unwrap();
        clock.advance(Duration::from_secs(TOKEN_LIFETIME_SECONDS - 61));
        assert_eq!(cache.token().unwrap(), first);

        clock.advance(Duration::from_secs(1));
        let second = cache.token().unwrap();
        assert_ne!(second, first);
        assert_eq!(decode(&second, &public).iat, 5000 + TOKEN_LIFETIME_SECONDS - 60);
    }

    #[test]
    fn poisoned_cache_still_issues_tokens() {
        let (pkcs8, public) = p256_key();
        let encoder = ConnectTokenEncoder::from_pkcs8_der("k", "i", &pkcs8).unwrap();
        let cache = TokenCache::with_clock(encoder, Box::new(ManualClock::new(7000)));

        let first = cache.token().unwrap();

        let result = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = cache.cached.lock().unwrap();
                panic!("poison the token cache");
            })
            .join()
        });
        assert!(result.is_err());
        assert!(cache.cached.is_poisoned());

        assert_eq!(cache.token().unwrap(), first);
        assert_eq!(decode(&first, &public).iat, 7000);
    }
}
