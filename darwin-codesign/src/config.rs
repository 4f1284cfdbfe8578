// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Configuration file handling.

Configuration is read from YAML. The first of these is used:

1. The path given with `--config`.
2. `.dcodesign.yaml` in the current directory.
3. `dcodesign/config.yaml` in the user's configuration directory.

Environment variables named `DCODESIGN_<SECTION>_<KEY>` override values
from the file, e.g. `DCODESIGN_NOTARY_ISSUER` or `DCODESIGN_DRY_RUN`.
*/

use {
    crate::{
        app_store_connect::api_token::ConnectTokenEncoder,
        code_directory::CodeSignatureFlags,
        embedded_signature::DigestType,
        error::DarwinCodesignError,
        notarization::PollSettings,
        signing_identity::SigningIdentity,
        signing_settings::{SigningSettings, DEFAULT_TIME_STAMP_URL},
    },
    log::{debug, info, warn},
    serde::Deserialize,
    std::{
        path::{Path, PathBuf},
        str::FromStr,
        time::Duration,
    },
};

/// Name of the configuration file looked up in the current directory.
pub const CONFIG_FILE_NAME: &str = ".dcodesign.yaml";

/// Prefix of environment variables overriding configuration values.
pub const ENV_VAR_PREFIX: &str = "DCODESIGN_";

/// The `sign` section.
#[derive(Clone, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct SignConfig {
    /// Code Directory identifier override.
    pub identity: String,
    /// PKCS#12 path, base64 content or `env:NAME`.
    pub p12: String,
    pub password: String,
    pub timestamp_server: String,
    pub ad_hoc: bool,
    pub fail_without_full_chain: bool,
    pub digests: Vec<String>,
    /// Path to an entitlements plist.
    pub entitlements: String,
    /// Whether to enable the hardened runtime.
    pub runtime: bool,
}

impl Default for SignConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            p12: String::new(),
            password: String::new(),
            timestamp_server: DEFAULT_TIME_STAMP_URL.to_string(),
            ad_hoc: false,
            fail_without_full_chain: true,
            digests: vec!["sha256".to_string()],
            entitlements: String::new(),
            runtime: false,
        }
    }
}

impl std::fmt::Debug for SignConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignConfig")
            .field("identity", &self.identity)
            .field("timestamp_server", &self.timestamp_server)
            .field("ad_hoc", &self.ad_hoc)
            .field("fail_without_full_chain", &self.fail_without_full_chain)
            .field("digests", &self.digests)
            .field("entitlements", &self.entitlements)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl SignConfig {
    /// Load the signing identity described by this section.
    ///
    /// Without a PKCS#12 source the identity is ad-hoc.
    pub fn signing_identity(&self) -> Result<SigningIdentity, DarwinCodesignError> {
        if self.ad_hoc {
            info!("using ad-hoc signing");
            return Ok(SigningIdentity::AdHoc);
        }

        if self.p12.is_empty() {
            warn!("no PKCS#12 identity configured; signing ad-hoc");
            return Ok(SigningIdentity::AdHoc);
        }

        SigningIdentity::from_p12_source(&self.p12, &self.password)
    }

    /// Parse the configured digest names.
    pub fn digest_types(&self) -> Result<Vec<DigestType>, DarwinCodesignError> {
        self.digests
            .iter()
            .map(|s| DigestType::from_str(s.trim()))
            .collect()
    }

    /// Apply this section to settings bound to a signing identity.
    pub fn apply_to_settings(&self, settings: &mut SigningSettings) -> Result<(), DarwinCodesignError> {
        if !self.identity.is_empty() {
            settings.set_binary_identifier(&self.identity);
        }

        settings.set_digests(self.digest_types()?)?;

        // Ad-hoc signatures carry no CMS blob to time-stamp.
        if settings.signing_key().is_some() {
            settings.set_time_stamp_server(&self.timestamp_server)?;
        }

        if !self.entitlements.is_empty() {
            info!("reading entitlements from {}", self.entitlements);
            let xml = std::fs::read_to_string(&self.entitlements)?;
            settings.set_entitlements_xml(xml)?;
        }

        if self.runtime {
            settings.add_code_signature_flags(CodeSignatureFlags::RUNTIME);
        }

        Ok(())
    }
}

/// The `notary` section.
#[derive(Clone, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct NotaryConfig {
    pub issuer: String,
    pub key_id: String,
    /// Path, PEM content or `env:NAME`.
    pub private_key: String,
    /// Per request timeout, in seconds.
    pub http_timeout: u64,
    /// Limit on a single upload of a payload, in seconds.
    pub upload_timeout: u64,
}

impl Default for NotaryConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            key_id: String::new(),
            private_key: String::new(),
            http_timeout: 30,
            upload_timeout: 600,
        }
    }
}

impl std::fmt::Debug for NotaryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotaryConfig")
            .field("issuer", &self.issuer)
            .field("key_id", &self.key_id)
            .field("http_timeout", &self.http_timeout)
            .field("upload_timeout", &self.upload_timeout)
            .finish_non_exhaustive()
    }
}

impl NotaryConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout.max(1))
    }

    /// Build the token encoder for the configured API key.
    pub fn token_encoder(&self) -> Result<ConnectTokenEncoder, DarwinCodesignError> {
        for (name, value) in [
            ("issuer", &self.issuer),
            ("key-id", &self.key_id),
            ("private-key", &self.private_key),
        ] {
            if value.is_empty() {
                return Err(DarwinCodesignError::Config(format!(
                    "notary.{} is required for notarization",
                    name
                )));
            }
        }

        ConnectTokenEncoder::from_private_key_source(&self.key_id, &self.issuer, &self.private_key)
    }
}

/// The `status` section.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct StatusConfig {
    pub wait: bool,
    pub poll_seconds: u64,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            wait: true,
            poll_seconds: 10,
            timeout_seconds: 900,
            max_retries: 5,
        }
    }
}

impl StatusConfig {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.poll_seconds.max(1)),
            timeout: Duration::from_secs(self.timeout_seconds),
            max_retries: self.max_retries,
        }
    }
}

/// Complete configuration.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub sign: SignConfig,
    pub notary: NotaryConfig,
    pub status: StatusConfig,
    pub dry_run: bool,
}

fn parse_bool(key: &str, value: &str) -> Result<bool, DarwinCodesignError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(DarwinCodesignError::Config(format!(
            "{} expects a boolean; got {}",
            key, value
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, DarwinCodesignError> {
    value.trim().parse::<T>().map_err(|_| {
        DarwinCodesignError::Config(format!("{} expects a number; got {}", key, value))
    })
}

/// Resolve the configuration file to load, if any.
fn discover_in(
    explicit: Option<&Path>,
    current_dir: &Path,
    config_dir: Option<PathBuf>,
) -> Result<Option<PathBuf>, DarwinCodesignError> {
    if let Some(path) = explicit {
        return if path.is_file() {
            Ok(Some(path.to_path_buf()))
        } else {
            Err(DarwinCodesignError::Config(format!(
                "configuration file {} does not exist",
                path.display()
            )))
        };
    }

    let candidates = std::iter::once(current_dir.join(CONFIG_FILE_NAME))
        .chain(config_dir.map(|dir| dir.join("dcodesign").join("config.yaml")));

    for candidate in candidates {
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

impl Config {
    /// Parse a YAML document.
    pub fn from_yaml(data: &str) -> Result<Self, DarwinCodesignError> {
        // An empty document is a YAML null.
        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_yaml::from_str(data)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, DarwinCodesignError> {
        info!("loading configuration from {}", path.display());
        let data = std::fs::read_to_string(path)?;

        Self::from_yaml(&data)
    }

    /// Find and load configuration, then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, DarwinCodesignError> {
        let current_dir = std::env::current_dir()?;

        let mut config = match discover_in(explicit, &current_dir, dirs::config_dir())? {
            Some(path) => Self::from_path(&path)?,
            None => {
                debug!("no configuration file found; using defaults");
                Self::default()
            }
        };

        config.apply_env(std::env::vars())?;

        Ok(config)
    }

    /// Apply `DCODESIGN_<SECTION>_<KEY>` overrides.
    ///
    /// Variables with the prefix that name no known key are ignored.
    pub fn apply_env(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), DarwinCodesignError> {
        for (key, value) in vars {
            let name = match key.strip_prefix(ENV_VAR_PREFIX) {
                Some(name) => name,
                None => continue,
            };

            match name {
                "SIGN_IDENTITY" => self.sign.identity = value,
                "SIGN_P12" => self.sign.p12 = value,
                "SIGN_PASSWORD" => self.sign.password = value,
                "SIGN_TIMESTAMP_SERVER" => self.sign.timestamp_server = value,
                "SIGN_AD_HOC" => self.sign.ad_hoc = parse_bool(&key, &value)?,
                "SIGN_FAIL_WITHOUT_FULL_CHAIN" => {
                    self.sign.fail_without_full_chain = parse_bool(&key, &value)?
                }
                "SIGN_DIGESTS" => {
                    self.sign.digests = value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                }
                "SIGN_ENTITLEMENTS" => self.sign.entitlements = value,
                "SIGN_RUNTIME" => self.sign.runtime = parse_bool(&key, &value)?,
                "NOTARY_ISSUER" => self.notary.issuer = value,
                "NOTARY_KEY_ID" => self.notary.key_id = value,
                "NOTARY_PRIVATE_KEY" => self.notary.private_key = value,
                "NOTARY_HTTP_TIMEOUT" => self.notary.http_timeout = parse_number(&key, &value)?,
                "NOTARY_UPLOAD_TIMEOUT" => {
                    self.notary.upload_timeout = parse_number(&key, &value)?
                }
                "STATUS_WAIT" => self.status.wait = parse_bool(&key, &value)?,
                "STATUS_POLL_SECONDS" => self.status.poll_seconds = parse_number(&key, &value)?,
                "STATUS_TIMEOUT_SECONDS" => {
                    self.status.timeout_seconds = parse_number(&key, &value)?
                }
                "STATUS_MAX_RETRIES" => self.status.max_retries = parse_number(&key, &value)?,
                "DRY_RUN" => self.dry_run = parse_bool(&key, &value)?,
                _ => {
                    debug!("ignoring unrecognized environment variable {}", key);
                    continue;
                }
            }

            debug!("configuration overridden by {}", key);
        }

        Ok(())
    }
}
