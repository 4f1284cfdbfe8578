// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! App Store Connect API client.

pub mod api_token;
pub mod notary_api;

use {
    self::{
        api_token::{ConnectTokenEncoder, TokenCache},
        notary_api::{
            NewSubmissionRequest, NewSubmissionResponse, SubmissionListResponse,
            SubmissionLogResponse, SubmissionResponse, APPLE_NOTARY_SUBMIT_SOFTWARE_URL,
        },
    },
    crate::error::DarwinCodesignError,
    log::{debug, error},
    reqwest::blocking::{Client, ClientBuilder, RequestBuilder},
    serde::de::DeserializeOwned,
    serde_json::Value,
    std::time::Duration,
};

/// Default timeout for a single HTTP request.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Obtain the [Client] used for HTTP requests.
pub fn default_client(timeout: Duration) -> Result<Client, DarwinCodesignError> {
    Ok(ClientBuilder::default()
        .user_agent(concat!("darwin-codesign/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()?)
}

/// Extract a human readable message from an error response body.
fn error_message(body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => value["errors"]
            .as_array()
            .and_then(|errors| errors.first())
            .and_then(|error| error["detail"].as_str().or_else(|| error["title"].as_str()))
            .map(|s| s.to_string())
            .unwrap_or_else(|| value.to_string()),
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

/// A client for the App Store Connect Notary API.
///
/// Every request carries a bearer token from a [TokenCache].
pub struct AppStoreConnectClient {
    client: Client,
    tokens: TokenCache,
}

impl AppStoreConnectClient {
    pub fn new(encoder: ConnectTokenEncoder, timeout: Duration) -> Result<Self, DarwinCodesignError> {
        Self::with_token_cache(TokenCache::new(encoder), timeout)
    }

    pub fn with_token_cache(
        tokens: TokenCache,
        timeout: Duration,
    ) -> Result<Self, DarwinCodesignError> {
        Ok(Self {
            client: default_client(timeout)?,
            tokens,
        })
    }

    fn send_request<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, DarwinCodesignError> {
        let request = request
            .bearer_auth(self.tokens.token()?)
            .header("Accept", "application/json")
            .build()?;
        let url = request.url().to_string();

        debug!("{} {}", request.method(), url);

        let response = self.client.execute(request)?;
        let status = response.status();
        let body = response.bytes()?;

        if status.is_success() {
            Ok(serde_json::from_slice::<T>(body.as_ref())?)
        } else {
            error!("HTTP {} from {}", status.as_u16(), url);

            Err(DarwinCodesignError::NotaryHttp {
                status: status.as_u16(),
                message: error_message(body.as_ref()),
            })
        }
    }

    /// Create a submission to the Notary API.
    ///
    /// The response carries the submission id along with temporary
    /// credentials for uploading the content.
    pub fn create_submission(
        &self,
        sha256: &str,
        submission_name: &str,
    ) -> Result<NewSubmissionResponse, DarwinCodesignError> {
        let body = NewSubmissionRequest {
            notifications: Vec::new(),
            sha256: sha256.to_string(),
            submission_name: submission_name.to_string(),
        };
        let req = self
            .client
            .post(APPLE_NOTARY_SUBMIT_SOFTWARE_URL)
            .header("Content-Type", "application/json")
            .json(&body);

        self.send_request(req)
    }

    /// Fetch the status of a Notary API submission.
    pub fn get_submission(
        &self,
        submission_id: &str,
    ) -> Result<SubmissionResponse, DarwinCodesignError> {
        let req = self.client.get(format!(
            "{}/{}",
            APPLE_NOTARY_SUBMIT_SOFTWARE_URL, submission_id
        ));

        self.send_request(req)
    }

    /// List previous submissions.
    pub fn list_submissions(&self) -> Result<SubmissionListResponse, DarwinCodesignError> {
        let req = self.client.get(APPLE_NOTARY_SUBMIT_SOFTWARE_URL);

        self.send_request(req)
    }

    /// Fetch the developer log of a completed submission.
    pub fn get_submission_log(&self, submission_id: &str) -> Result<Value, DarwinCodesignError> {
        let req = self.client.get(format!(
            "{}/{}/logs",
            APPLE_NOTARY_SUBMIT_SOFTWARE_URL, submission_id
        ));

        let res = self.send_request::<SubmissionLogResponse>(req)?;

        // The log URL is pre-signed and must not carry the API token.
        let url = res.data.attributes.developer_log_url;
        debug!("GET {}", url);
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(DarwinCodesignError::NotaryHttp {
                status: status.as_u16(),
                message: "unable to fetch developer log".to_string(),
            });
        }

        Ok(response.json::<Value>()?)
    }
}
