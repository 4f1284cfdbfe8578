// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! App Store Connect Notary API.
//!
//! See also <https://developer.apple.com/documentation/notaryapi>.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub const APPLE_NOTARY_SUBMIT_SOFTWARE_URL: &str =
    "https://appstoreconnect.apple.com/notary/v2/submissions";

/// A notification that the notary service sends you when notarization finishes.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionRequestNotification {
    pub channel: String,
    pub target: String,
}

/// Data that you provide when starting a submission to the notary service.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionRequest {
    pub notifications: Vec<NewSubmissionRequestNotification>,
    pub sha256: String,
    pub submission_name: String,
}

/// Temporary S3 credentials and location for uploading a submission.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionResponseDataAttributes {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_session_token: String,
    pub bucket: String,
    pub object: String,
}

impl std::fmt::Debug for NewSubmissionResponseDataAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewSubmissionResponseDataAttributes")
            .field("bucket", &self.bucket)
            .field("object", &self.object)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionResponseData {
    pub attributes: NewSubmissionResponseDataAttributes,
    pub id: String,
    pub r#type: String,
}

/// The notary service’s response to a software submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionResponse {
    pub data: NewSubmissionResponseData,
    #[serde(default)]
    pub meta: Value,
}

/// Processing state of a submission.
///
/// `InProgress` is the only non-terminal state.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum SubmissionStatus {
    #[serde(rename = "In Progress")]
    InProgress,
    Accepted,
    Invalid,
    Rejected,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "In Progress",
            Self::Accepted => "Accepted",
            Self::Invalid => "Invalid",
            Self::Rejected => "Rejected",
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about the status of a submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponseDataAttributes {
    pub created_date: String,
    pub name: String,
    pub status: SubmissionStatus,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponseData {
    pub attributes: SubmissionResponseDataAttributes,
    pub id: String,
    pub r#type: String,
}

/// The notary service’s response to a request for the status of a submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponse {
    pub data: SubmissionResponseData,
    #[serde(default)]
    pub meta: Value,
}

/// Previous submissions, most recent first.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionListResponse {
    pub data: Vec<SubmissionResponseData>,
    #[serde(default)]
    pub meta: Value,
}

/// Information about the log associated with the submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionLogResponseDataAttributes {
    pub developer_log_url: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionLogResponseData {
    pub attributes: SubmissionLogResponseDataAttributes,
    pub id: String,
    pub r#type: String,
}

/// The notary service’s response to a request for the log of a completed submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionLogResponse {
    pub data: SubmissionLogResponseData,
    #[serde(default)]
    pub meta: Value,
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    #[test]
    fn submission_status() {
        let response: SubmissionResponse = serde_json::from_str(indoc! {r#"
            {
              "data": {
                "attributes": {
                  "createdDate": "2022-06-08T01:38:09.498Z",
                  "name": "tool.zip",
                  "status": "In Progress"
                },
                "id": "2efe2717-52ef-43a5-96dc-0797e4ca1041",
                "type": "submissions"
              },
              "meta": {}
            }
        "#})
        .unwrap();

        assert_eq!(response.data.attributes.status, SubmissionStatus::InProgress);
        assert!(!response.data.attributes.status.is_terminal());
        assert_eq!(response.data.attributes.status.to_string(), "In Progress");

        let unknown = serde_json::from_str::<SubmissionStatus>(r#""Pending""#);
        assert!(unknown.is_err());
    }

    #[test]
    fn new_submission() {
        let response: NewSubmissionResponse = serde_json::from_str(indoc! {r#"
            {
              "data": {
                "attributes": {
                  "awsAccessKeyId": "ASIA",
                  "awsSecretAccessKey": "secret",
                  "awsSessionToken": "session",
                  "bucket": "notary-submissions-prod",
                  "object": "prod/AQAAAAEA/tool.zip"
                },
                "id": "abc",
                "type": "newSubmissions"
              }
            }
        "#})
        .unwrap();

        assert_eq!(response.data.id, "abc");
        assert_eq!(response.data.attributes.bucket, "notary-submissions-prod");
        assert!(!format!("{:?}", response).contains("secret"));

        let request = serde_json::to_value(NewSubmissionRequest {
            notifications: vec![],
            sha256: "00".into(),
            submission_name: "tool.zip".into(),
        })
        .unwrap();
        assert_eq!(request["submissionName"], "tool.zip");
    }
}
