//! Gmail and Drive over their REST APIs

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::query::{drive_query, gmail_query};
use super::{DataSource, SourceError, SourceSample};
use crate::connections::ServiceName;
use crate::jobs::ProjectScope;

/// Messages whose subject is looked up for a sample
const SUBJECT_LOOKUPS: usize = 3;

fn client(timeout: Duration) -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SourceError::Transport(e.to_string()))
}

/// Send an authorized GET and decode the JSON answer
async fn get_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    access_token: &str,
) -> Result<T, SourceError> {
    let response = request
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| SourceError::Transport(e.to_string()))?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(SourceError::Unauthorized);
    }
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(SourceError::Rejected {
            status: status.as_u16(),
            detail,
        });
    }

    response
        .json()
        .await
        .map_err(|e| SourceError::Decode(e.to_string()))
}

// =============================================================================
// Gmail
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    result_size_estimate: Option<u64>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
struct MessageMetadata {
    payload: Option<MessagePayload>,
}

#[derive(Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<MessageHeader>,
}

#[derive(Deserialize)]
struct MessageHeader {
    name: String,
    value: String,
}

impl MessageMetadata {
    fn subject(self) -> Option<String> {
        self.payload?
            .headers
            .into_iter()
            .find(|h| h.name.eq_ignore_ascii_case("subject"))
            .map(|h| h.value)
    }
}

pub struct GmailSource {
    api_base: String,
    http: reqwest::Client,
}

impl GmailSource {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            http: client(timeout)?,
        })
    }

    async fn subject(&self, access_token: &str, id: &str) -> Result<Option<String>, SourceError> {
        let request = self
            .http
            .get(format!("{}/gmail/v1/users/me/messages/{}", self.api_base, id))
            .query(&[("format", "metadata"), ("metadataHeaders", "Subject")]);
        let message: MessageMetadata = get_json(request, access_token).await?;
        Ok(message.subject())
    }
}

#[async_trait]
impl DataSource for GmailSource {
    fn service(&self) -> ServiceName {
        ServiceName::Gmail
    }

    fn query(&self, scope: &ProjectScope) -> String {
        gmail_query(scope)
    }

    async fn sample(
        &self,
        access_token: &str,
        scope: &ProjectScope,
        limit: usize,
    ) -> Result<SourceSample, SourceError> {
        let query = self.query(scope);
        let max_results = limit.to_string();
        let request = self
            .http
            .get(format!("{}/gmail/v1/users/me/messages", self.api_base))
            .query(&[("q", query.as_str()), ("maxResults", max_results.as_str())]);
        let list: MessageList = get_json(request, access_token).await?;

        let mut sample_titles = Vec::new();
        for message in list.messages.iter().take(SUBJECT_LOOKUPS) {
            match self.subject(access_token, &message.id).await {
                Ok(Some(subject)) => sample_titles.push(subject),
                Ok(None) => {}
                Err(err) => debug!(message_id = %message.id, error = %err, "Subject lookup failed"),
            }
        }

        Ok(SourceSample {
            service: ServiceName::Gmail,
            query,
            sample_count: list.messages.len(),
            estimated_total: list.result_size_estimate,
            sample_titles,
        })
    }
}

// =============================================================================
// Drive
// =============================================================================

const DRIVE_FIELDS: &str = "files(id,name,mimeType,modifiedTime)";

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    name: String,
}

pub struct DriveSource {
    api_base: String,
    http: reqwest::Client,
}

impl DriveSource {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            http: client(timeout)?,
        })
    }
}

#[async_trait]
impl DataSource for DriveSource {
    fn service(&self) -> ServiceName {
        ServiceName::Drive
    }

    fn query(&self, scope: &ProjectScope) -> String {
        drive_query(scope)
    }

    async fn sample(
        &self,
        access_token: &str,
        scope: &ProjectScope,
        limit: usize,
    ) -> Result<SourceSample, SourceError> {
        let query = self.query(scope);
        let page_size = limit.to_string();
        let request = self
            .http
            .get(format!("{}/drive/v3/files", self.api_base))
            .query(&[
                ("q", query.as_str()),
                ("pageSize", page_size.as_str()),
                ("orderBy", "modifiedTime desc"),
                ("fields", DRIVE_FIELDS),
            ]);
        let list: FileList = get_json(request, access_token).await?;

        Ok(SourceSample {
            service: ServiceName::Drive,
            query,
            sample_count: list.files.len(),
            estimated_total: None,
            sample_titles: list.files.into_iter().take(5).map(|f| f.name).collect(),
        })
    }
}
