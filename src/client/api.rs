//! API client for the Casebook HTTP surface
//!
//! The session travels as the `casebook_session` cookie, captured from
//! `Set-Cookie` on responses and replayed on requests. It is never put in a
//! URL.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{ACCEPT, COOKIE, SET_COOKIE};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::connections::{ConnectionHealthReport, GrantOutcome, ServiceName};
use crate::identity::{User, SESSION_COOKIE};
use crate::jobs::{GenerationJob, GenerationRequest, JobHandle, JobSummary};
use crate::types::{CasebookError, ErrorBody};

/// Raw bytes of an open event stream
pub type ByteStream = BoxStream<'static, Result<Bytes, CasebookError>>;

#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn me(&self) -> Result<User, CasebookError>;

    async fn logout(&self) -> Result<(), CasebookError>;

    async fn connection_status(&self) -> Result<ConnectionHealthReport, CasebookError>;

    async fn grant_connection(&self, service: ServiceName) -> Result<GrantOutcome, CasebookError>;

    async fn revoke_connection(&self, service: ServiceName) -> Result<(), CasebookError>;

    async fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle, CasebookError>;

    async fn cancel_job(&self, job_id: Uuid) -> Result<GenerationJob, CasebookError>;

    async fn get_job(&self, job_id: Uuid) -> Result<GenerationJob, CasebookError>;

    async fn list_jobs(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<JobSummary>, CasebookError>;

    async fn delete_job(&self, job_id: Uuid) -> Result<(), CasebookError>;

    /// Open the progress stream of a job
    async fn open_progress_stream(&self, job_id: Uuid) -> Result<ByteStream, CasebookError>;
}

/// `ApiClient` over reqwest
pub struct HttpApiClient {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    session: RwLock<Option<String>>,
}

impl HttpApiClient {
    /// `timeout` bounds connecting and every non-streaming request
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CasebookError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CasebookError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(base_url, http, timeout))
    }

    pub fn with_client(base_url: &str, http: reqwest::Client, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            request_timeout,
            session: RwLock::new(None),
        }
    }

    /// Adopt an existing session token
    pub fn with_session(self, token: impl Into<String>) -> Self {
        self.set_session(Some(token.into()));
        self
    }

    pub fn has_session(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn set_session(&self, token: Option<String>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        let session = self.session.read().unwrap_or_else(|e| e.into_inner());
        match session.as_deref() {
            Some(token) => builder.header(COOKIE, format!("{}={}", SESSION_COOKIE, token)),
            None => builder,
        }
    }

    /// Track session cookie changes announced by the server
    fn absorb_cookies(&self, response: &reqwest::Response) {
        for value in response.headers().get_all(SET_COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            let pair = value.split(';').next().unwrap_or_default();
            let Some((name, token)) = pair.trim().split_once('=') else {
                continue;
            };
            if name == SESSION_COOKIE {
                debug!(cleared = token.is_empty(), "Session cookie updated");
                self.set_session((!token.is_empty()).then(|| token.to_string()));
            }
        }
    }

    /// Send and map non-2xx responses back to the typed error
    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, CasebookError> {
        let response = builder.send().await?;
        self.absorb_cookies(&response);

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&text).unwrap_or_else(|_| ErrorBody {
            detail: if text.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                text
            },
            code: String::new(),
        });
        Err(CasebookError::from_wire(status, body))
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, CasebookError> {
        let response = self.send(builder.timeout(self.request_timeout)).await?;
        response
            .json()
            .await
            .map_err(|e| CasebookError::Internal(format!("Invalid response body: {}", e)))
    }

    async fn discard(&self, builder: RequestBuilder) -> Result<(), CasebookError> {
        self.send(builder.timeout(self.request_timeout)).await?;
        Ok(())
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn me(&self) -> Result<User, CasebookError> {
        self.json(self.request(Method::GET, "/auth/me")).await
    }

    async fn logout(&self) -> Result<(), CasebookError> {
        let result = self.discard(self.request(Method::POST, "/auth/logout")).await;
        self.set_session(None);
        result
    }

    async fn connection_status(&self) -> Result<ConnectionHealthReport, CasebookError> {
        self.json(self.request(Method::GET, "/auth/connections/status"))
            .await
    }

    async fn grant_connection(&self, service: ServiceName) -> Result<GrantOutcome, CasebookError> {
        let path = format!("/auth/connections/{}/grant", service);
        self.json(self.request(Method::POST, &path)).await
    }

    async fn revoke_connection(&self, service: ServiceName) -> Result<(), CasebookError> {
        let path = format!("/auth/connections/{}", service);
        self.discard(self.request(Method::DELETE, &path)).await
    }

    async fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle, CasebookError> {
        self.json(self.request(Method::POST, "/case-study/generate").json(request))
            .await
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<GenerationJob, CasebookError> {
        let path = format!("/case-study/{}/cancel", job_id);
        self.json(self.request(Method::POST, &path)).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<GenerationJob, CasebookError> {
        let path = format!("/case-study/{}", job_id);
        self.json(self.request(Method::GET, &path)).await
    }

    async fn list_jobs(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<JobSummary>, CasebookError> {
        let mut query = Vec::new();
        if let Some(limit) = limit {
            query.push(("limit", limit));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset));
        }
        self.json(self.request(Method::GET, "/case-study/").query(&query))
            .await
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), CasebookError> {
        let path = format!("/case-study/{}", job_id);
        self.discard(self.request(Method::DELETE, &path)).await
    }

    async fn open_progress_stream(&self, job_id: Uuid) -> Result<ByteStream, CasebookError> {
        let path = format!("/case-study/{}/stream", job_id);
        let response = self
            .send(
                self.request(Method::GET, &path)
                    .header(ACCEPT, "text/event-stream"),
            )
            .await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| CasebookError::Stream(e.to_string())))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalised() {
        let client = HttpApiClient::new("http://localhost:8001/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "http://localhost:8001");
        assert!(!client.has_session());
    }

    #[test]
    fn test_session_is_replayed_as_cookie() {
        let client = HttpApiClient::new("http://localhost:8001", Duration::from_secs(5))
            .unwrap()
            .with_session("abc");
        let request = client
            .request(Method::GET, "/auth/me")
            .build()
            .unwrap();
        assert_eq!(request.url().as_str(), "http://localhost:8001/auth/me");
        assert_eq!(
            request.headers()[COOKIE].to_str().unwrap(),
            format!("{}=abc", SESSION_COOKIE)
        );
    }
}
