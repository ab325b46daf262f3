//! Data sources behind a connection
//!
//! A [`DataSource`] searches one connected service for material matching a
//! project scope. The orchestrator samples every usable source before it
//! generates, and the preview route reports the same samples without starting
//! a job.
//!
//! - `query` - Gmail and Drive search expressions built from a scope
//! - `google` - sources reached over the Google REST APIs
//! - `loopback` - canned results for development

pub mod google;
pub mod loopback;
pub mod query;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connections::ServiceName;
use crate::jobs::{DateRange, ProjectScope};
use crate::types::CasebookError;

pub use google::{DriveSource, GmailSource};
pub use loopback::LoopbackSource;
pub use query::{drive_query, gmail_query};

/// Results a preview asks each source for
pub const PREVIEW_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Transport(String),
    #[error("source rejected the access token")]
    Unauthorized,
    #[error("source returned {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("unreadable source response: {0}")]
    Decode(String),
}

impl From<SourceError> for CasebookError {
    fn from(err: SourceError) -> Self {
        Self::Provider(err.to_string())
    }
}

/// What a search of one source found
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSample {
    pub service: ServiceName,
    /// Search expression sent to the service
    pub query: String,
    pub sample_count: usize,
    /// The service's own estimate of the full result size, when it gives one
    pub estimated_total: Option<u64>,
    pub sample_titles: Vec<String>,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn service(&self) -> ServiceName;

    /// Search expression this source runs for `scope`
    fn query(&self, scope: &ProjectScope) -> String;

    /// Run the scope's search, returning at most `limit` results
    async fn sample(
        &self,
        access_token: &str,
        scope: &ProjectScope,
        limit: usize,
    ) -> Result<SourceSample, SourceError>;
}

/// Data source per service
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: BTreeMap<ServiceName, Arc<dyn DataSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loopback source for every service
    pub fn loopback() -> Self {
        ServiceName::ALL.into_iter().fold(Self::new(), |registry, service| {
            registry.with(Arc::new(LoopbackSource::new(service)))
        })
    }

    pub fn with(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.insert(source.service(), source);
        self
    }

    pub fn get(&self, service: ServiceName) -> Option<Arc<dyn DataSource>> {
        self.sources.get(&service).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Per-service outcome of a preview
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SourceEstimate {
    Sampled(SourceSample),
    Failed { error: String },
}

/// Answer of `POST /data/preview`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPreview {
    pub project_name: String,
    pub date_range: DateRange,
    pub keywords: Vec<String>,
    pub participants: Vec<String>,
    /// Services whose search succeeded
    pub available_sources: Vec<ServiceName>,
    pub estimated_results: BTreeMap<ServiceName, SourceEstimate>,
    pub preview_timestamp: DateTime<Utc>,
}

impl DataPreview {
    pub fn new(scope: &ProjectScope) -> Self {
        Self {
            project_name: scope.project_name.clone(),
            date_range: scope.date_range.clone(),
            keywords: scope.keywords.clone(),
            participants: scope.participants.clone(),
            available_sources: Vec::new(),
            estimated_results: BTreeMap::new(),
            preview_timestamp: Utc::now(),
        }
    }

    /// Record one service's search, or why it could not run
    pub fn record(&mut self, service: ServiceName, result: Result<SourceSample, String>) {
        let estimate = match result {
            Ok(sample) => {
                self.available_sources.push(service);
                SourceEstimate::Sampled(sample)
            }
            Err(error) => SourceEstimate::Failed { error },
        };
        self.estimated_results.insert(service, estimate);
    }

    pub fn sample_count(&self, service: ServiceName) -> Option<usize> {
        match self.estimated_results.get(&service)? {
            SourceEstimate::Sampled(sample) => Some(sample.sample_count),
            SourceEstimate::Failed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn scope() -> ProjectScope {
        let end = Utc::now();
        ProjectScope {
            project_name: "Atlas".into(),
            date_range: DateRange {
                start: end - Duration::days(7),
                end,
            },
            participants: vec!["ada@example.com".into()],
            keywords: vec!["migration".into()],
            source_reference: None,
        }
    }

    #[test]
    fn test_preview_records_failures_apart() {
        let mut preview = DataPreview::new(&scope());
        preview.record(
            ServiceName::Gmail,
            Ok(SourceSample {
                service: ServiceName::Gmail,
                query: "q".into(),
                sample_count: 3,
                estimated_total: Some(40),
                sample_titles: vec!["Kickoff".into()],
            }),
        );
        preview.record(ServiceName::Drive, Err(SourceError::Unauthorized.to_string()));

        assert_eq!(preview.available_sources, vec![ServiceName::Gmail]);
        assert_eq!(preview.sample_count(ServiceName::Gmail), Some(3));
        assert_eq!(preview.sample_count(ServiceName::Drive), None);

        let json = serde_json::to_value(&preview).unwrap();
        assert_eq!(json["estimated_results"]["gmail"]["estimated_total"], 40);
        assert_eq!(
            json["estimated_results"]["drive"]["error"],
            "source rejected the access token"
        );
    }

    #[test]
    fn test_loopback_registry_covers_every_service() {
        let registry = SourceRegistry::loopback();
        for service in ServiceName::ALL {
            assert_eq!(registry.get(service).unwrap().service(), service);
        }
        assert!(SourceRegistry::new().is_empty());
    }
}
