//! Development source: answers from the scope itself

use async_trait::async_trait;

use super::query::{drive_query, gmail_query};
use super::{DataSource, SourceError, SourceSample};
use crate::connections::ServiceName;
use crate::jobs::ProjectScope;

/// Reports one result per keyword, or per participant when there are none
pub struct LoopbackSource {
    service: ServiceName,
}

impl LoopbackSource {
    pub fn new(service: ServiceName) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DataSource for LoopbackSource {
    fn service(&self) -> ServiceName {
        self.service
    }

    fn query(&self, scope: &ProjectScope) -> String {
        match self.service {
            ServiceName::Gmail => gmail_query(scope),
            ServiceName::Drive => drive_query(scope),
        }
    }

    async fn sample(
        &self,
        _access_token: &str,
        scope: &ProjectScope,
        limit: usize,
    ) -> Result<SourceSample, SourceError> {
        let subjects = if scope.keywords.is_empty() {
            &scope.participants
        } else {
            &scope.keywords
        };
        let titles: Vec<String> = subjects
            .iter()
            .take(limit)
            .map(|subject| match self.service {
                ServiceName::Gmail => format!("Re: {} / {}", scope.project_name, subject),
                ServiceName::Drive => format!("{} - {} notes", scope.project_name, subject),
            })
            .collect();

        Ok(SourceSample {
            service: self.service,
            query: self.query(scope),
            sample_count: titles.len(),
            estimated_total: Some(titles.len() as u64),
            sample_titles: titles,
        })
    }
}
