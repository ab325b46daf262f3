//! Connection health reporting
//!
//! Per-service health is reduced into one aggregate: `no_connections` when no
//! service holds credentials, `degraded` when at least one that does is
//! unhealthy, `healthy` otherwise. `error` is reserved for a report that could
//! not be assembled at all.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::model::{ConnectionStatus, ServiceConnection, ServiceName, TokenStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    NoConnections,
    Error,
}

impl OverallHealth {
    pub fn reduce<'a>(services: impl IntoIterator<Item = &'a ServiceHealth>) -> Self {
        let mut any_connected = false;
        for health in services {
            if health.connected {
                any_connected = true;
                if !health.healthy {
                    return Self::Degraded;
                }
            }
        }
        if any_connected {
            Self::Healthy
        } else {
            Self::NoConnections
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Credentials are held, whether or not they still work
    pub connected: bool,
    pub healthy: bool,
    pub status: ConnectionStatus,
    pub token_status: Option<TokenStatus>,
    pub last_error: Option<String>,
}

impl ServiceHealth {
    pub fn from_connection(
        connection: &ServiceConnection,
        now: DateTime<Utc>,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            connected: connection.holds_credentials(),
            healthy: connection.is_healthy(now),
            status: connection.status,
            token_status: connection.token_status(now, refresh_buffer),
            last_error: connection.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHealthReport {
    pub user_id: Uuid,
    pub overall: OverallHealth,
    pub services: BTreeMap<ServiceName, ServiceHealth>,
    pub issues: Vec<String>,
    pub last_checked: DateTime<Utc>,
}

impl ConnectionHealthReport {
    pub fn from_services(
        user_id: Uuid,
        services: BTreeMap<ServiceName, ServiceHealth>,
        now: DateTime<Utc>,
    ) -> Self {
        let issues = services
            .iter()
            .filter_map(|(service, health)| describe_issue(*service, health))
            .collect();
        Self {
            user_id,
            overall: OverallHealth::reduce(services.values()),
            services,
            issues,
            last_checked: now,
        }
    }

    pub fn failed(user_id: Uuid, detail: String, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            overall: OverallHealth::Error,
            services: BTreeMap::new(),
            issues: vec![detail],
            last_checked: now,
        }
    }

    pub fn healthy_services(&self) -> Vec<ServiceName> {
        self.services
            .iter()
            .filter(|(_, health)| health.healthy)
            .map(|(service, _)| *service)
            .collect()
    }

    pub fn has_healthy_connection(&self) -> bool {
        self.services.values().any(|health| health.healthy)
    }
}

fn describe_issue(service: ServiceName, health: &ServiceHealth) -> Option<String> {
    if health.status == ConnectionStatus::Error {
        let detail = health.last_error.as_deref().unwrap_or("provider error");
        return Some(format!("{}: {}", service, detail));
    }
    if health.connected && !health.healthy {
        return Some(format!("{} credentials expired; refresh or reconnect", service));
    }
    match &health.token_status {
        Some(token) if token.expiring_soon => Some(format!(
            "{} credentials expire in {} minutes",
            service,
            token.expires_in_minutes.unwrap_or(0)
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(connected: bool, healthy: bool, status: ConnectionStatus) -> ServiceHealth {
        ServiceHealth {
            connected,
            healthy,
            status,
            token_status: None,
            last_error: None,
        }
    }

    #[test]
    fn test_reduce() {
        let healthy = health(true, true, ConnectionStatus::Connected);
        let expired = health(true, false, ConnectionStatus::Expired);
        let idle = health(false, false, ConnectionStatus::Disconnected);

        assert_eq!(OverallHealth::reduce([&idle, &idle]), OverallHealth::NoConnections);
        assert_eq!(OverallHealth::reduce([&healthy, &idle]), OverallHealth::Healthy);
        assert_eq!(OverallHealth::reduce([&expired, &idle]), OverallHealth::Degraded);
        assert_eq!(OverallHealth::reduce([&healthy, &expired]), OverallHealth::Degraded);
        assert_eq!(OverallHealth::reduce(std::iter::empty()), OverallHealth::NoConnections);
    }

    #[test]
    fn test_report_lists_issues() {
        let now = Utc::now();
        let mut services = BTreeMap::new();
        services.insert(ServiceName::Gmail, health(true, false, ConnectionStatus::Expired));
        services.insert(
            ServiceName::Drive,
            health(false, false, ConnectionStatus::Disconnected),
        );

        let report = ConnectionHealthReport::from_services(Uuid::new_v4(), services, now);
        assert_eq!(report.overall, OverallHealth::Degraded);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].starts_with("gmail"));
        assert!(!report.has_healthy_connection());
    }

    #[test]
    fn test_report_serializes_service_keys() {
        let mut services = BTreeMap::new();
        services.insert(ServiceName::Gmail, health(true, true, ConnectionStatus::Connected));
        let report = ConnectionHealthReport::from_services(Uuid::new_v4(), services, Utc::now());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["overall"], "healthy");
        assert_eq!(json["services"]["gmail"]["healthy"], true);

        let back: ConnectionHealthReport = serde_json::from_value(json).unwrap();
        assert_eq!(back.healthy_services(), vec![ServiceName::Gmail]);
    }
}
