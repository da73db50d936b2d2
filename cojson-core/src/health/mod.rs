//! Health reporting for the sync server

use crate::core_node::LocalNode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn to_http_status(&self) -> u16 {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => 200,
            HealthStatus::Unhealthy => 503,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub timestamp: SystemTime,
    pub components: Vec<ComponentHealth>,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: SystemTime,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self { name: name.into(), status, message, last_check: SystemTime::now() }
    }
}

/// Latest status of each registered component
pub struct HealthChecker {
    start_time: SystemTime,
    version: String,
    components: Arc<RwLock<Vec<ComponentHealth>>>,
}

impl HealthChecker {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            start_time: SystemTime::now(),
            version: version.into(),
            components: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Insert or replace the component with the same name
    pub async fn report(&self, health: ComponentHealth) {
        let mut components = self.components.write().await;
        match components.iter_mut().find(|c| c.name == health.name) {
            Some(existing) => *existing = health,
            None => components.push(health),
        }
    }

    /// Re-run the node checks, then report
    pub async fn refresh(&self, node: &LocalNode) -> HealthCheck {
        self.report(checks::check_storage(node).await).await;
        self.report(checks::check_peers(node)).await;
        self.check_health().await
    }

    pub async fn check_health(&self) -> HealthCheck {
        let components = self.components.read().await.clone();

        let status = if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck {
            status,
            timestamp: SystemTime::now(),
            components,
            version: self.version.clone(),
            uptime_seconds: self.start_time.elapsed().unwrap_or(Duration::ZERO).as_secs(),
        }
    }

    pub async fn readiness_check(&self) -> bool {
        self.check_health().await.status != HealthStatus::Unhealthy
    }
}

pub mod checks {
    use super::*;

    /// Storage answers a read of our own account
    pub async fn check_storage(node: &LocalNode) -> ComponentHealth {
        let Some(storage) = node.storage() else {
            return ComponentHealth::degraded("storage", "No storage attached");
        };
        match storage.known_state(node.account_id()).await {
            Ok(_) => ComponentHealth::healthy("storage"),
            Err(err) => ComponentHealth::unhealthy("storage", err.to_string()),
        }
    }

    pub fn check_peers(node: &LocalNode) -> ComponentHealth {
        let count = node.sync().peer_count();
        let mut health = ComponentHealth::healthy("peers");
        health.message = Some(format!("{count} connected"));
        health
    }
}
