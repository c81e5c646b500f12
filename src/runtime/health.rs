use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;

// ============================================================================
// Health Monitoring
// ============================================================================
//
// Components report their own status; the registry folds them into one
// system status for the `/health` endpoint and the supervisor's periodic log.
//
// ============================================================================

/// Health status of a component
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health information for a component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub check_time: DateTime<Utc>,
}

#[derive(Default)]
pub struct HealthRegistry {
    components: RwLock<BTreeMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, component: &str, status: HealthStatus, details: Option<String>) {
        tracing::debug!(component, status = ?status, "Updated component health");

        let health = ComponentHealth {
            name: component.to_string(),
            status,
            last_check: Utc::now(),
            details,
        };

        self.components
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(component.to_string(), health);
    }

    pub fn snapshot(&self) -> SystemHealth {
        let components = self
            .components
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        SystemHealth {
            overall_status: Self::compute_overall_status(&components),
            components,
            check_time: Utc::now(),
        }
    }

    fn compute_overall_status(components: &BTreeMap<String, ComponentHealth>) -> HealthStatus {
        let mut degraded = Vec::new();
        let mut unhealthy = Vec::new();

        for (name, health) in components {
            match &health.status {
                HealthStatus::Unhealthy(msg) => unhealthy.push(format!("{name}: {msg}")),
                HealthStatus::Degraded(msg) => degraded.push(format!("{name}: {msg}")),
                HealthStatus::Healthy => {}
            }
        }

        if !unhealthy.is_empty() {
            HealthStatus::Unhealthy(unhealthy.join(", "))
        } else if !degraded.is_empty() {
            HealthStatus::Degraded(degraded.join(", "))
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_healthy() {
        assert_eq!(HealthRegistry::new().snapshot().overall_status, HealthStatus::Healthy);
    }

    #[test]
    fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.update("processor", HealthStatus::Healthy, None);
        registry.update("sweeper", HealthStatus::Degraded("last run failed".into()), None);
        assert!(matches!(
            registry.snapshot().overall_status,
            HealthStatus::Degraded(ref msg) if msg.contains("sweeper")
        ));

        registry.update("channel", HealthStatus::Unhealthy("circuit open".into()), None);
        assert!(matches!(
            registry.snapshot().overall_status,
            HealthStatus::Unhealthy(ref msg) if msg == "channel: circuit open"
        ));
    }

    #[test]
    fn test_update_replaces_previous_status() {
        let registry = HealthRegistry::new();
        registry.update("sweeper", HealthStatus::Unhealthy("down".into()), None);
        registry.update("sweeper", HealthStatus::Healthy, Some("recovered".into()));

        let snapshot = registry.snapshot();
        assert!(snapshot.overall_status.is_healthy());
        assert_eq!(
            snapshot.components["sweeper"].details.as_deref(),
            Some("recovered")
        );
    }

    #[test]
    fn test_snapshot_serializes_for_http() {
        let registry = HealthRegistry::new();
        registry.update("sweeper", HealthStatus::Degraded("slow".into()), None);

        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json["overall_status"]["state"], "Degraded");
        assert_eq!(json["components"]["sweeper"]["status"]["reason"], "slow");
    }
}
