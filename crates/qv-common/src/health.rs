//! Component health aggregation.
//!
//! Components register probes; the registry rolls their statuses up into a
//! composite: any Unhealthy makes the whole Unhealthy, any Degraded makes
//! it Degraded, otherwise Healthy. Liveness additionally fails when a
//! critical component's probe panics.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health probe; returns the component's current status. Probes must be
/// cheap and non-blocking.
pub type HealthProbe = Arc<dyn Fn() -> HealthStatus + Send + Sync>;

struct ProbeEntry {
    name: String,
    critical: bool,
    probe: HealthProbe,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompositeHealth {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct HealthRegistry {
    probes: RwLock<Vec<ProbeEntry>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, probe: HealthProbe) {
        self.register_with(name, false, probe);
    }

    /// Critical components also gate liveness.
    pub fn register_critical(&self, name: impl Into<String>, probe: HealthProbe) {
        self.register_with(name, true, probe);
    }

    fn register_with(&self, name: impl Into<String>, critical: bool, probe: HealthProbe) {
        self.probes.write().push(ProbeEntry {
            name: name.into(),
            critical,
            probe,
        });
    }

    /// Evaluate every probe and roll up. A panicking probe counts as
    /// Unhealthy for that component.
    pub fn composite(&self) -> CompositeHealth {
        let probes = self.probes.read();
        let mut components = Vec::with_capacity(probes.len());
        let mut status = HealthStatus::Healthy;

        for entry in probes.iter() {
            let probe = entry.probe.clone();
            let component_status =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || probe()))
                    .unwrap_or(HealthStatus::Unhealthy);

            match component_status {
                HealthStatus::Unhealthy => status = HealthStatus::Unhealthy,
                HealthStatus::Degraded if status == HealthStatus::Healthy => {
                    status = HealthStatus::Degraded
                }
                _ => {}
            }

            components.push(ComponentHealth {
                name: entry.name.clone(),
                status: component_status,
                critical: entry.critical,
            });
        }

        CompositeHealth {
            status,
            components,
            checked_at: Utc::now(),
        }
    }

    /// Readiness is unhealthy iff the composite is unhealthy.
    pub fn readiness(&self) -> HealthStatus {
        match self.composite().status {
            HealthStatus::Unhealthy => HealthStatus::Unhealthy,
            _ => HealthStatus::Healthy,
        }
    }

    /// Liveness fails when any critical component is unhealthy.
    pub fn liveness(&self) -> HealthStatus {
        let composite = self.composite();
        let critical_down = composite
            .components
            .iter()
            .any(|c| c.critical && c.status == HealthStatus::Unhealthy);
        if critical_down {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }
}
