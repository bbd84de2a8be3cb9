//! Liveness tracking for the long-running loops of the telemetry worker.
//!
//! The worker runs several loops at once: one Kafka consumption loop per
//! pipeline, the checkpoint coordinator, and the librdkafka statistics
//! callbacks of each producer. The process only works while every one of them
//! keeps making progress, so each loop registers a component and reports on a
//! schedule shorter than its deadline.
//!
//! The registry is healthy when at least one component is registered and
//! every component reported healthy within its deadline. A component that
//! never reported is `Starting`, one whose deadline passed is `Stalled`.
//!
//! Reporting is a short write under a lock, so it is safe to call from async
//! tasks and from librdkafka's callback threads alike.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    Starting,
    HealthyUntil(Instant),
    Unhealthy,
    Stalled,
}

impl ComponentStatus {
    /// Resolve a deadline against `now`.
    fn at(self, now: Instant) -> Self {
        match self {
            ComponentStatus::HealthyUntil(until) if until <= now => ComponentStatus::Stalled,
            status => status,
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(_))
    }

    fn label(&self) -> &'static str {
        match self {
            ComponentStatus::Starting => "starting",
            ComponentStatus::HealthyUntil(_) => "healthy",
            ComponentStatus::Unhealthy => "unhealthy",
            ComponentStatus::Stalled => "stalled",
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Per component status, deadlines already resolved.
    pub components: BTreeMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let body: String = self
            .components
            .iter()
            .map(|(name, status)| format!("{}: {}\n", name, status.label()))
            .collect();
        (code, body).into_response()
    }
}

type Components = Arc<RwLock<BTreeMap<String, ComponentStatus>>>;

/// Reporting side of one registered component.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Report healthy until now + deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = self.component, "poisoned health registry lock"),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register `component`, which must then report at least every `deadline`.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall status, usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = Instant::now();
        let components: BTreeMap<String, ComponentStatus> = components
            .iter()
            .map(|(name, status)| (name.clone(), status.at(now)))
            .collect();
        let healthy = !components.is_empty() && components.values().all(|s| s.is_healthy());

        if healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, components);
        }
        HealthStatus {
            healthy,
            components,
        }
    }
}
