//! Liveness reporting for the sink's long-running loops.
//!
//! Each loop registers a component with a deadline and must report healthy
//! more often than that. The process is healthy while every registered
//! component is; a component that missed its deadline is reported as
//! stalled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    HealthyUntil(Instant),
    Unhealthy,
    /// Missed its `HealthyUntil` deadline
    Stalled,
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, body).into_response()
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more often than the deadline the component registered with.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        let mut components = self.components.write();
        match components.get_mut(&self.component) {
            Some(current) => *current = status,
            None => {
                components.insert(self.component.clone(), status);
            }
        }
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
            name: name.to_string(),
            components: Components::default(),
        }
    }

    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: Arc::clone(&self.components),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Combined status of every registered component. Unhealthy when nothing
    /// registered yet. Can be returned from an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let now = Instant::now();
        let components: HashMap<String, ComponentStatus> = self
            .components
            .read()
            .iter()
            .map(|(name, status)| {
                let status = match status {
                    ComponentStatus::HealthyUntil(until) if *until <= now => {
                        ComponentStatus::Stalled
                    }
                    other => *other,
                };
                (name.clone(), status)
            })
            .collect();

        let healthy = !components.is_empty()
            && components
                .values()
                .all(|status| matches!(status, ComponentStatus::HealthyUntil(_)));
        if !healthy {
            warn!(registry = %self.name, ?components, "health check failed");
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}
