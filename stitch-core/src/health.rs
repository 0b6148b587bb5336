//! Liveness reporting for the worker loops.
//!
//! Each loop registers a component and reports a heartbeat more often than
//! its deadline; a component that stops reporting is considered stalled and
//! takes the process liveness red. Readiness and liveness are deliberately
//! not merged: this registry only answers "are the loops still turning".

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet.
    Starting,
    /// Reported healthy; must report again before the instant passes.
    HealthyUntil(Instant),
    /// Reported unhealthy.
    Unhealthy,
}

/// Combined process liveness, rendered by the `/_liveness` endpoint.
#[derive(Debug, Default)]
pub struct HealthStatus {
    /// True only when every registered component reported within deadline.
    pub healthy: bool,
    /// Per-component state, for debugging.
    pub components: HashMap<String, String>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. The returned handle goes to the worker loop,
    /// which must report at least once per `deadline`.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        self.components
            .write()
            .expect("poisoned HealthRegistry lock")
            .insert(component.to_owned(), ComponentStatus::Starting);

        HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        }
    }

    /// Combined status over every registered component. An empty registry is
    /// unhealthy: nothing has proven the process alive yet.
    pub fn status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");
        let now = Instant::now();

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::new(),
        };

        for (name, component) in components.iter() {
            let label = match component {
                ComponentStatus::Starting => {
                    status.healthy = false;
                    "starting"
                }
                ComponentStatus::HealthyUntil(until) if *until > now => "healthy",
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    "stalled"
                }
                ComponentStatus::Unhealthy => {
                    status.healthy = false;
                    "unhealthy"
                }
            };
            status.components.insert(name.clone(), label.to_owned());
        }

        status
    }
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy for the next deadline window.
    pub fn report_healthy(&self) {
        self.report(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_unhealthy(&self) {
        self.report(ComponentStatus::Unhealthy);
    }

    fn report(&self, state: ComponentStatus) {
        self.components
            .write()
            .expect("poisoned HealthRegistry lock")
            .insert(self.component.clone(), state);
    }
}
