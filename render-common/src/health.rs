//! Liveness reporting for the background loops.
//!
//! The orchestrator is only trustworthy while the queue manager, the worker
//! monitor and the webhook dispatcher are all ticking: a wedged loop means
//! jobs sit in the queue or webhooks never fire, while the HTTP surface
//! keeps answering happily. Each loop therefore reports on every tick with
//! a deadline; a loop that misses its deadline flips the process liveness
//! probe so the scheduler restarts us.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Reported healthy; must report again before the deadline passes.
    HealthyUntil(DateTime<Utc>),
    /// Reported unhealthy explicitly.
    Unhealthy,
    /// Missed its reporting deadline.
    Stalled,
}

#[derive(Clone, Default)]
pub struct LivenessRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

/// Handle held by one background loop to report its own health.
#[derive(Clone)]
pub struct LivenessHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug)]
pub struct LivenessStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl LivenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component; the returned handle must report healthy more
    /// often than `deadline`.
    pub fn register(&self, component: &str, deadline: Duration) -> LivenessHandle {
        let mut components = self
            .components
            .write()
            .expect("poisoned LivenessRegistry lock");
        components.insert(component.to_owned(), ComponentStatus::Starting);
        LivenessHandle {
            component: component.to_owned(),
            deadline,
            components: Arc::clone(&self.components),
        }
    }

    /// Aggregate status over all registered components. A registry with no
    /// components is unhealthy: the loops have not started yet.
    pub fn status(&self) -> LivenessStatus {
        let components = self
            .components
            .read()
            .expect("poisoned LivenessRegistry lock");
        let now = Utc::now();
        let mut healthy = !components.is_empty();
        let mut snapshot = HashMap::new();
        for (name, status) in components.iter() {
            let observed = match status {
                ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(observed, ComponentStatus::HealthyUntil(_)) {
                healthy = false;
            }
            snapshot.insert(name.clone(), observed);
        }
        LivenessStatus {
            healthy,
            components: snapshot,
        }
    }
}

impl LivenessHandle {
    pub fn report_healthy(&self) {
        self.report(ComponentStatus::HealthyUntil(Utc::now() + self.deadline));
    }

    pub fn report_unhealthy(&self) {
        self.report(ComponentStatus::Unhealthy);
    }

    fn report(&self, status: ComponentStatus) {
        let mut components = self
            .components
            .write()
            .expect("poisoned LivenessRegistry lock");
        components.insert(self.component.clone(), status);
    }
}

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_unhealthy() {
        let registry = LivenessRegistry::new();
        assert!(!registry.status().healthy);
    }

    #[test]
    fn test_component_lifecycle() {
        let registry = LivenessRegistry::new();
        let handle = registry.register("queue-manager", Duration::seconds(30));

        // Starting is not healthy yet.
        assert!(!registry.status().healthy);

        handle.report_healthy();
        assert!(registry.status().healthy);

        handle.report_unhealthy();
        let status = registry.status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("queue-manager"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[test]
    fn test_missed_deadline_stalls_the_component() {
        let registry = LivenessRegistry::new();
        let handle = registry.register("monitor", Duration::seconds(-1));

        // A negative deadline expires immediately.
        handle.report_healthy();
        let status = registry.status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("monitor"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn test_all_components_must_be_healthy() {
        let registry = LivenessRegistry::new();
        let first = registry.register("one", Duration::seconds(30));
        let second = registry.register("two", Duration::seconds(30));

        first.report_healthy();
        assert!(!registry.status().healthy);

        second.report_healthy();
        assert!(registry.status().healthy);
    }

    #[test]
    fn test_status_responds_with_http_codes() {
        let registry = LivenessRegistry::new();
        let nok = registry.status().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let handle = registry.register("one", Duration::seconds(30));
        handle.report_healthy();
        let ok = registry.status().into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
