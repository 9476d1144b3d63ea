//! Worker health signals.
//!
//! Per-object failures never land here. Only systemic ones do: the queue or
//! the workflow store being unreachable from a worker loop. `/readyz` reads
//! the snapshot.

use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

/// Consecutive failures after which a component is reported unhealthy.
pub const UNHEALTHY_AFTER: u32 = 3;

#[derive(Serialize, Clone, Debug, Default)]
pub struct ComponentHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < UNHEALTHY_AFTER
    }
}

#[derive(Clone, Default)]
pub struct WorkerHealth {
    components: Arc<RwLock<BTreeMap<&'static str, ComponentHealth>>>,
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, component: &'static str) {
        let mut components = self.components.write().unwrap_or_else(PoisonError::into_inner);
        let entry = components.entry(component).or_default();
        entry.consecutive_failures = 0;
    }

    pub fn record_failure(&self, component: &'static str, error: impl ToString) {
        let mut components = self.components.write().unwrap_or_else(PoisonError::into_inner);
        let entry = components.entry(component).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error.to_string());
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, ComponentHealth> {
        self.components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.snapshot().values().all(ComponentHealth::is_healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_unhealthy_after_repeated_failures_and_recovers() {
        let health = WorkerHealth::new();
        assert!(health.is_healthy());

        for _ in 0..UNHEALTHY_AFTER {
            health.record_failure("queue", "database is locked");
        }
        assert!(!health.is_healthy());
        assert_eq!(
            health.snapshot()["queue"].last_error.as_deref(),
            Some("database is locked")
        );

        health.record_success("queue");
        assert!(health.is_healthy());
    }
}
