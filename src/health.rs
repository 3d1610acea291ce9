//! Process health reporting for `/health`

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// A processed line older than this marks the service degraded
pub const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Degraded,
    Error,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Body of `/health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime: String,
    pub components: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    components: BTreeMap<String, String>,
    error: Option<String>,
    last_processed: Instant,
}

#[derive(Debug)]
pub struct Health {
    state: RwLock<HealthState>,
    started: Instant,
    stale_after: Duration,
}

impl Health {
    pub fn new() -> Self {
        Self::with_stale_after(STALE_AFTER)
    }

    pub fn with_stale_after(stale_after: Duration) -> Self {
        let now = Instant::now();
        Self {
            state: RwLock::new(HealthState {
                status: HealthStatus::Starting,
                components: BTreeMap::from([("service".to_string(), "initializing".to_string())]),
                error: None,
                last_processed: now,
            }),
            started: now,
            stale_after,
        }
    }

    pub fn set_ready(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.status = HealthStatus::Healthy;
        state.components
            .insert("service".to_string(), "running".to_string());
    }

    /// Record a component's status; an error puts the whole service in the
    /// error state until restart
    pub fn update_component(&self, component: &str, status: &str, error: Option<&dyn fmt::Display>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .components
            .insert(component.to_string(), status.to_string());

        match error {
            Some(err) => {
                state.status = HealthStatus::Error;
                state.error = Some(err.to_string());
            }
            None if state.status != HealthStatus::Error => state.status = HealthStatus::Healthy,
            None => {}
        }
    }

    pub fn mark_processed(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_processed = Instant::now();
    }

    pub fn report(&self) -> HealthReport {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        let mut report = HealthReport {
            status: state.status,
            uptime: format_uptime(self.started.elapsed()),
            components: state.components.clone(),
            error: state.error.clone(),
        };

        if state.last_processed.elapsed() > self.stale_after {
            report
                .components
                .insert("log_processing".to_string(), "stale".to_string());
            if report.status == HealthStatus::Healthy {
                report.status = HealthStatus::Degraded;
                report.error = Some(format!(
                    "No logs processed in the last {}",
                    format_uptime(self.stale_after)
                ));
            }
        } else {
            report
                .components
                .insert("log_processing".to_string(), "active".to_string());
        }

        report
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

/// `1h2m3s`, `4m0s`, `12s`
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unhealthy_until_ready() {
        let health = Health::new();
        let report = health.report();
        assert_eq!(report.status, HealthStatus::Starting);
        assert_eq!(report.components["service"], "initializing");

        health.set_ready();
        let report = health.report();
        assert!(report.is_healthy());
        assert_eq!(report.components["log_processing"], "active");
    }

    #[test]
    fn test_component_error_is_sticky() {
        let health = Health::new();
        health.set_ready();
        health.update_component("log_source", "failed", Some(&"connection refused"));
        health.update_component("http_server", "running", None);

        let report = health.report();
        assert_eq!(report.status, HealthStatus::Error);
        assert_eq!(report.error.as_deref(), Some("connection refused"));
        assert_eq!(report.components["log_source"], "failed");
    }

    #[test]
    fn test_stale_processing_degrades() {
        let health = Health::with_stale_after(Duration::ZERO);
        health.set_ready();
        std::thread::sleep(Duration::from_millis(5));

        let report = health.report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.components["log_processing"], "stale");
        assert!(report.error.is_some());
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(3723)), "1h2m3s");
        assert_eq!(format_uptime(Duration::from_secs(240)), "4m0s");
        assert_eq!(format_uptime(Duration::from_secs(12)), "12s");
    }

    #[test]
    fn test_report_serializes() {
        let health = Health::new();
        health.set_ready();
        let json = serde_json::to_value(health.report()).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json.get("error").is_none());
    }
}
