//! Line processing: parse, gate on config, normalize, record

use crate::config::{ConfigStore, LegacyRules, RuntimeConfig};
use crate::config::legacy::Rejection;
use crate::health::Health;
use crate::metrics::{EndpointTarget, MetricsEngine};
use crate::normalize::normalize_path;
use crate::parser::LogFormat;
use crate::rotate;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use traefik_officer_common::{AccessRecord, LogLine, RouterIdentity};

/// Where per-target rules come from
#[derive(Clone)]
pub enum Mode {
    /// `UrlPerformance` objects, kept current by the reconciler
    Operator(ConfigStore),
    /// A static allow-list loaded from a config file
    Legacy(Arc<LegacyRules>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TransportError,
    NotAccessLog,
    ParseError,
    Unconfigured,
    KindMismatch,
    Disabled,
    IgnoredRouter,
    NotAllowed,
    IgnoredPath,
    NotWhitelisted,
}

impl DropReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DropReason::TransportError => "transport_error",
            DropReason::NotAccessLog => "not_access_log",
            DropReason::ParseError => "parse_error",
            DropReason::Unconfigured => "unconfigured",
            DropReason::KindMismatch => "kind_mismatch",
            DropReason::Disabled => "disabled",
            DropReason::IgnoredRouter => "ignored_router",
            DropReason::NotAllowed => "not_allowed",
            DropReason::IgnoredPath => "ignored_path",
            DropReason::NotWhitelisted => "not_whitelisted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Recorded,
    Dropped(DropReason),
}

impl Outcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Outcome::Recorded => "recorded",
            Outcome::Dropped(reason) => reason.as_str(),
        }
    }
}

/// File-mode rotation state
#[derive(Debug, Clone)]
pub struct Rotation {
    path: PathBuf,
    every: u64,
    seen: u64,
}

impl Rotation {
    pub fn new(path: impl Into<PathBuf>, every: u64) -> Self {
        Self {
            path: path.into(),
            every: every.max(1),
            seen: 0,
        }
    }

    /// Count one line; true when the file is due for rotation
    fn tick(&mut self) -> bool {
        self.seen += 1;
        if self.seen >= self.every {
            self.seen = 0;
            return true;
        }
        false
    }
}

pub struct Processor {
    format: LogFormat,
    mode: Mode,
    engine: Arc<MetricsEngine>,
    health: Arc<Health>,
    rotation: Option<Rotation>,
}

impl Processor {
    pub fn new(format: LogFormat, mode: Mode, engine: Arc<MetricsEngine>, health: Arc<Health>) -> Self {
        Self {
            format,
            mode,
            engine,
            health,
            rotation: None,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = Some(rotation);
        self
    }

    /// Consume lines until every sender is gone
    pub async fn run(mut self, mut rx: mpsc::Receiver<LogLine>) {
        info!(json = self.format.is_json(), "Processing access logs");

        while let Some(line) = rx.recv().await {
            if !line.is_error() {
                self.maybe_rotate().await;
            }
            self.process_line(&line);
        }

        info!("Log stream closed, processor stopped");
    }

    async fn maybe_rotate(&mut self) {
        let Some(rotation) = self.rotation.as_mut() else {
            return;
        };
        if !rotation.tick() {
            return;
        }

        let path = rotation.path.clone();
        match tokio::task::spawn_blocking(move || rotate::rotate(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Error rotating log file: {}", e),
            Err(e) => error!("Log rotation task failed: {}", e),
        }
    }

    pub fn process_line(&self, line: &LogLine) -> Outcome {
        self.health.mark_processed();

        let outcome = match &line.error {
            Some(err) => {
                warn!(source = ?line.source, "Log reading error: {}", err);
                Outcome::Dropped(DropReason::TransportError)
            }
            None => match self.format.parse(&line.text) {
                Ok(record) => self.process_record(&record),
                Err(e) if e.is_silent() => Outcome::Dropped(DropReason::NotAccessLog),
                Err(e) => {
                    debug!(error = %e, line = %line.text, "Dropping unparsable line");
                    Outcome::Dropped(DropReason::ParseError)
                }
            },
        };

        self.engine.count_line(outcome.as_str());
        outcome
    }

    /// Gate one parsed record on its target's rules and record it
    pub fn process_record(&self, record: &AccessRecord) -> Outcome {
        let config = match self.resolve(&record.router_name) {
            Ok(config) => config,
            Err(reason) => {
                debug!(router = %record.router_name, reason = reason.as_str(), "Skipping router");
                return Outcome::Dropped(reason);
            }
        };

        if config.is_ignored(&record.path) {
            return Outcome::Dropped(DropReason::IgnoredPath);
        }
        if !config.is_whitelisted(&record.path) {
            return Outcome::Dropped(DropReason::NotWhitelisted);
        }

        let path = normalize_path(&record.path, &config);
        let target = EndpointTarget {
            router: &config.key,
            namespace: &config.namespace,
            ingress: &config.target_name,
            kind: config.target_kind,
            app: &record.router_name,
        };
        self.engine.observe(&target, record, &path, config.collect_n_top);

        if self.format.is_json() {
            self.engine.observe_overhead(record);
        }

        Outcome::Recorded
    }

    fn resolve(&self, router_name: &str) -> Result<Arc<RuntimeConfig>, DropReason> {
        match &self.mode {
            Mode::Operator(store) => {
                let identity = RouterIdentity::decode(router_name);
                let key = identity.key().ok_or(DropReason::Unconfigured)?;
                let config = store.get(&key).ok_or(DropReason::Unconfigured)?;

                if config.target_kind != identity.kind {
                    return Err(DropReason::KindMismatch);
                }
                if !config.enabled {
                    return Err(DropReason::Disabled);
                }
                Ok(config)
            }
            Mode::Legacy(rules) => rules.lookup(router_name).map_err(|rejection| match rejection {
                Rejection::IgnoredRouter => DropReason::IgnoredRouter,
                Rejection::NotAllowed => DropReason::NotAllowed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use traefik_officer_common::TargetKind;

    const ROUTER: &str = "mahfil-dev-api-a1b2c3d4e5f6a7b8@kubernetescrd";

    fn processor(store: &ConfigStore) -> (Processor, Arc<MetricsEngine>) {
        let engine = Arc::new(MetricsEngine::new().unwrap());
        let processor = Processor::new(
            LogFormat::Common,
            Mode::Operator(store.clone()),
            engine.clone(),
            Arc::new(Health::new()),
        );
        (processor, engine)
    }

    fn record(router: &str, path: &str, status: u16) -> AccessRecord {
        AccessRecord {
            router_name: router.to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            origin_status: status,
            duration_ms: 120.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_operator_mode_records_configured_target() {
        let store = ConfigStore::new();
        store.upsert(test_config("mahfil", "dev-api", TargetKind::IngressRoute));
        let (processor, engine) = processor(&store);

        assert_eq!(
            processor.process_record(&record(ROUTER, "/api/orders/42", 200)),
            Outcome::Recorded
        );
        let stat = engine.stats().get("mahfil-dev-api", "/api/orders/{id}").unwrap();
        assert_eq!(stat.total_requests, 1);
    }

    #[test]
    fn test_operator_mode_drops() {
        let store = ConfigStore::new();
        let (processor, _) = processor(&store);

        // No hash, no identity
        assert_eq!(
            processor.process_record(&record("websecure-web@kubernetes", "/", 200)),
            Outcome::Dropped(DropReason::Unconfigured)
        );
        assert_eq!(
            processor.process_record(&record(ROUTER, "/", 200)),
            Outcome::Dropped(DropReason::Unconfigured)
        );

        store.upsert(test_config("mahfil", "dev-api", TargetKind::Ingress));
        assert_eq!(
            processor.process_record(&record(ROUTER, "/", 200)),
            Outcome::Dropped(DropReason::KindMismatch)
        );

        let mut disabled = test_config("mahfil", "dev-api", TargetKind::IngressRoute);
        disabled.enabled = false;
        store.upsert(disabled);
        assert_eq!(
            processor.process_record(&record(ROUTER, "/", 200)),
            Outcome::Dropped(DropReason::Disabled)
        );
    }

    #[test]
    fn test_transport_errors_and_noise() {
        let (processor, engine) = processor(&ConfigStore::new());

        let failed = LogLine::failed(Some("traefik-a".to_string()), "stream reset");
        assert_eq!(
            processor.process_line(&failed),
            Outcome::Dropped(DropReason::TransportError)
        );
        assert_eq!(
            processor.process_line(&LogLine::new("time=\"...\" level=info msg=\"Configuration loaded\"")),
            Outcome::Dropped(DropReason::NotAccessLog)
        );
        assert_eq!(
            processor.process_line(&LogLine::new("")),
            Outcome::Dropped(DropReason::NotAccessLog)
        );

        let rendered = engine.render().unwrap();
        assert!(rendered.contains("traefik_officer_lines_total{outcome=\"transport_error\"} 1"));
        assert!(rendered.contains("traefik_officer_lines_total{outcome=\"not_access_log\"} 2"));
    }

    #[test]
    fn test_rotation_counter() {
        let mut rotation = Rotation::new("/tmp/access.log", 3);
        let due: Vec<bool> = (0..7).map(|_| rotation.tick()).collect();
        assert_eq!(due, vec![false, false, true, false, false, true, false]);
    }
}
