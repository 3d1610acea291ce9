//! Shared types between log sources, parsers and the metrics engine
//!
//! This crate defines the data that flows through the pipeline:
//! - `LogLine`: one raw line as delivered by a log source
//! - `AccessRecord`: one parsed Traefik access log entry
//! - `RouterIdentity`: the Kubernetes target decoded from a Traefik router name

pub mod router;

use std::fmt;
use std::time::SystemTime;

pub use router::RouterIdentity;

/// Raw transport unit produced by a log source
///
/// Transport errors are delivered in-band: a line with `error` set carries no
/// payload and must not terminate the stream.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub text: String,
    pub received_at: SystemTime,
    pub source: Option<String>,
    pub error: Option<String>,
}

impl LogLine {
    /// A line read from an untagged source (file mode)
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: SystemTime::now(),
            source: None,
            error: None,
        }
    }

    /// A line read from a pod; the payload is prefixed with `[<pod>] `
    pub fn from_pod(pod: &str, line: &str) -> Self {
        Self {
            text: format!("[{}] {}", pod, line),
            received_at: SystemTime::now(),
            source: Some(pod.to_string()),
            error: None,
        }
    }

    /// An in-band transport error
    pub fn failed(source: Option<String>, error: impl fmt::Display) -> Self {
        Self {
            text: String::new(),
            received_at: SystemTime::now(),
            source,
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// One parsed Traefik access log entry
///
/// Durations are kept in milliseconds; conversion to seconds happens only at
/// the metrics boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessRecord {
    pub client_host: String,
    pub start_utc: String,
    pub router_name: String,
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub origin_status: u16,
    pub origin_content_size: u64,
    pub request_count: u64,
    pub duration_ms: f64,
    pub overhead_ms: f64,
}

impl AccessRecord {
    pub fn duration_seconds(&self) -> f64 {
        self.duration_ms / 1000.0
    }

    pub fn overhead_seconds(&self) -> f64 {
        self.overhead_ms / 1000.0
    }

    pub fn is_error(&self) -> bool {
        self.origin_status >= 400
    }

    pub fn is_server_error(&self) -> bool {
        self.origin_status >= 500
    }
}

/// Kind of Kubernetes resource that produced a Traefik router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetKind {
    Ingress,
    IngressRoute,
    #[default]
    Unknown,
}

impl TargetKind {
    /// Map a Traefik provider name (the part after `@`) to a target kind
    pub fn from_provider(provider: &str) -> Self {
        match provider {
            "kubernetes" => TargetKind::Ingress,
            "kubernetescrd" => TargetKind::IngressRoute,
            _ => TargetKind::Unknown,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Ingress => "Ingress",
            TargetKind::IngressRoute => "IngressRoute",
            TargetKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the `<namespace>-<name>` key shared by the config store and the
/// metrics engine. Either side may be empty, in which case the other is
/// returned on its own.
pub fn target_key(namespace: &str, name: &str) -> String {
    let namespace = namespace.trim();
    let name = name.trim();

    match (namespace.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => namespace.to_string(),
        _ => format!("{}-{}", namespace, name),
    }
}
