//! Traefik access log parsers
//!
//! Two formats are supported: Traefik's default common log format and its
//! JSON format. Both produce an `AccessRecord` with durations in
//! milliseconds.

pub mod common;
pub mod json;

use thiserror::Error;
use traefik_officer_common::AccessRecord;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("empty line")]
    EmptyLine,

    #[error("not an access log line")]
    NotAnAccessLog,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid access log format")]
    InvalidAccessLog,

    /// A field failed to parse; `record` holds every field read so far
    #[error("invalid {field}: {value:?}")]
    InvalidField {
        field: &'static str,
        value: String,
        record: Box<AccessRecord>,
    },
}

impl ParseError {
    /// Errors that are expected for non-access-log lines and need no trace
    pub fn is_silent(&self) -> bool {
        matches!(self, ParseError::EmptyLine | ParseError::NotAnAccessLog)
    }

    pub fn partial_record(&self) -> Option<&AccessRecord> {
        match self {
            ParseError::InvalidField { record, .. } => Some(record),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Common,
    Json,
}

impl LogFormat {
    pub fn parse(&self, line: &str) -> Result<AccessRecord, ParseError> {
        match self {
            LogFormat::Common => common::parse(line),
            LogFormat::Json => json::parse(line),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, LogFormat::Json)
    }
}

/// Strip the `[<pod>] ` tag added by the Kubernetes source
pub(crate) fn strip_pod_tag(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix('[') {
        if let Some((tag, payload)) = rest.split_once("] ") {
            if !tag.is_empty() && !tag.contains(char::is_whitespace) && !tag.contains('/') {
                return payload.trim_start();
            }
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_pod_tag() {
        assert_eq!(strip_pod_tag("[traefik-7d9f] {\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_pod_tag("{\"a\":1}"), "{\"a\":1}");
        // A CLF timestamp is not a pod tag
        assert_eq!(
            strip_pod_tag("[10/Oct/2024:13:55:36 +0000] x"),
            "[10/Oct/2024:13:55:36 +0000] x"
        );
    }

    #[test]
    fn test_silent_errors() {
        assert!(ParseError::EmptyLine.is_silent());
        assert!(ParseError::NotAnAccessLog.is_silent());
        assert!(!ParseError::InvalidAccessLog.is_silent());
        assert!(!ParseError::InvalidJson("x".into()).is_silent());
    }
}
