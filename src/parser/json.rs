use super::{strip_pod_tag, ParseError};
use serde::Deserialize;
use traefik_officer_common::AccessRecord;

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Fields of Traefik's JSON access log we care about; everything else is
/// ignored
#[derive(Deserialize)]
struct JsonAccessLog {
    #[serde(rename = "ClientHost", default)]
    client_host: String,
    #[serde(rename = "StartUTC", default)]
    start_utc: String,
    #[serde(rename = "RouterName", default)]
    router_name: String,
    #[serde(rename = "RequestMethod", default)]
    request_method: String,
    #[serde(rename = "RequestPath", default)]
    request_path: String,
    #[serde(rename = "RequestProtocol", default)]
    request_protocol: String,
    #[serde(rename = "OriginStatus")]
    origin_status: Option<i64>,
    #[serde(rename = "OriginContentSize", default)]
    origin_content_size: u64,
    #[serde(rename = "RequestCount", default)]
    request_count: u64,
    /// Nanoseconds
    #[serde(rename = "Duration", default)]
    duration: f64,
    /// Nanoseconds
    #[serde(rename = "Overhead", default)]
    overhead: f64,
}

pub fn parse(line: &str) -> Result<AccessRecord, ParseError> {
    let line = strip_pod_tag(line.trim());
    if line.is_empty() {
        return Err(ParseError::EmptyLine);
    }

    let raw: JsonAccessLog =
        serde_json::from_str(line).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    // Traefik's own application log is JSON as well
    let status = match raw.origin_status {
        None if raw.router_name.is_empty() => return Err(ParseError::NotAnAccessLog),
        None => 0,
        Some(status) => status,
    };

    let mut record = AccessRecord {
        client_host: raw.client_host,
        start_utc: raw.start_utc,
        router_name: raw.router_name,
        method: raw.request_method,
        path: raw.request_path,
        protocol: raw.request_protocol,
        origin_status: 0,
        origin_content_size: raw.origin_content_size,
        request_count: raw.request_count,
        duration_ms: raw.duration / NANOS_PER_MILLI,
        overhead_ms: raw.overhead / NANOS_PER_MILLI,
    };

    match u16::try_from(status) {
        Ok(status) if (100..=599).contains(&status) => record.origin_status = status,
        _ => {
            return Err(ParseError::InvalidField {
                field: "OriginStatus",
                value: status.to_string(),
                record: Box::new(record),
            })
        }
    }

    if record.duration_ms < 0.0 || !record.duration_ms.is_finite() {
        return Err(ParseError::InvalidField {
            field: "Duration",
            value: raw.duration.to_string(),
            record: Box::new(record),
        });
    }

    Ok(record)
}
