//! Traefik common log format
//!
//! ```text
//! <client> - <user> [<start>] "<method> <path> <protocol>" <status> <size> "<referrer>" "<user agent>" <count> "<router>" "<backend url>" <duration>ms
//! ```

use super::{strip_pod_tag, ParseError};
use regex::Regex;
use std::sync::LazyLock;
use traefik_officer_common::AccessRecord;

static IPV4_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").expect("valid ipv4 regex")
});

/// Requires a colon within the first group so that words made of hex
/// letters ("added", "cafe") do not pass
static IPV6_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{0,4}:[0-9a-fA-F:]*").expect("valid ipv6 regex"));

static POD_IPV4_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[[^\]]+\]\s+\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").expect("valid pod regex")
});

static CLF_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\d{2}/[A-Za-z]{3}/\d{4}:\d{2}:\d{2}:\d{2} [+-]\d{4}\]")
        .expect("valid timestamp regex")
});

static ACCESS_LOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(\S+)",                   // 1 client host
        r"\s-\s",                   //
        r"(\S+)\s",                 // 2 user
        r"\[([^\]]+)\]\s",          // 3 start
        r#""(\S*)\s?"#,             // 4 method
        r#"((?:[^"]|\\")*)\s"#,     // 5 path
        r#"([^"]*)"\s"#,            // 6 protocol
        r"(\S+)\s",                 // 7 status
        r"(\S+)\s",                 // 8 size
        r#"("[^"]*"|-|\S+)\s"#,     // 9 referrer
        r#"("[^"]*"|-|\S+)\s"#,     // 10 user agent
        r"(\S+)\s",                 // 11 request count
        r#"("[^"]*"|-)\s"#,         // 12 router
        r#"("[^"]*"|-)\s"#,         // 13 backend url
        r"(\S+)",                   // 14 duration
    ))
    .expect("valid access log regex")
});

/// Cheap check run before the full grammar
pub fn looks_like_access_log(line: &str) -> bool {
    IPV4_START.is_match(line)
        || IPV6_START.is_match(line)
        || POD_IPV4_START.is_match(line)
        || CLF_TIMESTAMP.is_match(line)
}

pub fn parse(line: &str) -> Result<AccessRecord, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::EmptyLine);
    }

    if !looks_like_access_log(line) {
        return Err(ParseError::NotAnAccessLog);
    }

    let caps = ACCESS_LOG
        .captures(strip_pod_tag(line))
        .ok_or(ParseError::InvalidAccessLog)?;
    let field = |i: usize| caps.get(i).map_or("", |m| m.as_str());

    let mut record = AccessRecord {
        client_host: field(1).to_string(),
        start_utc: field(3).to_string(),
        method: field(4).to_string(),
        path: field(5).to_string(),
        protocol: field(6).to_string(),
        router_name: field(12).trim_matches('"').to_string(),
        ..Default::default()
    };

    // Keep parsing after a bad field so the partial record is as complete
    // as possible; report the first defect
    let mut defect: Option<(&'static str, String)> = None;
    let mut note = |name: &'static str, value: &str| {
        defect.get_or_insert_with(|| (name, value.to_string()));
    };

    match field(7).parse::<u16>() {
        Ok(status) if (100..=599).contains(&status) => record.origin_status = status,
        _ => note("OriginStatus", field(7)),
    }

    match field(8) {
        "-" => {}
        size => match size.parse::<u64>() {
            Ok(size) => record.origin_content_size = size,
            Err(_) => note("OriginContentSize", size),
        },
    }

    match field(11).parse::<u64>() {
        Ok(count) => record.request_count = count,
        Err(_) => note("RequestCount", field(11)),
    }

    let duration = field(14).trim_end_matches("ms");
    match duration.parse::<f64>() {
        Ok(ms) if ms >= 0.0 && ms.is_finite() => record.duration_ms = ms,
        _ => note("Duration", field(14)),
    }

    match defect {
        Some((field, value)) => Err(ParseError::InvalidField {
            field,
            value,
            record: Box::new(record),
        }),
        None => Ok(record),
    }
}
