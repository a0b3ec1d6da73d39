//! Wire envelope + trace-context propagation for AMQP deliveries.
//!
//! Bodies are plain UTF-8 JSON (spec §6); trace context rides in AMQP
//! headers as a W3C `traceparent`-shaped string rather than in the body,
//! so handlers that don't care about tracing can deserialize the body
//! directly into their message type.

use std::collections::BTreeMap;

use lapin::types::{AMQPValue, FieldTable, LongString};

/// Minimal W3C-traceparent-shaped propagation: `00-{trace_id}-{span_id}-01`.
/// We don't validate against the full spec (hex length, version byte) since
/// `trace_id`/`span_id` here are the pipeline's own identifiers, not a
/// separate OTel SDK's — the shape is kept for interop with collectors that
/// understand the standard header.
pub fn traceparent(trace_id: &str, span_id: &str) -> String {
    format!("00-{trace_id}-{span_id}-01")
}

pub fn parse_traceparent(value: &str) -> Option<(String, String)> {
    let mut parts = value.split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?.to_string();
    let span_id = parts.next()?.to_string();
    Some((trace_id, span_id))
}

/// Build an AMQP header table carrying the trace context plus any extra
/// caller-supplied headers.
pub fn headers_with_trace(
    trace_id: &str,
    span_id: &str,
    extra: &BTreeMap<String, String>,
) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        "traceparent".into(),
        AMQPValue::LongString(LongString::from(traceparent(trace_id, span_id))),
    );
    for (k, v) in extra {
        table.insert(
            k.as_str().into(),
            AMQPValue::LongString(LongString::from(v.as_str())),
        );
    }
    table
}

/// Extract the trace context from a delivery's AMQP headers, if present.
pub fn extract_trace(headers: &FieldTable) -> Option<(String, String)> {
    let value = headers.inner().get("traceparent")?;
    match value {
        AMQPValue::LongString(s) => parse_traceparent(s.as_str()),
        AMQPValue::ShortString(s) => parse_traceparent(s.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceparent_roundtrip() {
        let tp = traceparent("trace-1", "span-2");
        assert_eq!(tp, "00-trace-1-span-2-01");
        assert_eq!(
            parse_traceparent(&tp),
            Some(("trace-1".to_string(), "span-2".to_string()))
        );
    }

    #[test]
    fn parse_traceparent_rejects_malformed() {
        assert_eq!(parse_traceparent("nonsense"), None);
    }

    #[test]
    fn headers_with_trace_carries_extra_fields() {
        let mut extra = BTreeMap::new();
        extra.insert("x-app".to_string(), "app1".to_string());
        let headers = headers_with_trace("t1", "s1", &extra);
        assert!(headers.inner().contains_key("traceparent"));
        assert!(headers.inner().contains_key("x-app"));
        let (tid, sid) = extract_trace(&headers).unwrap();
        assert_eq!(tid, "t1");
        assert_eq!(sid, "s1");
    }
}
