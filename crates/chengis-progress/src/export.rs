//! OTLP-shaped JSON export of a [`crate::span::SpanTree`]. Shape mirrors the
//! OpenTelemetry Protocol trace JSON encoding (`resourceSpans` ->
//! `scopeSpans` -> `spans`) closely enough to feed an OTLP/HTTP collector
//! that accepts JSON, without pulling in the full `opentelemetry` crate
//! family for a single build's worth of spans.

use serde::Serialize;

use crate::span::{Span, SpanStatus, SpanTree};

#[derive(Debug, Serialize)]
pub struct OtlpExport {
    #[serde(rename = "resourceSpans")]
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Serialize)]
pub struct ResourceSpans {
    pub resource: Resource,
    #[serde(rename = "scopeSpans")]
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Serialize)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Serialize)]
pub struct ScopeSpans {
    pub scope: Scope,
    pub spans: Vec<ExportedSpan>,
}

#[derive(Debug, Serialize)]
pub struct Scope {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ExportedSpan {
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "spanId")]
    pub span_id: String,
    #[serde(rename = "parentSpanId", skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    #[serde(rename = "startTimeUnixNano")]
    pub start_time_unix_nano: String,
    #[serde(rename = "endTimeUnixNano")]
    pub end_time_unix_nano: String,
    pub attributes: Vec<KeyValue>,
    pub status: ExportedStatus,
}

#[derive(Debug, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

#[derive(Debug, Serialize)]
pub struct AnyValue {
    #[serde(rename = "stringValue")]
    pub string_value: String,
}

/// Status codes follow the OTLP `Status.StatusCode` enum: 0 unset, 1 ok, 2 error.
#[derive(Debug, Serialize)]
pub struct ExportedStatus {
    pub code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn export_status(status: &SpanStatus) -> ExportedStatus {
    match status {
        SpanStatus::Unset => ExportedStatus { code: 0, message: None },
        SpanStatus::Ok => ExportedStatus { code: 1, message: None },
        SpanStatus::Error(message) => ExportedStatus { code: 2, message: Some(message.clone()) },
    }
}

fn export_span(span: &Span) -> ExportedSpan {
    ExportedSpan {
        trace_id: span.trace_id.clone(),
        span_id: span.span_id.clone(),
        parent_span_id: span.parent_span_id.clone(),
        name: span.name.clone(),
        start_time_unix_nano: span.start_unix_nanos.to_string(),
        end_time_unix_nano: span.end_unix_nanos.unwrap_or(span.start_unix_nanos).to_string(),
        attributes: span
            .attributes
            .iter()
            .map(|(k, v)| KeyValue { key: k.clone(), value: AnyValue { string_value: v.clone() } })
            .collect(),
        status: export_status(&span.status),
    }
}

/// Build the OTLP export document for a tree's recorded spans, tagged with
/// `service_name` as the resource's `service.name` attribute. An unsampled
/// tree exports a document with an empty `spans` array.
pub fn export(tree: &SpanTree, service_name: &str) -> OtlpExport {
    OtlpExport {
        resource_spans: vec![ResourceSpans {
            resource: Resource {
                attributes: vec![KeyValue {
                    key: "service.name".to_string(),
                    value: AnyValue { string_value: service_name.to_string() },
                }],
            },
            scope_spans: vec![ScopeSpans {
                scope: Scope { name: "chengis".to_string() },
                spans: tree.spans().iter().map(export_span).collect(),
            }],
        }],
    }
}

/// `export` followed by JSON serialization, the form an OTLP/HTTP collector
/// endpoint expects on the wire.
pub fn export_json(tree: &SpanTree, service_name: &str) -> serde_json::Result<String> {
    serde_json::to_string(&export(tree, service_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::AlwaysOn;

    #[test]
    fn export_carries_parent_child_and_attributes() {
        let mut tree = SpanTree::new(&AlwaysOn);
        let root = tree.start_span("build", None);
        tree.set_attribute(&root, "build.id", "build_abc123");
        let child = tree.start_span("stage:test", Some(&root));
        tree.end_span(&child, SpanStatus::Ok);
        tree.end_span(&root, SpanStatus::Error("stage failed".to_string()));

        let exported = export(&tree, "chengis-engine");
        let spans = &exported.resource_spans[0].scope_spans[0].spans;
        assert_eq!(spans.len(), 2);

        let root_export = spans.iter().find(|s| s.span_id == root).unwrap();
        assert_eq!(root_export.status.code, 2);
        assert_eq!(root_export.status.message.as_deref(), Some("stage failed"));
        assert!(root_export.attributes.iter().any(|kv| kv.key == "build.id"));

        let child_export = spans.iter().find(|s| s.span_id == child).unwrap();
        assert_eq!(child_export.parent_span_id.as_deref(), Some(root.as_str()));
    }

    #[test]
    fn export_json_produces_valid_json() {
        let mut tree = SpanTree::new(&AlwaysOn);
        let root = tree.start_span("build", None);
        tree.end_span(&root, SpanStatus::Ok);

        let json = export_json(&tree, "chengis-engine").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["resourceSpans"][0]["scopeSpans"][0]["spans"][0]["traceId"].is_string());
    }

    #[test]
    fn open_span_exports_with_start_time_as_end_time() {
        let mut tree = SpanTree::new(&AlwaysOn);
        let root = tree.start_span("build", None);
        let exported = export(&tree, "chengis-engine");
        let span = &exported.resource_spans[0].scope_spans[0].spans[0];
        assert_eq!(span.span_id, root);
        assert_eq!(span.start_time_unix_nano, span.end_time_unix_nano);
    }
}
