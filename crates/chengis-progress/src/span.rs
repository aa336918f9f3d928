//! In-process span tree: parent/child spans over a single build's trace,
//! shaped so [`crate::export`] can turn it into OTLP JSON without any
//! further bookkeeping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::sampling::Sampler;

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn unix_nanos() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
}

/// Hash-derived hex id of `width_bytes` bytes, mixing a monotonic counter
/// into the current timestamp so concurrent callers never collide.
fn derive_id(width_bytes: usize) -> String {
    let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let nanos = unix_nanos();
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_be_bytes());
    hasher.update(seq.to_be_bytes());
    hex::encode(&hasher.finalize()[..width_bytes])
}

/// 16-byte OTLP trace id, hex-encoded.
pub fn new_trace_id() -> String {
    derive_id(16)
}

/// 8-byte OTLP span id, hex-encoded.
pub fn new_span_id() -> String {
    derive_id(8)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_unix_nanos: u128,
    pub end_unix_nanos: Option<u128>,
    pub attributes: BTreeMap<String, String>,
    pub status: SpanStatus,
}

impl Span {
    pub fn is_open(&self) -> bool {
        self.end_unix_nanos.is_none()
    }
}

/// Every span recorded for one trace (one build, typically), plus the
/// sampling decision made when the tree was created. An unsampled tree
/// still mints span ids (callers thread them through regardless) but
/// records nothing, so [`Self::spans`] is empty and export is a no-op.
#[derive(Debug, Clone)]
pub struct SpanTree {
    trace_id: String,
    sampled: bool,
    spans: Vec<Span>,
}

impl SpanTree {
    pub fn new(sampler: &dyn Sampler) -> Self {
        let trace_id = new_trace_id();
        let sampled = sampler.should_sample(&trace_id);
        Self { trace_id, sampled, spans: Vec::new() }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Open a new span under `parent_span_id` (`None` for the root span)
    /// and return its id, regardless of the sampling decision — callers
    /// don't need to branch on sampling when threading span ids through a
    /// call stack.
    pub fn start_span(&mut self, name: impl Into<String>, parent_span_id: Option<&str>) -> String {
        let span_id = new_span_id();
        if self.sampled {
            self.spans.push(Span {
                trace_id: self.trace_id.clone(),
                span_id: span_id.clone(),
                parent_span_id: parent_span_id.map(str::to_string),
                name: name.into(),
                start_unix_nanos: unix_nanos(),
                end_unix_nanos: None,
                attributes: BTreeMap::new(),
                status: SpanStatus::Unset,
            });
        }
        span_id
    }

    pub fn end_span(&mut self, span_id: &str, status: SpanStatus) {
        if let Some(span) = self.spans.iter_mut().find(|s| s.span_id == span_id) {
            span.end_unix_nanos = Some(unix_nanos());
            span.status = status;
        }
    }

    pub fn set_attribute(&mut self, span_id: &str, key: impl Into<String>, value: impl Into<String>) {
        if let Some(span) = self.spans.iter_mut().find(|s| s.span_id == span_id) {
            span.attributes.insert(key.into(), value.into());
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Spans whose [`Span::end_unix_nanos`] is still `None`, e.g. to flag a
    /// build that crashed mid-stage without ever closing its span.
    pub fn open_spans(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(|s| s.is_open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{AlwaysOff, AlwaysOn};

    #[test]
    fn start_span_records_parent_child_relationship() {
        let mut tree = SpanTree::new(&AlwaysOn);
        let root = tree.start_span("build", None);
        let child = tree.start_span("stage:test", Some(&root));
        tree.end_span(&child, SpanStatus::Ok);
        tree.end_span(&root, SpanStatus::Ok);

        assert_eq!(tree.spans().len(), 2);
        let child_span = tree.spans().iter().find(|s| s.span_id == child).unwrap();
        assert_eq!(child_span.parent_span_id.as_deref(), Some(root.as_str()));
    }

    #[test]
    fn unsampled_tree_records_nothing() {
        let mut tree = SpanTree::new(&AlwaysOff);
        assert!(!tree.is_sampled());
        let root = tree.start_span("build", None);
        tree.end_span(&root, SpanStatus::Ok);
        assert!(tree.spans().is_empty());
    }

    #[test]
    fn open_spans_reports_unclosed_spans() {
        let mut tree = SpanTree::new(&AlwaysOn);
        let root = tree.start_span("build", None);
        let child = tree.start_span("stage:build", Some(&root));
        tree.end_span(&child, SpanStatus::Ok);

        let open: Vec<_> = tree.open_spans().map(|s| s.span_id.clone()).collect();
        assert_eq!(open, vec![root]);
    }

    #[test]
    fn trace_and_span_ids_are_unique_across_calls() {
        assert_ne!(new_trace_id(), new_trace_id());
        assert_ne!(new_span_id(), new_span_id());
    }
}
