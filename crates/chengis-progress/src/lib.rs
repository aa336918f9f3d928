//! Span-tree tracing (§4.V) and CLI progress reporting for the Chengis
//! build execution engine.
//!
//! Tracing here is deliberately independent of the [`Reporter`][reporter]
//! text channel used elsewhere in the workspace: a `Reporter` is for a
//! human watching a terminal, this crate is for an OTLP collector watching
//! spans. The two consume the same underlying build/stage/step lifecycle,
//! just rendered differently.
//!
//! [reporter]: https://docs.rs/chengis-store

pub mod cli;
pub mod export;
pub mod sampling;
pub mod span;

pub use cli::StageProgress;
pub use export::{export, export_json, OtlpExport};
pub use sampling::{AlwaysOff, AlwaysOn, ProbabilisticSampler, Sampler};
pub use span::{Span, SpanStatus, SpanTree};

use chengis_types::{BuildId, StageId, StepId};

/// Binds a [`SpanTree`] to one build, opening the root span at
/// construction and exposing stage/step helpers keyed by the domain ids
/// already flowing through the rest of the engine, so callers never juggle
/// span ids directly for the common case.
pub struct BuildTracer {
    tree: SpanTree,
    root_span_id: String,
}

impl BuildTracer {
    pub fn start(build_id: &BuildId, sampler: &dyn Sampler) -> Self {
        let mut tree = SpanTree::new(sampler);
        let root_span_id = tree.start_span("build", None);
        tree.set_attribute(&root_span_id, "chengis.build.id", build_id.as_str());
        Self { tree, root_span_id }
    }

    pub fn start_stage(&mut self, stage_id: &StageId, stage_name: &str) -> String {
        let span_id = self.tree.start_span(format!("stage:{stage_name}"), Some(&self.root_span_id));
        self.tree.set_attribute(&span_id, "chengis.stage.id", stage_id.as_str());
        span_id
    }

    pub fn start_step(&mut self, stage_span_id: &str, step_id: &StepId, step_name: &str) -> String {
        let span_id = self.tree.start_span(format!("step:{step_name}"), Some(stage_span_id));
        self.tree.set_attribute(&span_id, "chengis.step.id", step_id.as_str());
        span_id
    }

    pub fn end(&mut self, span_id: &str, status: SpanStatus) {
        self.tree.end_span(span_id, status);
    }

    pub fn finish_build(mut self, status: SpanStatus) -> SpanTree {
        self.tree.end_span(&self.root_span_id, status);
        self.tree
    }

    pub fn tree(&self) -> &SpanTree {
        &self.tree
    }
}
