//! Stage scheduling for the build execution engine: DAG validation and
//! wave computation, plus matrix expansion feeding into it. Topologically
//! orders pipeline stages by their `depends_on` edges the same way a
//! workspace build planner orders packages by their dependency edges.

pub mod dag;
pub mod matrix;

pub use dag::{Dag, DagError, build_dag, cascade_aborted, has_dag, ready_set, topological_sort};
pub use matrix::{Combination, expand_combinations, expand_pipeline, expand_stage, suffixed_stage_name};
