//! # Chengis
//!
//! Core build execution engine for a CI/CD orchestrator: pipeline executor,
//! DAG scheduler, approval gates, policy evaluation, provenance, deployment,
//! and infrastructure-as-code orchestration.
//!
//! Chengis ingests a pipeline definition, runs its stages and steps against
//! a checked-out workspace, streams results over the event bus, enforces
//! policy, publishes status back to source-control providers, and persists
//! a durable audit trail. This crate is the subsystem where that work
//! happens; it is written entirely against the [`chengis_store::Store`] and
//! [`chengis_environment::Clock`] traits — persistence and time are external
//! collaborators, never concrete dependencies.
//!
//! ## Pipeline
//!
//! The core flow is **trigger → matrix expand → DAG build → stage loop →
//! post-actions → provenance/deploy/SCM**:
//!
//! 1. [`pipeline::run_build`] is the top-level build loop (§4.J): it
//!    allocates a workspace, expands the matrix, builds the DAG (or falls
//!    back to linear execution), and runs each stage through policy,
//!    approval, cache, and step execution.
//! 2. [`step::run_step`] resolves a step's condition, dispatches by type
//!    (shell/docker/compose) through the plugin registry, and turns an
//!    exit code into a step result.
//! 3. [`ids::stage_fingerprint`] computes the content-addressed fingerprint
//!    gating the stage-result cache.
//! 4. [`provenance::run_provenance_chain`] runs SBOM → license → sign →
//!    attest on a successful build.
//! 5. [`deploy`] and [`iac`] drive deployment/promotion and infrastructure
//!    changes; [`compliance`] and [`compare`] are read-side assessors over
//!    the same persisted history.
//!
//! ## Modules
//!
//! - [`ids`] — stage fingerprinting (§3, §4.A)
//! - [`registry`] — plugin registry: name → capability map (§4.E)
//! - [`step`] — step executor, shell + Docker (§4.F)
//! - [`pipeline`] — top-level build loop (§4.J)
//! - [`cron`] — cron schedule parsing and due-schedule processing (§4.O)
//! - [`schedulers`] — retention/rotation/analytics background loops (§4.P)
//! - [`provenance`] — SBOM/license/signing/attestation chain (§4.Q)
//! - [`deploy`] — deployment strategies and promotion chain (§4.R)
//! - [`iac`] — infrastructure-as-code engine (§4.S)
//! - [`compliance`] — audit hash-chain verification and readiness scoring (§4.T)
//! - [`compare`] — structural diff of two builds (§4.U)

pub mod compare;
pub mod compliance;
pub mod cron;
pub mod deploy;
pub mod iac;
pub mod ids;
pub mod pipeline;
pub mod provenance;
pub mod registry;
pub mod schedulers;
pub mod step;
