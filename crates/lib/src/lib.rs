//! manifold-lib renders BuildPlans into file artifacts for GitOps delivery.
//!
//! A platform describes a collection of components. An external
//! configuration-evaluation engine produces one [`plan::BuildPlan`] per
//! component; this crate executes those plans:
//!
//! - [`platform`] fans out across selected components, one isolated build
//!   per component under a concurrency ceiling.
//! - [`exec`] runs each plan's artifact pipelines with correct phase
//!   ordering (generators, transformers, validators, persist).
//! - [`store`] holds rendered content in a write-once in-memory map until
//!   the final artifact is persisted.
//! - [`chart`] caches packaged charts on disk, collapsing concurrent
//!   downloads into a single fetch with a filesystem lock.
//! - [`runner`] shells out to external renderers with captured output.
//! - [`eval`] serializes access to the non-reentrant evaluation engine.

pub mod chart;
pub mod eval;
pub mod exec;
pub mod plan;
pub mod platform;
pub mod runner;
pub mod store;

pub use exec::{BuildError, BuildOpts, build};
pub use plan::BuildPlan;
pub use platform::Platform;
pub use store::ArtifactStore;
