//! Stagecraft Gen - generation backend orchestration
//!
//! Submits generation jobs to remote (or local) 3D backends, polls them to
//! a terminal state, downloads the resulting meshes into a session, and
//! falls back across backends according to a priority policy.

pub mod backend;
pub mod backends;
pub mod batch;
pub mod client;
pub mod config;
pub mod orchestrator;

pub use backend::{GenerationBackend, GenerationRequest, QueryResponse, StatusCode};
pub use batch::{generate_batch, manifest_from_metadata, requests_from_objects, BatchReport};
pub use client::{
    FetchedArtifact, GenerationJobClient, JobHandle, JobResult, JobState, PollOutcome, PollPolicy,
    RetryPolicy,
};
pub use config::StagecraftConfig;
pub use orchestrator::{BackendOrchestrator, BackendPriority, BackendRegistry};
