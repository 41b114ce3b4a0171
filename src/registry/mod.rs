//! Artifact registry - durable lifecycle records for generated code.

mod artifact;
#[allow(clippy::module_inception)]
mod registry;

pub use artifact::{Artifact, ArtifactOutcome, ArtifactStatus, CodeRef};
pub use registry::ArtifactRegistry;
