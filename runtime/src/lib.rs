//! A3S Bake Runtime - image assembly pipeline.
//!
//! Fetches a data archive, unpacks it with path confinement, injects it as a
//! layer into a base image and commits the result to a registry, the local
//! image store or an OCI layout directory.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod fetch;
pub mod oci;
pub mod pipeline;
pub mod session;

// Re-export common types
pub use archive::{extract_archive, read_archive, EntryKind, ExtractedEntry, ExtractedTree};
pub use fetch::{ArchiveFetcher, FetchedArchive};
pub use oci::{Destination, ImagePuller, ImageReference, ImageStore, RegistryPusher, StoredImage};
pub use pipeline::{Pipeline, PipelineFailure, PipelineStage};
pub use session::{
    default_command, BuildOptions, BuildSession, CommitResult, LayerPayload, SCRATCH_IMAGE,
};

/// A3S Bake Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
