//! Nyl Engine - template and dependency resolution for Kubernetes packages
//!
//! This crate renders package trees into manifests:
//! - MiniJinja templates with `ref()`, `secret()` and lazy random values
//! - Lookups against a per-render cluster snapshot, deferred when not satisfiable yet
//! - Idempotent `StatefulSecret` materialization by merging with the live Secret
//! - `HelmChart` rendering through an external Helm binary, with Git chart sources
//!
//! The entry point is [`Renderer::render`].

pub mod error;
pub mod evaluator;
pub mod filters;
pub mod functions;
pub mod git;
pub mod graph;
pub mod helm;
pub mod loader;
pub mod merge;
pub mod output;
pub mod resolver;
pub mod snapshot;
pub mod stores;
pub mod suggestions;

pub use error::{EngineError, Result, TemplateError, TemplateErrorKind};
pub use evaluator::{Evaluator, Expansion};
pub use functions::{LookupHandler, RecordedLookup};
pub use git::{GitSource, RepoCache};
pub use helm::{HelmCli, HelmRenderer, HelmRequest};
pub use loader::ApplicationBinding;
pub use output::{DeferredNote, EmittedManifest, FailureKind, RenderFailure, RenderResult};
pub use resolver::{RenderOptions, RenderRequest, Renderer};
pub use snapshot::{
    ClusterReadError, ClusterReader, ClusterSnapshot, OfflineCluster, StaticCluster,
};
pub use stores::{SecretStore, SecretStores};
pub use suggestions::{AVAILABLE_FILTERS, AVAILABLE_FUNCTIONS};
