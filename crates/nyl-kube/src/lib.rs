//! Nyl Kube - live cluster reads for `ref()` lookups
//!
//! [`KubeClusterReader`] implements the engine's [`nyl_engine::ClusterReader`] on top
//! of a `kube` client. Reads are strictly read-only; kinds are resolved through API
//! discovery so custom resources work the same way built-in ones do.

pub mod error;
pub mod reader;

pub use error::{KubeError, Result};
pub use reader::KubeClusterReader;
