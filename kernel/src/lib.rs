// Lineage Kernel
//
// Versioned metadata catalog: items, their immutable versions, and the
// per-item version history DAG, persisted through pluggable tabular
// and graph backends.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod models;
pub mod versions;

pub use catalog::Catalog;
pub use error::{CatalogError, Result};
