// Version Lineage
//
// Successor edges between versions, the per-item history DAG built
// from them, and the invariants every new lineage edge must satisfy.

pub mod dag;
pub mod invariants;
pub mod successor;

pub use dag::{TruncationReport, VersionHistoryDag, VersionHistoryDagStore};
pub use successor::{SuccessorStore, VersionSuccessor};
