// Lineage Invariants
//
// Rules a proposed successor edge is checked against while the DAG
// is still in memory. An edge that fails any rule is never written.

use crate::error::CatalogError;
use crate::id::Id;
use crate::versions::dag::VersionHistoryDag;

/// Verdict of one rule on one edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// A rule over `from -> to` given the lineage recorded so far.
///
/// Implementations only read the DAG and must give the same verdict
/// for the same input.
pub trait EdgeInvariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, dag: &VersionHistoryDag, from: &Id, to: &Id) -> InvariantResult;
}

/// Ordered set of edge rules.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn EdgeInvariant>>,
}

impl InvariantEngine {
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// The rules every version history DAG maintains.
    pub fn lineage() -> Self {
        let mut engine = Self::new();
        engine.register(NoSelfSuccessor);
        engine.register(NoDuplicateSuccessor);
        engine.register(Acyclic);
        engine
    }

    pub fn register<I: EdgeInvariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// First failing rule, if any.
    pub fn evaluate(
        &self,
        dag: &VersionHistoryDag,
        from: &Id,
        to: &Id,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            if let InvariantResult::Fail(reason) = invariant.validate(dag, from, to) {
                return Err(InvariantViolation {
                    invariant: invariant.name(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("lineage rule `{invariant}` rejected the edge: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}

impl From<InvariantViolation> for CatalogError {
    fn from(violation: InvariantViolation) -> Self {
        CatalogError::InvalidArgument(violation.to_string())
    }
}

pub struct NoSelfSuccessor;

impl EdgeInvariant for NoSelfSuccessor {
    fn name(&self) -> &'static str {
        "no-self-successor"
    }

    fn validate(&self, _dag: &VersionHistoryDag, from: &Id, to: &Id) -> InvariantResult {
        if from == to {
            InvariantResult::Fail(format!("version {from} cannot derive from itself"))
        } else {
            InvariantResult::Pass
        }
    }
}

/// At most one successor per ordered pair.
pub struct NoDuplicateSuccessor;

impl EdgeInvariant for NoDuplicateSuccessor {
    fn name(&self) -> &'static str {
        "no-duplicate-successor"
    }

    fn validate(&self, dag: &VersionHistoryDag, from: &Id, to: &Id) -> InvariantResult {
        if dag.has_edge(from, to) {
            InvariantResult::Fail(format!("{from} -> {to} is already recorded"))
        } else {
            InvariantResult::Pass
        }
    }
}

/// `from -> to` closes a cycle iff `from` is reachable from `to`.
pub struct Acyclic;

impl EdgeInvariant for Acyclic {
    fn name(&self) -> &'static str {
        "acyclic"
    }

    fn validate(&self, dag: &VersionHistoryDag, from: &Id, to: &Id) -> InvariantResult {
        if dag.reaches(to, from) {
            InvariantResult::Fail(format!("{from} -> {to} would close a cycle"))
        } else {
            InvariantResult::Pass
        }
    }
}
