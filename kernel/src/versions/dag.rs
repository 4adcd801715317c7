// Version History DAG
//
// Per-item lineage: an edge list of successors plus derived
// parent/child indices rebuilt from it. The backend is the source of
// truth; an in-memory DAG is a cache reconstructed on retrieve.
//
// The first version of an item is linked from the item's own id.
// These origin edges mark roots and are invisible to parent, leaf and
// truncation queries.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, info};

use crate::db::{tables, Connection, Field};
use crate::error::{CatalogError, Result};
use crate::id::{Id, IdGenerator};
use crate::models::ItemKind;
use crate::versions::invariants::InvariantEngine;
use crate::versions::successor::{SuccessorStore, VersionSuccessor};

/// Lineage of one item.
#[derive(Debug, Clone, Serialize)]
pub struct VersionHistoryDag {
    item_id: Id,
    edges: Vec<VersionSuccessor>,
    /// to -> from
    #[serde(skip)]
    parents: HashMap<Id, Vec<Id>>,
    /// from -> to
    #[serde(skip)]
    children: HashMap<Id, Vec<Id>>,
}

impl VersionHistoryDag {
    pub fn new(item_id: Id) -> Self {
        Self {
            item_id,
            edges: Vec::new(),
            parents: HashMap::new(),
            children: HashMap::new(),
        }
    }

    /// Rebuild a DAG from stored edges, checking every lineage invariant.
    pub fn from_edges(item_id: Id, edges: Vec<VersionSuccessor>) -> Result<Self> {
        let engine = InvariantEngine::lineage();
        let mut dag = Self::new(item_id);
        for edge in edges {
            engine
                .evaluate(&dag, edge.from_id(), edge.to_id())
                .map_err(|violation| {
                    CatalogError::BackendFailure(format!(
                        "stored lineage of item {} is corrupt: {violation}",
                        dag.item_id
                    ))
                })?;
            dag.insert_edge(edge);
        }
        Ok(dag)
    }

    pub fn item_id(&self) -> &Id {
        &self.item_id
    }

    pub fn edges(&self) -> &[VersionSuccessor] {
        &self.edges
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Whether `version` takes part in this lineage.
    pub fn contains(&self, version: &Id) -> bool {
        version != &self.item_id
            && (self.parents.contains_key(version) || self.children.contains_key(version))
    }

    pub fn has_edge(&self, from: &Id, to: &Id) -> bool {
        self.children
            .get(from)
            .map_or(false, |children| children.contains(to))
    }

    /// Every version in the lineage, in order of first appearance.
    pub fn versions(&self) -> Vec<Id> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .flat_map(|e| [e.from_id(), e.to_id()])
            .filter(|id| **id != self.item_id)
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }

    /// Versions with no recorded child.
    pub fn get_leaves(&self) -> Vec<Id> {
        self.versions()
            .into_iter()
            .filter(|id| self.children.get(id).map_or(true, |c| c.is_empty()))
            .collect()
    }

    /// Versions with no parent version.
    pub fn roots(&self) -> Vec<Id> {
        self.versions()
            .into_iter()
            .filter(|id| self.get_parents(id).is_empty())
            .collect()
    }

    /// `from` ids of every successor pointing at `version`.
    pub fn get_parents(&self, version: &Id) -> Vec<Id> {
        self.parents
            .get(version)
            .map(|parents| {
                parents
                    .iter()
                    .filter(|p| **p != self.item_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_children(&self, version: &Id) -> Vec<Id> {
        self.children.get(version).cloned().unwrap_or_default()
    }

    /// Whether `target` is reachable from `start` along successors.
    pub fn reaches(&self, start: &Id, target: &Id) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(children) = self.children.get(current) {
                stack.extend(children.iter());
            }
        }
        false
    }

    /// Validate a proposed edge without recording it.
    pub fn check_edge(&self, from: &Id, to: &Id) -> Result<()> {
        InvariantEngine::lineage().evaluate(self, from, to)?;
        Ok(())
    }

    fn insert_edge(&mut self, edge: VersionSuccessor) {
        self.parents
            .entry(edge.to_id().clone())
            .or_default()
            .push(edge.from_id().clone());
        self.children
            .entry(edge.from_id().clone())
            .or_default()
            .push(edge.to_id().clone());
        self.edges.push(edge);
    }

    /// Drop every edge touching a removed version and rebuild indices.
    fn prune(&mut self, removed: &HashSet<Id>) {
        let edges = std::mem::take(&mut self.edges);
        self.parents.clear();
        self.children.clear();
        for edge in edges {
            if !removed.contains(edge.from_id()) && !removed.contains(edge.to_id()) {
                self.insert_edge(edge);
            }
        }
    }
}

/// Outcome of a truncation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TruncationReport {
    /// The oldest retained level.
    pub retained_frontier: Vec<Id>,
    /// Deleted versions, in deletion order.
    pub deleted: Vec<Id>,
}

/// Persistence and retention for version history DAGs.
pub struct VersionHistoryDagStore<'a> {
    successors: SuccessorStore<'a>,
}

impl<'a> VersionHistoryDagStore<'a> {
    pub fn new(ids: &'a dyn IdGenerator) -> Self {
        Self {
            successors: SuccessorStore::new(ids),
        }
    }

    pub fn successors(&self) -> &SuccessorStore<'a> {
        &self.successors
    }

    /// A new, empty DAG. Nothing is persisted until an edge is added.
    pub fn create(&self, item_id: &Id) -> VersionHistoryDag {
        VersionHistoryDag::new(item_id.clone())
    }

    /// Load the item's lineage. An item with no versions yet yields an
    /// empty DAG.
    pub fn retrieve_from_database<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        item_id: &Id,
    ) -> Result<VersionHistoryDag> {
        let rows = match conn.select(tables::VERSION_HISTORY_DAG, &[Field::id("item_id", item_id)]) {
            Ok(rows) => rows,
            Err(err) if err.is_empty_result() => return Ok(self.create(item_id)),
            Err(err) => return Err(err),
        };

        let mut edges = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let successor_id = row.get_id("version_successor_id")?;
            edges.push(self.successors.retrieve(conn, &successor_id)?);
        }

        debug!(item = %item_id, edges = edges.len(), "reconstructed version history");
        VersionHistoryDag::from_edges(item_id.clone(), edges)
    }

    /// Record `parent -> child` for `item_id` inside the caller's
    /// transaction, then add it to `dag`.
    ///
    /// Does not commit or abort. Returns the new successor's id.
    pub fn add_edge<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        dag: &mut VersionHistoryDag,
        parent_id: &Id,
        child_id: &Id,
        item_id: &Id,
    ) -> Result<Id> {
        if dag.item_id() != item_id {
            return Err(CatalogError::InvalidArgument(format!(
                "DAG of item {} cannot record an edge for item {item_id}",
                dag.item_id()
            )));
        }
        dag.check_edge(parent_id, child_id)?;

        let successor = self.successors.create(parent_id, child_id)?;
        self.successors.insert(conn, &successor)?;
        conn.insert(
            tables::VERSION_HISTORY_DAG,
            &[
                Field::id("item_id", item_id),
                Field::id("version_successor_id", successor.id()),
            ],
        )?;

        let id = successor.id().clone();
        dag.insert_edge(successor);
        Ok(id)
    }

    /// Keep `num_levels` levels counted from the leaves and delete every
    /// older version's row from `kind`'s version table.
    ///
    /// Levels are walked breadth-first toward the roots. Everything one
    /// hop beyond the last kept level is deleted, cascading through all
    /// of its ancestors. The cascade does not check whether an ancestor
    /// is still within reach of another, shorter branch, so it may
    /// delete versions that branch keeps referencing. Successor rows are
    /// left in place; any that name a deleted version are stale. The
    /// `rich_version` and `structure_version_attribute` rows of deleted
    /// versions are left behind as well.
    ///
    /// A failure mid-cascade leaves earlier deletions pending in the
    /// caller's transaction and `dag` unchanged.
    pub fn truncate<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        dag: &mut VersionHistoryDag,
        num_levels: usize,
        kind: ItemKind,
    ) -> Result<TruncationReport> {
        if num_levels == 0 {
            return Err(CatalogError::InvalidArgument(
                "truncation must keep at least one level".into(),
            ));
        }

        let mut level = dag.get_leaves();
        for _ in 1..num_levels {
            if level.is_empty() {
                break;
            }
            level = parents_of_level(dag, &level);
        }

        let mut queue: VecDeque<Id> = parents_of_level(dag, &level).into();
        let mut deleted = Vec::new();
        let mut removed = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if removed.contains(&id) {
                continue;
            }
            conn.delete(kind.version_table(), &[Field::id("id", &id)])?;
            removed.insert(id.clone());

            for parent in dag.get_parents(&id) {
                if !removed.contains(&parent) {
                    queue.push_back(parent);
                }
            }
            deleted.push(id);
        }

        dag.prune(&removed);
        info!(
            item = %dag.item_id(),
            levels = num_levels,
            deleted = deleted.len(),
            "truncated version history"
        );

        Ok(TruncationReport {
            retained_frontier: level,
            deleted,
        })
    }
}

/// Union of the parents of every version in `level`, first-seen order.
fn parents_of_level(dag: &VersionHistoryDag, level: &[Id]) -> Vec<Id> {
    let mut seen = HashSet::new();
    level
        .iter()
        .flat_map(|id| dag.get_parents(id))
        .filter(|parent| seen.insert(parent.clone()))
        .collect()
}
