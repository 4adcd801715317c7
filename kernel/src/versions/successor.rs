// Version Successors
//
// A successor is one immediate derivation step: `to` was derived
// from `from`. Successors are immutable once created.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{tables, Connection, Field};
use crate::error::{CatalogError, Result};
use crate::id::{Id, IdGenerator};

/// Directed lineage edge between two versions of one item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionSuccessor {
    id: Id,
    from_id: Id,
    to_id: Id,
}

impl VersionSuccessor {
    /// A version cannot derive from itself.
    pub fn new(id: Id, from_id: Id, to_id: Id) -> Result<Self> {
        if from_id == to_id {
            return Err(CatalogError::InvalidArgument(format!(
                "version {from_id} cannot succeed itself"
            )));
        }
        Ok(Self { id, from_id, to_id })
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn from_id(&self) -> &Id {
        &self.from_id
    }

    pub fn to_id(&self) -> &Id {
        &self.to_id
    }
}

/// Creates, persists and loads successors.
pub struct SuccessorStore<'a> {
    ids: &'a dyn IdGenerator,
}

impl<'a> SuccessorStore<'a> {
    pub fn new(ids: &'a dyn IdGenerator) -> Self {
        Self { ids }
    }

    /// Mint a successor. Nothing is persisted.
    pub fn create(&self, from_id: &Id, to_id: &Id) -> Result<VersionSuccessor> {
        VersionSuccessor::new(self.ids.new_id(), from_id.clone(), to_id.clone())
    }

    /// Persist a successor inside the caller's transaction.
    ///
    /// Graph-native backends also get a lineage edge between the two
    /// version vertices, which must already exist.
    pub fn insert<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        successor: &VersionSuccessor,
    ) -> Result<()> {
        conn.insert(
            tables::VERSION_SUCCESSOR,
            &[
                Field::id("id", &successor.id),
                Field::id("from_version_id", &successor.from_id),
                Field::id("to_version_id", &successor.to_id),
            ],
        )?;

        if let Some(graph) = conn.graph() {
            let from = graph.get_vertex(&[Field::id("id", &successor.from_id)])?;
            let to = graph.get_vertex(&[Field::id("id", &successor.to_id)])?;
            graph.add_edge(
                tables::SUCCESSOR_EDGE,
                from,
                to,
                &[Field::id("successor_id", &successor.id)],
            )?;
        }

        debug!(id = %successor.id, from = %successor.from_id, to = %successor.to_id, "successor stored");
        Ok(())
    }

    /// Load one successor; `NotFound` if absent.
    pub fn retrieve<C: Connection + ?Sized>(&self, conn: &mut C, id: &Id) -> Result<VersionSuccessor> {
        let rows = match conn.select(tables::VERSION_SUCCESSOR, &[Field::id("id", id)]) {
            Ok(rows) => rows,
            Err(err) if err.is_empty_result() => {
                return Err(CatalogError::NotFound(format!("version successor {id}")))
            }
            Err(err) => return Err(err),
        };

        let row = rows.first();
        Ok(VersionSuccessor {
            id: row.get_id("id")?,
            from_id: row.get_id("from_version_id")?,
            to_id: row.get_id("to_version_id")?,
        })
    }
}
