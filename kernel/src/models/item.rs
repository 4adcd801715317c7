// Items
//
// Item rows and the linkage of new versions into an item's lineage.

use tracing::debug;

use crate::db::{tables, Connection, Field};
use crate::error::{CatalogError, Result};
use crate::id::{Id, IdGenerator};
use crate::models::version::VersionStore;
use crate::models::{Item, ItemKind};
use crate::versions::dag::VersionHistoryDagStore;

pub struct ItemStore<'a> {
    dags: VersionHistoryDagStore<'a>,
}

impl<'a> ItemStore<'a> {
    pub fn new(ids: &'a dyn IdGenerator) -> Self {
        Self {
            dags: VersionHistoryDagStore::new(ids),
        }
    }

    pub fn dags(&self) -> &VersionHistoryDagStore<'a> {
        &self.dags
    }

    /// Insert a new item; an id already in use is `InvalidArgument`.
    pub fn create<C: Connection + ?Sized>(&self, conn: &mut C, item: &Item) -> Result<()> {
        match conn.select(tables::ITEM, &[Field::id("id", &item.id)]) {
            Ok(_) => {
                return Err(CatalogError::InvalidArgument(format!(
                    "item {} already exists",
                    item.id
                )))
            }
            Err(err) if err.is_empty_result() => {}
            Err(err) => return Err(err),
        }
        conn.insert(
            tables::ITEM,
            &[
                Field::id("id", &item.id),
                Field::string("kind", item.kind.as_str()),
                Field::opt_string("name", item.name.as_deref()),
            ],
        )
    }

    pub fn retrieve<C: Connection + ?Sized>(&self, conn: &mut C, id: &Id) -> Result<Item> {
        let rows = match conn.select(tables::ITEM, &[Field::id("id", id)]) {
            Ok(rows) => rows,
            Err(err) if err.is_empty_result() => {
                return Err(CatalogError::NotFound(format!("item {id}")))
            }
            Err(err) => return Err(err),
        };

        let row = rows.first();
        Ok(Item {
            id: row.get_id("id")?,
            kind: row.get_string("kind")?.parse::<ItemKind>()?,
            name: row.get_opt_string("name")?,
        })
    }

    /// Link `child_id` into the item's lineage inside the caller's
    /// transaction and return the new successor's id.
    ///
    /// Without an explicit parent, the first version becomes a root
    /// and later versions extend the single current leaf. An item with
    /// several leaves requires an explicit parent. An explicit parent
    /// must still have its version row; truncated versions linger in
    /// the DAG through stale successors.
    pub fn update<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        item: &Item,
        child_id: &Id,
        parent: Option<&Id>,
    ) -> Result<Id> {
        let item_id = &item.id;
        let mut dag = self.dags.retrieve_from_database(conn, item_id)?;

        let parent_id = match parent {
            Some(parent) if dag.contains(parent) => {
                VersionStore::require_in_item(conn, item.kind, parent, item_id)?;
                parent.clone()
            }
            Some(parent) => {
                return Err(CatalogError::NotFound(format!(
                    "parent version {parent} in item {item_id}"
                )))
            }
            None if dag.is_empty() => item_id.clone(),
            None => match dag.get_leaves().as_slice() {
                [leaf] => leaf.clone(),
                leaves => {
                    return Err(CatalogError::InvalidArgument(format!(
                        "item {item_id} has {} leaves, a parent version must be specified",
                        leaves.len()
                    )))
                }
            },
        };

        debug!(item = %item_id, parent = %parent_id, child = %child_id, "linking version");
        self.dags
            .add_edge(conn, &mut dag, &parent_id, child_id, item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::graph::GraphBackend;
    use crate::db::sqlite::SqliteBackend;
    use crate::db::{transaction, Backend};
    use crate::id::SequentialIdGenerator;
    use crate::models::{NodeVersion, RichPayload};

    fn node(id: &str) -> Item {
        Item {
            id: Id::from(id),
            kind: ItemKind::Node,
            name: Some("orders".into()),
        }
    }

    #[test]
    fn created_item_reads_back() {
        let ids = SequentialIdGenerator::new("s");
        let items = ItemStore::new(&ids);
        let backend = SqliteBackend::in_memory().unwrap();

        transaction(&backend, |conn| items.create(conn, &node("n1"))).unwrap();
        let item = transaction(&backend, |conn| items.retrieve(conn, &Id::from("n1"))).unwrap();

        assert_eq!(item, node("n1"));
    }

    #[test]
    fn duplicate_item_id_is_rejected() {
        let ids = SequentialIdGenerator::new("s");
        let items = ItemStore::new(&ids);
        let backend = GraphBackend::in_memory();

        transaction(&backend, |conn| items.create(conn, &node("n1"))).unwrap();
        let err = transaction(&backend, |conn| items.create(conn, &node("n1"))).unwrap_err();

        assert!(err.is_invalid_argument());
        assert_eq!(backend.snapshot().vertex_count(), 1);
    }

    #[test]
    fn missing_item_is_not_found() {
        let ids = SequentialIdGenerator::new("s");
        let items = ItemStore::new(&ids);
        let backend = SqliteBackend::in_memory().unwrap();

        let mut conn = backend.begin().unwrap();
        assert!(items.retrieve(&mut conn, &Id::from("n1")).unwrap_err().is_not_found());
        conn.abort().unwrap();
    }

    fn seed_versions<B: Backend>(backend: &B, versions: &[&str]) {
        transaction(backend, |conn| {
            for id in versions {
                VersionStore::insert_node_version(
                    conn,
                    &NodeVersion {
                        id: Id::from(*id),
                        node_id: Id::from("n1"),
                        payload: RichPayload::default(),
                    },
                )?;
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn implicit_parents_follow_the_single_leaf() {
        let ids = SequentialIdGenerator::new("s");
        let items = ItemStore::new(&ids);
        let backend = SqliteBackend::in_memory().unwrap();
        let item = node("n1");

        transaction(&backend, |conn| {
            items.update(conn, &item, &Id::from("v1"), None)?;
            items.update(conn, &item, &Id::from("v2"), None)?;
            items.update(conn, &item, &Id::from("v3"), None)
        })
        .unwrap();

        let dag = transaction(&backend, |conn| {
            items.dags().retrieve_from_database(conn, &item.id)
        })
        .unwrap();
        assert_eq!(dag.get_leaves(), vec![Id::from("v3")]);
        assert_eq!(dag.get_parents(&Id::from("v3")), vec![Id::from("v2")]);
        assert!(dag.get_parents(&Id::from("v1")).is_empty());
    }

    #[test]
    fn several_leaves_require_an_explicit_parent() {
        let ids = SequentialIdGenerator::new("s");
        let items = ItemStore::new(&ids);
        let backend = SqliteBackend::in_memory().unwrap();
        let item = node("n1");
        seed_versions(&backend, &["v1"]);

        transaction(&backend, |conn| {
            items.update(conn, &item, &Id::from("v1"), None)?;
            items.update(conn, &item, &Id::from("v2"), Some(&Id::from("v1")))?;
            items.update(conn, &item, &Id::from("v3"), Some(&Id::from("v1")))
        })
        .unwrap();

        let err = transaction(&backend, |conn| {
            items.update(conn, &item, &Id::from("v4"), None)
        })
        .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn unknown_parent_is_not_found() {
        let ids = SequentialIdGenerator::new("s");
        let items = ItemStore::new(&ids);
        let backend = SqliteBackend::in_memory().unwrap();

        let err = transaction(&backend, |conn| {
            items.update(conn, &node("n1"), &Id::from("v1"), Some(&Id::from("v0")))
        })
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn parent_without_a_version_row_is_not_found() {
        let ids = SequentialIdGenerator::new("s");
        let items = ItemStore::new(&ids);
        let backend = SqliteBackend::in_memory().unwrap();
        let item = node("n1");
        seed_versions(&backend, &["v1", "v2"]);

        transaction(&backend, |conn| {
            items.update(conn, &item, &Id::from("v1"), None)?;
            items.update(conn, &item, &Id::from("v2"), None)?;
            conn.delete(tables::NODE_VERSION, &[Field::string("id", "v1")])
        })
        .unwrap();

        let err = transaction(&backend, |conn| {
            items.update(conn, &item, &Id::from("v3"), Some(&Id::from("v1")))
        })
        .unwrap_err();
        assert!(err.is_not_found());

        let dag = transaction(&backend, |conn| {
            items.dags().retrieve_from_database(conn, &item.id)
        })
        .unwrap();
        assert!(!dag.contains(&Id::from("v3")));
    }
}
