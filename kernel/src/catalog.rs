// Catalog Service
//
// The operations exposed to request dispatch: item creation, version
// creation and linkage, lineage queries and retention. Every mutating
// operation runs in exactly one backend transaction and either fully
// commits or leaves the backend as it was.
//
// Mutations of one item are serialized by a per-item lock held for
// the whole transaction, so two writers can never both extend the
// same leaf.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::db::{transaction, Backend, FieldType};
use crate::error::{CatalogError, Result};
use crate::id::{Id, IdGenerator, UuidIdGenerator};
use crate::models::item::ItemStore;
use crate::models::version::VersionStore;
use crate::models::{EdgeVersion, Item, ItemKind, NodeVersion, RichPayload, StructureVersion};
use crate::versions::{TruncationReport, VersionHistoryDag, VersionSuccessor};

/// One lock per item that has been mutated through this catalog.
#[derive(Default)]
struct ItemLocks {
    locks: Mutex<HashMap<Id, Arc<Mutex<()>>>>,
}

impl ItemLocks {
    fn for_item(&self, item_id: &Id) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(item_id.clone())
            .or_default()
            .clone()
    }
}

/// Version lineage catalog over one backend.
pub struct Catalog<B: Backend, G: IdGenerator = UuidIdGenerator> {
    backend: B,
    ids: G,
    locks: ItemLocks,
}

impl<B: Backend, G: IdGenerator> Catalog<B, G> {
    pub fn new(backend: B, ids: G) -> Self {
        Self {
            backend,
            ids,
            locks: ItemLocks::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn items(&self) -> ItemStore<'_> {
        ItemStore::new(&self.ids)
    }

    /// Create an item under a freshly minted id.
    pub fn create_item(&self, kind: ItemKind, name: Option<&str>) -> Result<Item> {
        let id = self.ids.new_id();
        self.register_item(kind, id, name)
    }

    /// Create an item under a caller-supplied id.
    pub fn register_item(&self, kind: ItemKind, id: Id, name: Option<&str>) -> Result<Item> {
        let lock = self.locks.for_item(&id);
        let _guard = lock.lock();

        let item = Item {
            id,
            kind,
            name: name.map(str::to_owned),
        };
        let items = self.items();
        transaction(&self.backend, |conn| items.create(conn, &item))?;
        info!(item = %item.id, %kind, "created item");
        Ok(item)
    }

    pub fn get_item(&self, id: &Id) -> Result<Item> {
        let items = self.items();
        transaction(&self.backend, |conn| items.retrieve(conn, id))
    }

    /// Link an existing, unlinked version of `item_id` into its lineage.
    pub fn link_version(&self, item_id: &Id, version_id: &Id, parent: Option<&Id>) -> Result<Id> {
        let lock = self.locks.for_item(item_id);
        let _guard = lock.lock();

        let items = self.items();
        let successor_id = transaction(&self.backend, |conn| {
            let item = items.retrieve(conn, item_id)?;
            VersionStore::require_in_item(conn, item.kind, version_id, item_id)?;
            items.update(conn, &item, version_id, parent)
        })?;

        info!(item = %item_id, version = %version_id, successor = %successor_id, "linked version");
        Ok(successor_id)
    }

    pub fn get_dag(&self, item_id: &Id) -> Result<VersionHistoryDag> {
        let items = self.items();
        transaction(&self.backend, |conn| {
            items.dags().retrieve_from_database(conn, item_id)
        })
    }

    pub fn get_leaves(&self, item_id: &Id) -> Result<Vec<Id>> {
        Ok(self.get_dag(item_id)?.get_leaves())
    }

    pub fn get_successor(&self, id: &Id) -> Result<VersionSuccessor> {
        let items = self.items();
        transaction(&self.backend, |conn| {
            items.dags().successors().retrieve(conn, id)
        })
    }

    /// Delete every version of `item_id` older than `num_levels` levels.
    pub fn truncate(&self, item_id: &Id, num_levels: usize) -> Result<TruncationReport> {
        let lock = self.locks.for_item(item_id);
        let _guard = lock.lock();

        let items = self.items();
        transaction(&self.backend, |conn| {
            let item = items.retrieve(conn, item_id)?;
            let mut dag = items.dags().retrieve_from_database(conn, item_id)?;
            items
                .dags()
                .truncate(conn, &mut dag, num_levels, item.kind)
        })
    }

    pub fn create_node_version(
        &self,
        node_id: &Id,
        payload: RichPayload,
        parent: Option<&Id>,
    ) -> Result<NodeVersion> {
        let lock = self.locks.for_item(node_id);
        let _guard = lock.lock();

        let version = NodeVersion {
            id: self.ids.new_id(),
            node_id: node_id.clone(),
            payload,
        };
        let items = self.items();
        transaction(&self.backend, |conn| {
            let item = items.retrieve(conn, node_id)?;
            expect_kind(&item, ItemKind::Node)?;
            VersionStore::insert_node_version(conn, &version)?;
            items.update(conn, &item, &version.id, parent)
        })?;

        info!(version = %version.id, node = %node_id, "created node version");
        Ok(version)
    }

    /// Create a version of `edge_id` connecting two node versions.
    pub fn create_edge_version(
        &self,
        edge_id: &Id,
        from_id: &Id,
        to_id: &Id,
        payload: RichPayload,
        parent: Option<&Id>,
    ) -> Result<EdgeVersion> {
        let lock = self.locks.for_item(edge_id);
        let _guard = lock.lock();

        let version = EdgeVersion {
            id: self.ids.new_id(),
            edge_id: edge_id.clone(),
            from_id: from_id.clone(),
            to_id: to_id.clone(),
            payload,
        };
        let items = self.items();
        transaction(&self.backend, |conn| {
            let item = items.retrieve(conn, edge_id)?;
            expect_kind(&item, ItemKind::Edge)?;
            VersionStore::insert_edge_version(conn, &version)?;
            items.update(conn, &item, &version.id, parent)
        })?;

        info!(version = %version.id, edge = %edge_id, "created edge version");
        Ok(version)
    }

    pub fn create_structure_version(
        &self,
        structure_id: &Id,
        attributes: BTreeMap<String, FieldType>,
        parent: Option<&Id>,
    ) -> Result<StructureVersion> {
        let lock = self.locks.for_item(structure_id);
        let _guard = lock.lock();

        let version = StructureVersion {
            id: self.ids.new_id(),
            structure_id: structure_id.clone(),
            attributes,
        };
        let items = self.items();
        transaction(&self.backend, |conn| {
            let item = items.retrieve(conn, structure_id)?;
            expect_kind(&item, ItemKind::Structure)?;
            VersionStore::insert_structure_version(conn, &version)?;
            items.update(conn, &item, &version.id, parent)
        })?;

        info!(version = %version.id, structure = %structure_id, "created structure version");
        Ok(version)
    }

    pub fn get_node_version(&self, id: &Id) -> Result<NodeVersion> {
        transaction(&self.backend, |conn| VersionStore::retrieve_node_version(conn, id))
    }

    pub fn get_edge_version(&self, id: &Id) -> Result<EdgeVersion> {
        transaction(&self.backend, |conn| VersionStore::retrieve_edge_version(conn, id))
    }

    pub fn get_structure_version(&self, id: &Id) -> Result<StructureVersion> {
        transaction(&self.backend, |conn| {
            VersionStore::retrieve_structure_version(conn, id)
        })
    }
}

fn expect_kind(item: &Item, kind: ItemKind) -> Result<()> {
    if item.kind == kind {
        Ok(())
    } else {
        Err(CatalogError::InvalidArgument(format!(
            "item {} is a {}, not a {kind}",
            item.id, item.kind
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::graph::GraphBackend;
    use crate::db::sqlite::SqliteBackend;
    use crate::db::{tables, Connection, Field, GraphOps, ResultSet};
    use crate::id::SequentialIdGenerator;
    use std::collections::BTreeSet;

    fn catalog<B: Backend>(backend: B) -> Catalog<B, SequentialIdGenerator> {
        Catalog::new(backend, SequentialIdGenerator::new("test"))
    }

    fn leaf_set<B: Backend>(catalog: &Catalog<B, SequentialIdGenerator>, item: &Id) -> BTreeSet<Id> {
        catalog.get_leaves(item).unwrap().into_iter().collect()
    }

    fn check_node_lineage<B: Backend>(backend: B) {
        let catalog = catalog(backend);
        let node = catalog.create_item(ItemKind::Node, Some("orders")).unwrap();

        let v1 = catalog
            .create_node_version(&node.id, RichPayload::default(), None)
            .unwrap();
        let v2 = catalog
            .create_node_version(&node.id, RichPayload::default(), None)
            .unwrap();
        let v3 = catalog
            .create_node_version(&node.id, RichPayload::default(), Some(&v1.id))
            .unwrap();

        assert_eq!(
            leaf_set(&catalog, &node.id),
            BTreeSet::from([v2.id.clone(), v3.id.clone()])
        );
        let dag = catalog.get_dag(&node.id).unwrap();
        assert_eq!(dag.get_parents(&v2.id), vec![v1.id.clone()]);
        assert!(dag.get_parents(&v1.id).is_empty());

        let report = catalog.truncate(&node.id, 1).unwrap();
        assert_eq!(report.deleted, vec![v1.id.clone()]);
        assert!(catalog.get_node_version(&v1.id).unwrap_err().is_not_found());
        assert_eq!(catalog.get_node_version(&v2.id).unwrap().node_id, node.id);
    }

    #[test]
    fn node_lineage_on_both_backends() {
        check_node_lineage(SqliteBackend::in_memory().unwrap());
        check_node_lineage(GraphBackend::in_memory());
    }

    #[test]
    fn edge_versions_keep_lineage_and_endpoint_edges_apart() {
        let catalog = catalog(GraphBackend::in_memory());
        let node = catalog.create_item(ItemKind::Node, None).unwrap();
        let edge = catalog.create_item(ItemKind::Edge, None).unwrap();

        let a = catalog
            .create_node_version(&node.id, RichPayload::default(), None)
            .unwrap();
        let b = catalog
            .create_node_version(&node.id, RichPayload::default(), None)
            .unwrap();
        let ev = catalog
            .create_edge_version(&edge.id, &a.id, &b.id, RichPayload::default(), None)
            .unwrap();

        let graph = catalog.backend().snapshot();
        // Origin edges for a and ev, plus a -> b.
        assert_eq!(graph.edges_labelled(tables::SUCCESSOR_EDGE).count(), 3);
        assert_eq!(graph.edges_labelled(tables::ENDPOINT_EDGE).count(), 2);

        let loaded = catalog.get_edge_version(&ev.id).unwrap();
        assert_eq!((loaded.from_id, loaded.to_id), (a.id, b.id));
        assert_eq!(catalog.get_leaves(&edge.id).unwrap(), vec![ev.id]);
    }

    #[test]
    fn structure_versions_carry_attributes() {
        let catalog = catalog(SqliteBackend::in_memory().unwrap());
        let structure = catalog.create_item(ItemKind::Structure, Some("schema")).unwrap();
        let attributes = BTreeMap::from([("rows".to_string(), FieldType::Long)]);

        let sv = catalog
            .create_structure_version(&structure.id, attributes.clone(), None)
            .unwrap();

        assert_eq!(catalog.get_structure_version(&sv.id).unwrap().attributes, attributes);
        assert_eq!(catalog.get_leaves(&structure.id).unwrap(), vec![sv.id]);
    }

    fn check_truncated_parent_is_rejected<B: Backend>(backend: B) {
        let catalog = catalog(backend);
        let node = catalog.create_item(ItemKind::Node, None).unwrap();
        let mut versions = Vec::new();
        for _ in 0..3 {
            versions.push(
                catalog
                    .create_node_version(&node.id, RichPayload::default(), None)
                    .unwrap()
                    .id,
            );
        }

        let report = catalog.truncate(&node.id, 1).unwrap();
        assert_eq!(report.deleted, vec![versions[1].clone(), versions[0].clone()]);

        let err = catalog
            .create_node_version(&node.id, RichPayload::default(), Some(&versions[0]))
            .unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
        assert_eq!(catalog.get_leaves(&node.id).unwrap(), vec![versions[2].clone()]);
    }

    #[test]
    fn truncated_parent_is_not_found_on_both_backends() {
        check_truncated_parent_is_rejected(SqliteBackend::in_memory().unwrap());
        check_truncated_parent_is_rejected(GraphBackend::in_memory());
    }

    #[test]
    fn racing_registrations_of_one_id_create_one_item() {
        let catalog = catalog(GraphBackend::in_memory());

        let outcomes: Vec<Result<Item>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| catalog.register_item(ItemKind::Node, Id::from("n1"), None))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .filter_map(|o| o.as_ref().err())
            .all(|err| err.is_invalid_argument()));
        let graph = catalog.backend().snapshot();
        assert_eq!(graph.vertices_labelled(tables::ITEM).count(), 1);
    }

    #[test]
    fn wrong_item_kind_is_rejected() {
        let catalog = catalog(SqliteBackend::in_memory().unwrap());
        let edge = catalog.create_item(ItemKind::Edge, None).unwrap();

        let err = catalog
            .create_node_version(&edge.id, RichPayload::default(), None)
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn link_version_requires_a_version_of_the_item() {
        let catalog = catalog(SqliteBackend::in_memory().unwrap());
        let item = catalog
            .register_item(ItemKind::Node, Id::from("n1"), None)
            .unwrap();
        catalog
            .register_item(ItemKind::Node, Id::from("n2"), None)
            .unwrap();

        transaction(catalog.backend(), |conn| {
            VersionStore::insert_node_version(
                conn,
                &NodeVersion {
                    id: Id::from("v1"),
                    node_id: item.id.clone(),
                    payload: RichPayload::default(),
                },
            )
        })
        .unwrap();

        let err = catalog
            .link_version(&Id::from("n2"), &Id::from("v1"), None)
            .unwrap_err();
        assert!(err.is_not_found());

        let successor = catalog.link_version(&item.id, &Id::from("v1"), None).unwrap();
        let edge = catalog.get_successor(&successor).unwrap();
        assert_eq!(edge.to_id(), &Id::from("v1"));
        assert_eq!(catalog.get_leaves(&item.id).unwrap(), vec![Id::from("v1")]);
    }

    #[test]
    fn unknown_item_has_empty_lineage_but_cannot_be_truncated() {
        let catalog = catalog(SqliteBackend::in_memory().unwrap());
        let ghost = Id::from("ghost");

        assert!(catalog.get_dag(&ghost).unwrap().is_empty());
        assert!(catalog.truncate(&ghost, 3).unwrap_err().is_not_found());
    }

    /// Delegates to a real backend but fails every insert into one table.
    struct FlakyBackend<B> {
        inner: B,
        fail_on: &'static str,
    }

    struct FlakyConnection<C> {
        inner: C,
        fail_on: &'static str,
    }

    impl<B: Backend> Backend for FlakyBackend<B> {
        type Connection<'a> = FlakyConnection<B::Connection<'a>> where Self: 'a;

        fn begin(&self) -> Result<Self::Connection<'_>> {
            Ok(FlakyConnection {
                inner: self.inner.begin()?,
                fail_on: self.fail_on,
            })
        }
    }

    impl<C: Connection> Connection for FlakyConnection<C> {
        fn select(&mut self, table: &str, predicates: &[Field]) -> Result<ResultSet> {
            self.inner.select(table, predicates)
        }

        fn insert(&mut self, table: &str, fields: &[Field]) -> Result<()> {
            if table == self.fail_on {
                return Err(CatalogError::BackendFailure(format!("injected fault on {table}")));
            }
            self.inner.insert(table, fields)
        }

        fn delete(&mut self, table: &str, predicates: &[Field]) -> Result<()> {
            self.inner.delete(table, predicates)
        }

        fn graph(&mut self) -> Option<&mut dyn GraphOps> {
            self.inner.graph()
        }

        fn commit(self) -> Result<()> {
            self.inner.commit()
        }

        fn abort(self) -> Result<()> {
            self.inner.abort()
        }
    }

    fn assert_nothing_durable<B: Backend>(backend: &B, table: &str) {
        let err = transaction(backend, |conn| conn.select(table, &[])).unwrap_err();
        assert!(err.is_empty_result(), "rows left behind in {table}");
    }

    #[test]
    fn failed_linkage_rolls_back_the_whole_version() {
        let flaky = FlakyBackend {
            inner: SqliteBackend::in_memory().unwrap(),
            fail_on: tables::VERSION_HISTORY_DAG,
        };
        let catalog = catalog(flaky);
        let node = catalog.create_item(ItemKind::Node, None).unwrap();

        let payload = RichPayload {
            reference: Some("s3://bucket/orders".into()),
            ..RichPayload::default()
        };
        let err = catalog
            .create_node_version(&node.id, payload, None)
            .unwrap_err();

        // The original failure comes back unchanged.
        assert!(err.to_string().contains("injected fault"));
        let inner = &catalog.backend().inner;
        assert_nothing_durable(inner, tables::NODE_VERSION);
        assert_nothing_durable(inner, tables::RICH_VERSION);
        assert_nothing_durable(inner, tables::VERSION_SUCCESSOR);
        assert!(catalog.get_dag(&node.id).unwrap().is_empty());
    }

    #[test]
    fn failed_graph_edge_version_leaves_no_vertices() {
        let flaky = FlakyBackend {
            inner: GraphBackend::in_memory(),
            fail_on: tables::VERSION_HISTORY_DAG,
        };
        let catalog = catalog(flaky);
        let node = catalog.create_item(ItemKind::Node, None).unwrap();
        let edge = catalog.create_item(ItemKind::Edge, None).unwrap();

        transaction(&catalog.backend().inner, |conn| {
            for id in ["a", "b"] {
                VersionStore::insert_node_version(
                    conn,
                    &NodeVersion {
                        id: Id::from(id),
                        node_id: node.id.clone(),
                        payload: RichPayload::default(),
                    },
                )?;
            }
            Ok(())
        })
        .unwrap();
        let before = catalog.backend().inner.snapshot();

        catalog
            .create_edge_version(&edge.id, &Id::from("a"), &Id::from("b"), RichPayload::default(), None)
            .unwrap_err();

        assert_eq!(catalog.backend().inner.snapshot(), before);
    }

    #[test]
    fn concurrent_writers_extend_one_chain() {
        let catalog = catalog(GraphBackend::in_memory());
        let node = catalog.create_item(ItemKind::Node, None).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    catalog
                        .create_node_version(&node.id, RichPayload::default(), None)
                        .unwrap();
                });
            }
        });

        let dag = catalog.get_dag(&node.id).unwrap();
        assert_eq!(dag.versions().len(), 8);
        assert_eq!(dag.get_leaves().len(), 1);
        assert_eq!(dag.roots().len(), 1);
    }
}
