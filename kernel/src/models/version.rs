// Version Rows
//
// Reads and writes the identity rows of node, edge and structure
// versions together with their opaque payloads. Graph-native backends
// additionally connect an edge version to its two endpoint vertices.

use std::collections::BTreeMap;

use crate::db::{tables, Connection, Field, FieldType, Row};
use crate::error::{CatalogError, Result};
use crate::id::Id;
use crate::models::{EdgeVersion, ItemKind, NodeVersion, RichPayload, StructureVersion};

/// Stateless accessors for version rows.
pub struct VersionStore;

impl VersionStore {
    pub fn insert_node_version<C: Connection + ?Sized>(conn: &mut C, version: &NodeVersion) -> Result<()> {
        conn.insert(
            tables::NODE_VERSION,
            &[
                Field::id("id", &version.id),
                Field::id("node_id", &version.node_id),
            ],
        )?;
        Self::insert_payload(conn, &version.id, &version.payload)
    }

    /// Both endpoints must be existing node versions.
    pub fn insert_edge_version<C: Connection + ?Sized>(conn: &mut C, version: &EdgeVersion) -> Result<()> {
        for endpoint in [&version.from_id, &version.to_id] {
            Self::require(conn, ItemKind::Node, endpoint)?;
        }

        let fields = [
            Field::id("id", &version.id),
            Field::id("edge_id", &version.edge_id),
            Field::id("endpoint_one", &version.from_id),
            Field::id("endpoint_two", &version.to_id),
        ];

        match conn.graph() {
            Some(graph) => {
                let vertex = graph.add_vertex(tables::EDGE_VERSION, &fields)?;
                let from = graph.get_vertex(&[Field::id("id", &version.from_id)])?;
                let to = graph.get_vertex(&[Field::id("id", &version.to_id)])?;
                graph.add_edge(tables::ENDPOINT_EDGE, from, vertex, &[])?;
                graph.add_edge(tables::ENDPOINT_EDGE, vertex, to, &[])?;
            }
            None => conn.insert(tables::EDGE_VERSION, &fields)?,
        }

        Self::insert_payload(conn, &version.id, &version.payload)
    }

    pub fn insert_structure_version<C: Connection + ?Sized>(
        conn: &mut C,
        version: &StructureVersion,
    ) -> Result<()> {
        conn.insert(
            tables::STRUCTURE_VERSION,
            &[
                Field::id("id", &version.id),
                Field::id("structure_id", &version.structure_id),
            ],
        )?;

        for (key, field_type) in &version.attributes {
            conn.insert(
                tables::STRUCTURE_VERSION_ATTRIBUTE,
                &[
                    Field::id("structure_version_id", &version.id),
                    Field::string("key", key.as_str()),
                    Field::string("type", field_type.as_str()),
                ],
            )?;
        }
        Ok(())
    }

    pub fn retrieve_node_version<C: Connection + ?Sized>(conn: &mut C, id: &Id) -> Result<NodeVersion> {
        let row = Self::require(conn, ItemKind::Node, id)?;
        Ok(NodeVersion {
            id: row.get_id("id")?,
            node_id: row.get_id("node_id")?,
            payload: Self::retrieve_payload(conn, id)?,
        })
    }

    pub fn retrieve_edge_version<C: Connection + ?Sized>(conn: &mut C, id: &Id) -> Result<EdgeVersion> {
        let row = Self::require(conn, ItemKind::Edge, id)?;
        Ok(EdgeVersion {
            id: row.get_id("id")?,
            edge_id: row.get_id("edge_id")?,
            from_id: row.get_id("endpoint_one")?,
            to_id: row.get_id("endpoint_two")?,
            payload: Self::retrieve_payload(conn, id)?,
        })
    }

    pub fn retrieve_structure_version<C: Connection + ?Sized>(
        conn: &mut C,
        id: &Id,
    ) -> Result<StructureVersion> {
        let row = Self::require(conn, ItemKind::Structure, id)?;

        let mut attributes = BTreeMap::new();
        match conn.select(
            tables::STRUCTURE_VERSION_ATTRIBUTE,
            &[Field::id("structure_version_id", id)],
        ) {
            Ok(rows) => {
                for row in rows {
                    let field_type = row.get_string("type")?.parse::<FieldType>()?;
                    attributes.insert(row.get_string("key")?, field_type);
                }
            }
            Err(err) if err.is_empty_result() => {}
            Err(err) => return Err(err),
        }

        Ok(StructureVersion {
            id: row.get_id("id")?,
            structure_id: row.get_id("structure_id")?,
            attributes,
        })
    }

    /// `NotFound` unless `version_id` is a version of `item_id`.
    pub fn require_in_item<C: Connection + ?Sized>(
        conn: &mut C,
        kind: ItemKind,
        version_id: &Id,
        item_id: &Id,
    ) -> Result<()> {
        match conn.select(
            kind.version_table(),
            &[
                Field::id("id", version_id),
                Field::id(kind.item_column(), item_id),
            ],
        ) {
            Ok(_) => Ok(()),
            Err(err) if err.is_empty_result() => Err(CatalogError::NotFound(format!(
                "{kind} version {version_id} in item {item_id}"
            ))),
            Err(err) => Err(err),
        }
    }

    fn require<C: Connection + ?Sized>(conn: &mut C, kind: ItemKind, id: &Id) -> Result<Row> {
        match conn.select(kind.version_table(), &[Field::id("id", id)]) {
            Ok(rows) => Ok(rows.first().clone()),
            Err(err) if err.is_empty_result() => {
                Err(CatalogError::NotFound(format!("{kind} version {id}")))
            }
            Err(err) => Err(err),
        }
    }

    fn insert_payload<C: Connection + ?Sized>(conn: &mut C, id: &Id, payload: &RichPayload) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        conn.insert(
            tables::RICH_VERSION,
            &[
                Field::id("version_id", id),
                Field::opt_string("reference", payload.reference.as_deref()),
                Field::string("payload", serde_json::to_string(payload)?),
            ],
        )
    }

    fn retrieve_payload<C: Connection + ?Sized>(conn: &mut C, id: &Id) -> Result<RichPayload> {
        match conn.select(tables::RICH_VERSION, &[Field::id("version_id", id)]) {
            Ok(rows) => Ok(serde_json::from_str(&rows.first().get_string("payload")?)?),
            Err(err) if err.is_empty_result() => Ok(RichPayload::default()),
            Err(err) => Err(err),
        }
    }
}
