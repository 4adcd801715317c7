// Catalog Entities
//
// Items are long-lived nodes, edges and structures. Versions are
// immutable snapshots of one item. The kernel only interprets version
// identity and lineage; the rich payload is carried opaquely.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::db::{tables, FieldType};
use crate::error::CatalogError;
use crate::id::Id;

pub mod item;
pub mod version;

/// Kind of a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Node,
    Edge,
    Structure,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Node => "node",
            ItemKind::Edge => "edge",
            ItemKind::Structure => "structure",
        }
    }

    /// Table (or vertex label) holding this kind's versions.
    pub fn version_table(&self) -> &'static str {
        match self {
            ItemKind::Node => tables::NODE_VERSION,
            ItemKind::Edge => tables::EDGE_VERSION,
            ItemKind::Structure => tables::STRUCTURE_VERSION,
        }
    }

    /// Column of a version row naming its item.
    pub fn item_column(&self) -> &'static str {
        match self {
            ItemKind::Node => "node_id",
            ItemKind::Edge => "edge_id",
            ItemKind::Structure => "structure_id",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(ItemKind::Node),
            "edge" => Ok(ItemKind::Edge),
            "structure" => Ok(ItemKind::Structure),
            other => Err(CatalogError::InvalidArgument(format!(
                "unknown item kind `{other}`"
            ))),
        }
    }
}

/// A long-lived entity owning one version lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Id,
    pub kind: ItemKind,
    pub name: Option<String>,
}

/// Attributes of a rich version the kernel stores but never inspects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichPayload {
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Structure version describing the shape of this version's data.
    #[serde(default)]
    pub structure_version_id: Option<Id>,
}

impl RichPayload {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.reference.is_none()
            && self.parameters.is_empty()
            && self.structure_version_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVersion {
    pub id: Id,
    pub node_id: Id,
    pub payload: RichPayload,
}

/// A version of a domain edge, connecting two node versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeVersion {
    pub id: Id,
    pub edge_id: Id,
    pub from_id: Id,
    pub to_id: Id,
    pub payload: RichPayload,
}

/// A version of a structure: a named set of typed attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureVersion {
    pub id: Id,
    pub structure_id: Id,
    pub attributes: BTreeMap<String, FieldType>,
}
