// Backend Connection Contract
//
// Defines the transactional unit of work every storage backend
// provides to the catalog, and the typed `(field, type, value)`
// triples used to express rows and equality predicates.
//
// Implementations:
// - `sqlite`: tabular, rows in fixed tables
// - `graph`: property graph, labelled vertices and edges

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::error::{CatalogError, Result};
use crate::id::Id;

pub mod graph;
pub mod sqlite;

/// Table (tabular) and label (graph) names shared by both backends.
pub mod tables {
    pub const ITEM: &str = "item";
    pub const NODE_VERSION: &str = "node_version";
    pub const EDGE_VERSION: &str = "edge_version";
    pub const STRUCTURE_VERSION: &str = "structure_version";
    pub const STRUCTURE_VERSION_ATTRIBUTE: &str = "structure_version_attribute";
    pub const RICH_VERSION: &str = "rich_version";
    pub const VERSION_SUCCESSOR: &str = "version_successor";
    pub const VERSION_HISTORY_DAG: &str = "version_history_dag";

    /// Graph edge label of a lineage step between two versions.
    pub const SUCCESSOR_EDGE: &str = "VersionSuccessor";
    /// Graph edge label linking an edge version to its endpoints.
    pub const ENDPOINT_EDGE: &str = "EdgeVersionConnection";
}

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Long,
    Integer,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Long => "long",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FieldType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(FieldType::String),
            "long" => Ok(FieldType::Long),
            "integer" => Ok(FieldType::Integer),
            "boolean" => Ok(FieldType::Boolean),
            other => Err(CatalogError::InvalidArgument(format!(
                "unknown field type `{other}`"
            ))),
        }
    }
}

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Long(i64),
    Integer(i32),
    Boolean(bool),
    Null,
}

impl Value {
    /// Whether this value may be stored under the given declared type.
    pub fn conforms_to(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (Value::Null, _)
                | (Value::String(_), FieldType::String)
                | (Value::Long(_), FieldType::Long)
                | (Value::Integer(_), FieldType::Integer)
                | (Value::Boolean(_), FieldType::Boolean)
        )
    }
}

/// A `(field, type, value)` triple.
///
/// Used both as a column assignment on insert and as an equality
/// predicate on select and delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    field_type: FieldType,
    value: Value,
}

impl Field {
    /// Build a field, rejecting malformed names and mistyped values.
    pub fn new(name: impl Into<String>, field_type: FieldType, value: Value) -> Result<Self> {
        let name = name.into();
        check_identifier(&name)?;
        if !value.conforms_to(field_type) {
            return Err(CatalogError::InvalidArgument(format!(
                "malformed predicate: field `{name}` declared {field_type} but holds {value:?}"
            )));
        }
        Ok(Self {
            name,
            field_type,
            value,
        })
    }

    pub fn string(name: &str, value: impl Into<String>) -> Self {
        Self::typed(name, FieldType::String, Value::String(value.into()))
    }

    pub fn id(name: &str, id: &Id) -> Self {
        Self::string(name, id.as_str())
    }

    pub fn opt_string(name: &str, value: Option<&str>) -> Self {
        let value = value.map_or(Value::Null, |v| Value::String(v.to_owned()));
        Self::typed(name, FieldType::String, value)
    }

    pub fn long(name: &str, value: i64) -> Self {
        Self::typed(name, FieldType::Long, Value::Long(value))
    }

    pub fn boolean(name: &str, value: bool) -> Self {
        Self::typed(name, FieldType::Boolean, Value::Boolean(value))
    }

    // Names are validated again by each backend before use.
    fn typed(name: &str, field_type: FieldType, value: Value) -> Self {
        Self {
            name: name.to_owned(),
            field_type,
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Evaluate this field as an equality predicate over a property map.
    pub fn matches(&self, properties: &BTreeMap<String, Value>) -> bool {
        match (properties.get(&self.name), &self.value) {
            (None, Value::Null) => true,
            (Some(actual), expected) => actual == expected,
            (None, _) => false,
        }
    }
}

/// Reject table, label and field names that are not plain identifiers.
pub fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(CatalogError::InvalidArgument(format!(
            "malformed identifier `{name}`"
        )))
    }
}

/// One row (tabular) or vertex property map (graph).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn from_fields(fields: &[Field]) -> Self {
        let values = fields
            .iter()
            .map(|f| (f.name.clone(), f.value.clone()))
            .collect();
        Self { values }
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn get_opt_string(&self, field: &str) -> Result<Option<String>> {
        match self.values.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(column_shape(field, "string", other)),
        }
    }

    pub fn get_string(&self, field: &str) -> Result<String> {
        self.get_opt_string(field)?
            .ok_or_else(|| missing_column(field))
    }

    pub fn get_id(&self, field: &str) -> Result<Id> {
        self.get_string(field).map(Id::from_raw)
    }

    pub fn get_long(&self, field: &str) -> Result<i64> {
        match self.values.get(field) {
            Some(Value::Long(n)) => Ok(*n),
            Some(Value::Integer(n)) => Ok(i64::from(*n)),
            Some(other) => Err(column_shape(field, "long", other)),
            None => Err(missing_column(field)),
        }
    }

    /// Booleans come back from tabular stores as 0/1 integers.
    pub fn get_bool(&self, field: &str) -> Result<bool> {
        match self.values.get(field) {
            Some(Value::Boolean(b)) => Ok(*b),
            Some(Value::Long(n)) => Ok(*n != 0),
            Some(Value::Integer(n)) => Ok(*n != 0),
            Some(other) => Err(column_shape(field, "boolean", other)),
            None => Err(missing_column(field)),
        }
    }
}

fn missing_column(field: &str) -> CatalogError {
    CatalogError::BackendFailure(format!("column `{field}` missing from row"))
}

fn column_shape(field: &str, expected: &str, actual: &Value) -> CatalogError {
    CatalogError::BackendFailure(format!(
        "column `{field}` expected {expected}, found {actual:?}"
    ))
}

/// Non-empty set of rows returned by a predicate select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSet {
    rows: Vec<Row>,
}

impl ResultSet {
    /// Wrap selected rows; an empty selection is `EmptyResult`.
    pub fn from_rows(table: &str, rows: Vec<Row>) -> Result<Self> {
        if rows.is_empty() {
            return Err(CatalogError::EmptyResult {
                table: table.to_owned(),
            });
        }
        Ok(Self { rows })
    }

    pub fn first(&self) -> &Row {
        &self.rows[0]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Handle to a vertex of a graph-native backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexHandle(pub(crate) Uuid);

/// Handle to an edge of a graph-native backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeHandle(pub(crate) Uuid);

/// A graph edge as visible to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub handle: EdgeHandle,
    pub label: String,
    pub from: VertexHandle,
    pub to: VertexHandle,
    pub properties: BTreeMap<String, Value>,
}

/// A storage backend the catalog can run against.
///
/// Properties required from implementations:
/// - Writes on one connection are invisible to others until commit
/// - Abort restores the state observed at `begin`
/// - A dropped, unfinished connection behaves like `abort`
pub trait Backend: Send + Sync {
    type Connection<'a>: Connection
    where
        Self: 'a;

    /// Acquire a new scoped connection with its own pending transaction.
    fn begin(&self) -> Result<Self::Connection<'_>>;
}

/// A scoped, transactional unit of work.
///
/// Exactly one of `commit` or `abort` finalizes a connection. Both
/// consume it, so a finalized connection cannot be reused.
pub trait Connection {
    /// Rows matching the AND of all predicates.
    ///
    /// Fails with `EmptyResult` when nothing matches.
    fn select(&mut self, table: &str, predicates: &[Field]) -> Result<ResultSet>;

    fn insert(&mut self, table: &str, fields: &[Field]) -> Result<()>;

    /// Delete every row matching the AND of all predicates.
    ///
    /// Deleting nothing is not an error.
    fn delete(&mut self, table: &str, predicates: &[Field]) -> Result<()>;

    /// Graph primitives, for backends that have them.
    fn graph(&mut self) -> Option<&mut dyn GraphOps> {
        None
    }

    fn commit(self) -> Result<()>
    where
        Self: Sized;

    fn abort(self) -> Result<()>
    where
        Self: Sized;
}

/// First-class vertex and edge primitives of graph-native backends.
pub trait GraphOps {
    fn add_vertex(&mut self, label: &str, fields: &[Field]) -> Result<VertexHandle>;

    /// The single vertex matching all predicates, across labels.
    ///
    /// Fails with `NotFound` when no vertex matches.
    fn get_vertex(&mut self, predicates: &[Field]) -> Result<VertexHandle>;

    fn add_edge(
        &mut self,
        label: &str,
        from: VertexHandle,
        to: VertexHandle,
        fields: &[Field],
    ) -> Result<EdgeHandle>;

    /// All edges carrying `label`.
    fn edges(&mut self, label: &str) -> Result<Vec<EdgeRecord>>;
}

/// Run `f` inside one connection.
///
/// Commits when `f` succeeds. When `f` fails the connection is
/// aborted and the original error is returned unchanged.
pub fn transaction<'b, B, T, F>(backend: &'b B, f: F) -> Result<T>
where
    B: Backend,
    F: FnOnce(&mut B::Connection<'b>) -> Result<T>,
{
    let mut conn = backend.begin()?;
    match f(&mut conn) {
        Ok(value) => {
            conn.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(abort_err) = conn.abort() {
                warn!(error = %abort_err, "abort after failed unit of work also failed");
            }
            Err(err)
        }
    }
}
