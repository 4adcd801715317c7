// Graph-Native Backend
//
// Realizes the connection contract as a property graph: labelled
// vertices carrying property maps, and labelled directed edges.
// Tabular operations map onto vertices whose label is the table name.
//
// Isolation model:
// - `begin` snapshots the committed graph
// - reads see the snapshot plus the connection's own writes
// - writes are logged and replayed on the shared graph at commit
// - a commit whose log no longer applies is rejected as a whole

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    check_identifier, Backend, Connection, EdgeHandle, EdgeRecord, Field, GraphOps, ResultSet,
    Row, Value, VertexHandle,
};
use crate::error::{CatalogError, Result};

/// A labelled vertex and its properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex {
    pub handle: VertexHandle,
    pub label: String,
    pub properties: BTreeMap<String, Value>,
}

/// Committed (or staged) contents of a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphState {
    vertices: BTreeMap<VertexHandle, Vertex>,
    edges: BTreeMap<EdgeHandle, EdgeRecord>,
}

/// On-disk shape of a graph file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphFile {
    vertices: Vec<Vertex>,
    edges: Vec<EdgeRecord>,
}

impl GraphState {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices_labelled<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a Vertex> {
        self.vertices.values().filter(move |v| v.label == label)
    }

    pub fn edges_labelled<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a EdgeRecord> {
        self.edges.values().filter(move |e| e.label == label)
    }

    fn matching(&self, label: Option<&str>, predicates: &[Field]) -> Vec<&Vertex> {
        self.vertices
            .values()
            .filter(|v| label.map_or(true, |l| v.label == l))
            .filter(|v| predicates.iter().all(|p| p.matches(&v.properties)))
            .collect()
    }

    fn apply(&mut self, op: &GraphOp) -> Result<()> {
        match op {
            GraphOp::AddVertex(vertex) => {
                self.vertices.insert(vertex.handle, vertex.clone());
            }
            GraphOp::AddEdge(edge) => {
                for endpoint in [edge.from, edge.to] {
                    if !self.vertices.contains_key(&endpoint) {
                        return Err(CatalogError::TransactionAborted(format!(
                            "edge `{}` endpoint was removed by a concurrent commit",
                            edge.label
                        )));
                    }
                }
                self.edges.insert(edge.handle, edge.clone());
            }
            GraphOp::RemoveVertices(handles) => {
                for handle in handles {
                    self.vertices.remove(handle);
                }
                self.edges
                    .retain(|_, e| !handles.contains(&e.from) && !handles.contains(&e.to));
            }
        }
        Ok(())
    }

    fn load(path: &Path) -> Result<Self> {
        let file: GraphFile = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(Self {
            vertices: file.vertices.into_iter().map(|v| (v.handle, v)).collect(),
            edges: file.edges.into_iter().map(|e| (e.handle, e)).collect(),
        })
    }

    /// Write via a temp file and rename, so readers never see half a graph.
    fn persist(&self, path: &Path) -> Result<()> {
        let file = GraphFile {
            vertices: self.vertices.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&file)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// A staged mutation, replayed at commit.
#[derive(Debug, Clone)]
enum GraphOp {
    AddVertex(Vertex),
    AddEdge(EdgeRecord),
    RemoveVertices(Vec<VertexHandle>),
}

/// Property-graph store, in memory or backed by a JSON file.
pub struct GraphBackend {
    state: RwLock<GraphState>,
    path: Option<PathBuf>,
}

impl GraphBackend {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            path: None,
        }
    }

    /// Open a graph file, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            GraphState::load(&path)?
        } else {
            GraphState::default()
        };
        debug!(path = %path.display(), vertices = state.vertex_count(), "opened graph backend");
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    /// Copy of the committed graph.
    pub fn snapshot(&self) -> GraphState {
        self.state.read().clone()
    }
}

impl Backend for GraphBackend {
    type Connection<'a> = GraphConnection<'a> where Self: 'a;

    fn begin(&self) -> Result<GraphConnection<'_>> {
        Ok(GraphConnection {
            backend: self,
            staged: self.snapshot(),
            ops: Vec::new(),
            finished: false,
        })
    }
}

/// One pending graph transaction.
pub struct GraphConnection<'a> {
    backend: &'a GraphBackend,
    staged: GraphState,
    ops: Vec<GraphOp>,
    finished: bool,
}

impl GraphConnection<'_> {
    fn stage(&mut self, op: GraphOp) -> Result<()> {
        self.staged.apply(&op)?;
        self.ops.push(op);
        Ok(())
    }
}

impl Connection for GraphConnection<'_> {
    fn select(&mut self, table: &str, predicates: &[Field]) -> Result<ResultSet> {
        check_identifier(table)?;
        check_fields(predicates)?;
        let rows = self
            .staged
            .matching(Some(table), predicates)
            .into_iter()
            .map(|v| Row::new(v.properties.clone()))
            .collect();
        ResultSet::from_rows(table, rows)
    }

    fn insert(&mut self, table: &str, fields: &[Field]) -> Result<()> {
        self.add_vertex(table, fields).map(|_| ())
    }

    fn delete(&mut self, table: &str, predicates: &[Field]) -> Result<()> {
        check_identifier(table)?;
        check_fields(predicates)?;
        if predicates.is_empty() {
            return Err(CatalogError::InvalidArgument(format!(
                "delete from `{table}` without predicates"
            )));
        }

        let handles: Vec<VertexHandle> = self
            .staged
            .matching(Some(table), predicates)
            .into_iter()
            .map(|v| v.handle)
            .collect();
        if handles.is_empty() {
            return Ok(());
        }
        debug!(table, count = handles.len(), "removing vertices");
        self.stage(GraphOp::RemoveVertices(handles))
    }

    fn graph(&mut self) -> Option<&mut dyn GraphOps> {
        Some(self)
    }

    fn commit(mut self) -> Result<()> {
        self.finished = true;
        if self.ops.is_empty() {
            return Ok(());
        }

        let mut shared = self.backend.state.write();
        let mut next = shared.clone();
        for op in &self.ops {
            next.apply(op)?;
        }
        if let Some(path) = &self.backend.path {
            next.persist(path)?;
        }
        *shared = next;
        debug!(ops = self.ops.len(), "graph transaction committed");
        Ok(())
    }

    fn abort(mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

impl GraphOps for GraphConnection<'_> {
    fn add_vertex(&mut self, label: &str, fields: &[Field]) -> Result<VertexHandle> {
        check_identifier(label)?;
        check_fields(fields)?;
        let vertex = Vertex {
            handle: VertexHandle(Uuid::new_v4()),
            label: label.to_owned(),
            properties: Row::from_fields(fields).values().clone(),
        };
        let handle = vertex.handle;
        self.stage(GraphOp::AddVertex(vertex))?;
        Ok(handle)
    }

    fn get_vertex(&mut self, predicates: &[Field]) -> Result<VertexHandle> {
        check_fields(predicates)?;
        match self.staged.matching(None, predicates).as_slice() {
            [vertex] => Ok(vertex.handle),
            [] => Err(CatalogError::NotFound(format!(
                "vertex with {}",
                describe(predicates)
            ))),
            many => Err(CatalogError::BackendFailure(format!(
                "{} vertices match {}",
                many.len(),
                describe(predicates)
            ))),
        }
    }

    fn add_edge(
        &mut self,
        label: &str,
        from: VertexHandle,
        to: VertexHandle,
        fields: &[Field],
    ) -> Result<EdgeHandle> {
        check_identifier(label)?;
        check_fields(fields)?;
        for endpoint in [from, to] {
            if !self.staged.vertices.contains_key(&endpoint) {
                return Err(CatalogError::NotFound(format!(
                    "edge `{label}` endpoint vertex {:?}",
                    endpoint
                )));
            }
        }

        let edge = EdgeRecord {
            handle: EdgeHandle(Uuid::new_v4()),
            label: label.to_owned(),
            from,
            to,
            properties: Row::from_fields(fields).values().clone(),
        };
        let handle = edge.handle;
        self.stage(GraphOp::AddEdge(edge))?;
        Ok(handle)
    }

    fn edges(&mut self, label: &str) -> Result<Vec<EdgeRecord>> {
        check_identifier(label)?;
        Ok(self.staged.edges_labelled(label).cloned().collect())
    }
}

impl Drop for GraphConnection<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.ops.is_empty() {
            warn!(
                ops = self.ops.len(),
                "graph connection dropped without commit or abort, discarding writes"
            );
        }
    }
}

fn check_fields(fields: &[Field]) -> Result<()> {
    fields.iter().try_for_each(|f| check_identifier(f.name()))
}

fn describe(predicates: &[Field]) -> String {
    predicates
        .iter()
        .map(|p| format!("{} = {:?}", p.name(), p.value()))
        .collect::<Vec<_>>()
        .join(" and ")
}
