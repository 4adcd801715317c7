// Catalog Errors
//
// One error type for every layer of the kernel. `EmptyResult` is an
// expected outcome of predicate selects and is usually recovered by
// the caller; everything else is surfaced unchanged.

/// Errors produced by the catalog kernel.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// A referenced identifier does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A predicate select matched nothing.
    #[error("no rows in `{table}` matched the predicates")]
    EmptyResult { table: String },

    /// Self successor, malformed predicate, bad table name, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport or storage-layer fault.
    #[error("backend failure: {0}")]
    BackendFailure(String),

    /// The backend rolled the transaction back on its own.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("backend failure: sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("backend failure: json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend failure: io: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    pub fn is_empty_result(&self) -> bool {
        matches!(self, CatalogError::EmptyResult { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, CatalogError::InvalidArgument(_))
    }

    /// Whether the failure originated in the storage layer.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            CatalogError::BackendFailure(_)
                | CatalogError::Sqlite(_)
                | CatalogError::Json(_)
                | CatalogError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
