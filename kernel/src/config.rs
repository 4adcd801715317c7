// Catalog Configuration
//
// Which backend to open, how ids are minted and how much history
// retention keeps by default. Loaded from JSON; every section but the
// backend may be omitted.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub backend: BackendConfig,
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Tabular backend in a SQLite database file.
    Sqlite { path: PathBuf },
    /// Graph backend, persisted as JSON when a path is given.
    Graph {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Levels kept by `truncate` when the caller names none.
    pub default_levels: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { default_levels: 10 }
    }
}

fn default_id_prefix() -> String {
    "lineage".into()
}

impl CatalogConfig {
    /// Built-in configuration (used if no config is provided).
    pub fn default_config() -> Self {
        Self {
            backend: BackendConfig::Sqlite {
                path: PathBuf::from("lineage.db"),
            },
            id_prefix: default_id_prefix(),
            retention: RetentionConfig::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Point the configured backend at a different file.
    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.backend = match self.backend {
            BackendConfig::Sqlite { .. } => BackendConfig::Sqlite { path },
            BackendConfig::Graph { .. } => BackendConfig::Graph { path: Some(path) },
        };
        self
    }

    fn validate(&self) -> Result<()> {
        if self.retention.default_levels == 0 {
            return Err(CatalogError::InvalidArgument(
                "retention.default_levels must be at least 1".into(),
            ));
        }
        if self.id_prefix.is_empty() || self.id_prefix.contains(char::is_whitespace) {
            return Err(CatalogError::InvalidArgument(format!(
                "id_prefix `{}` must be non-empty and contain no whitespace",
                self.id_prefix
            )));
        }
        Ok(())
    }
}
