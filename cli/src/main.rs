use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use lineage_kernel::config::{BackendConfig, CatalogConfig, RetentionConfig};
use lineage_kernel::db::graph::GraphBackend;
use lineage_kernel::db::sqlite::SqliteBackend;
use lineage_kernel::db::{Backend, FieldType};
use lineage_kernel::id::{Id, UuidIdGenerator};
use lineage_kernel::models::{ItemKind, RichPayload};
use lineage_kernel::Catalog;

/// Version Lineage Catalog CLI
#[derive(Parser, Debug)]
#[command(name = "lineage")]
#[command(about = "Versioned metadata catalog with per-item lineage", long_about = None)]
struct Cli {
    /// Path to catalog config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the backend's database or graph file
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a node, edge or structure item
    CreateItem {
        kind: ItemKind,
        name: Option<String>,
        /// Use this id instead of minting one
        #[arg(long)]
        id: Option<String>,
    },
    /// Create a node version and link it into the node's lineage
    NodeVersion {
        node_id: String,
        #[arg(long)]
        parent: Option<String>,
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Create an edge version between two node versions
    EdgeVersion {
        edge_id: String,
        from: String,
        to: String,
        #[arg(long)]
        parent: Option<String>,
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Create a structure version with typed attributes
    StructureVersion {
        structure_id: String,
        /// Attribute as name=type (string, long, integer, boolean)
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, FieldType)>,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Link an existing version into its item's lineage
    Link {
        item_id: String,
        version_id: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Print an item's version history
    Dag { item_id: String },
    /// Print an item's newest versions
    Leaves { item_id: String },
    /// Print one successor edge
    Successor { id: String },
    /// Print one version of the given kind
    Version { kind: ItemKind, id: String },
    /// Delete versions older than the given number of levels
    Truncate {
        item_id: String,
        #[arg(long)]
        levels: Option<usize>,
    },
}

#[derive(clap::Args, Debug)]
struct PayloadArgs {
    /// Location of the versioned artifact
    #[arg(long)]
    reference: Option<String>,
    /// Tag as key=value
    #[arg(long = "tag", value_parser = parse_key_value)]
    tags: Vec<(String, String)>,
    /// Parameter as key=value
    #[arg(long = "param", value_parser = parse_key_value)]
    parameters: Vec<(String, String)>,
    /// Structure version describing the data
    #[arg(long)]
    structure_version: Option<String>,
}

impl PayloadArgs {
    fn into_payload(self) -> RichPayload {
        RichPayload {
            tags: self.tags.into_iter().collect(),
            reference: self.reference,
            parameters: self.parameters.into_iter().collect(),
            structure_version_id: self.structure_version.map(Id::from_raw),
        }
    }
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

fn parse_attribute(raw: &str) -> std::result::Result<(String, FieldType), String> {
    let (name, field_type) = parse_key_value(raw)?;
    let field_type = field_type.parse::<FieldType>().map_err(|e| e.to_string())?;
    Ok((name, field_type))
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    command: &'static str,
    result: serde_json::Value,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CatalogConfig::load(path)?,
        None => CatalogConfig::default_config(),
    };
    if let Some(path) = cli.db {
        config = config.with_path(path);
    }
    debug!(?config, "loaded configuration");

    let ids = UuidIdGenerator::new(config.id_prefix.clone());
    let output = match config.backend.clone() {
        BackendConfig::Sqlite { path } => {
            let catalog = Catalog::new(SqliteBackend::open(path)?, ids);
            run(&catalog, cli.command, &config.retention)?
        }
        BackendConfig::Graph { path } => {
            let backend = match path {
                Some(path) => GraphBackend::open(path)?,
                None => GraphBackend::in_memory(),
            };
            let catalog = Catalog::new(backend, ids);
            run(&catalog, cli.command, &config.retention)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

fn run<B: Backend>(
    catalog: &Catalog<B>,
    command: Command,
    retention: &RetentionConfig,
) -> Result<CliOutput> {
    let (name, result) = match command {
        Command::CreateItem { kind, name, id } => {
            let item = match id {
                Some(id) => catalog.register_item(kind, Id::from_raw(id), name.as_deref())?,
                None => catalog.create_item(kind, name.as_deref())?,
            };
            ("create-item", serde_json::to_value(item)?)
        }
        Command::NodeVersion {
            node_id,
            parent,
            payload,
        } => {
            let parent = parent.map(Id::from_raw);
            let version = catalog.create_node_version(
                &Id::from_raw(node_id),
                payload.into_payload(),
                parent.as_ref(),
            )?;
            ("node-version", serde_json::to_value(version)?)
        }
        Command::EdgeVersion {
            edge_id,
            from,
            to,
            parent,
            payload,
        } => {
            let parent = parent.map(Id::from_raw);
            let version = catalog.create_edge_version(
                &Id::from_raw(edge_id),
                &Id::from_raw(from),
                &Id::from_raw(to),
                payload.into_payload(),
                parent.as_ref(),
            )?;
            ("edge-version", serde_json::to_value(version)?)
        }
        Command::StructureVersion {
            structure_id,
            attributes,
            parent,
        } => {
            let parent = parent.map(Id::from_raw);
            let attributes: BTreeMap<String, FieldType> = attributes.into_iter().collect();
            let version = catalog.create_structure_version(
                &Id::from_raw(structure_id),
                attributes,
                parent.as_ref(),
            )?;
            ("structure-version", serde_json::to_value(version)?)
        }
        Command::Link {
            item_id,
            version_id,
            parent,
        } => {
            let parent = parent.map(Id::from_raw);
            let successor = catalog.link_version(
                &Id::from_raw(item_id),
                &Id::from_raw(version_id),
                parent.as_ref(),
            )?;
            ("link", serde_json::json!({ "successor_id": successor }))
        }
        Command::Dag { item_id } => {
            let dag = catalog.get_dag(&Id::from_raw(item_id))?;
            ("dag", serde_json::to_value(dag)?)
        }
        Command::Leaves { item_id } => {
            let leaves = catalog.get_leaves(&Id::from_raw(item_id))?;
            ("leaves", serde_json::to_value(leaves)?)
        }
        Command::Successor { id } => {
            let successor = catalog.get_successor(&Id::from_raw(id))?;
            ("successor", serde_json::to_value(successor)?)
        }
        Command::Version { kind, id } => {
            let id = Id::from_raw(id);
            let version = match kind {
                ItemKind::Node => serde_json::to_value(catalog.get_node_version(&id)?)?,
                ItemKind::Edge => serde_json::to_value(catalog.get_edge_version(&id)?)?,
                ItemKind::Structure => serde_json::to_value(catalog.get_structure_version(&id)?)?,
            };
            ("version", version)
        }
        Command::Truncate { item_id, levels } => {
            let levels = levels.unwrap_or(retention.default_levels);
            let report = catalog.truncate(&Id::from_raw(item_id), levels)?;
            ("truncate", serde_json::to_value(report)?)
        }
    };

    Ok(CliOutput {
        command: name,
        result,
    })
}
