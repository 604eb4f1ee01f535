//! Audit Tree CLI
//!
//! Imports version audit logs into a document's shared history tree, removes
//! them again, and inspects or re-verifies what is stored.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use audit_tree::audit::entry::short_hash;
use audit_tree::audit::{AuditLogService, IntegrityLevel, VersionTree};
use audit_tree::config::AppConfig;
use audit_tree::database::queries::Queries;

#[derive(Parser)]
#[command(name = "audit-tree")]
#[command(about = "Import and maintain hash-chained document audit logs")]
struct Cli {
    /// Configuration file (defaults to ./audit-tree.{toml,yaml,json} when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured integrity level (warn_only, hash_required, strict)
    #[arg(short, long, global = true)]
    integrity_level: Option<IntegrityLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import the audit log of a document version
    Import {
        /// Document GUID shared by all versions of the document
        #[arg(short, long)]
        document: Option<Uuid>,

        /// Version (run) id
        #[arg(short, long)]
        version: i64,

        /// Audit log file (JSON lines)
        #[arg(short, long)]
        log: Option<PathBuf>,
    },
    /// Delete the audit log of a document version
    Delete {
        #[arg(short, long)]
        version: i64,
    },
    /// Show the version tree of a document
    Tree {
        #[arg(short, long)]
        document: Uuid,

        /// Write the history of this version to --export
        #[arg(short, long, requires = "export")]
        version: Option<i64>,

        #[arg(short, long)]
        export: Option<PathBuf>,
    },
    /// Re-verify the stored history of a version
    Verify {
        #[arg(short, long)]
        version: i64,
    },
    /// Register a version with its document ahead of import
    Register {
        #[arg(short, long)]
        document: Uuid,

        #[arg(short, long)]
        version: i64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_tree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => AppConfig::load().context("Failed to load configuration")?,
    };
    if let Some(level) = cli.integrity_level {
        config.integrity_level = level.as_str().to_string();
    }

    let service = AuditLogService::from_config(&config).await?;
    info!("Using audit log database {}", config.database_url);

    match cli.command {
        Commands::Import { document, version, log } => {
            let report = service
                .import_log_with_report(document, version, log.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Delete { version } => {
            let removed = service.delete_version_log(version).await?;
            println!("Removed {} audit log entries of version {}", removed, version);
        }
        Commands::Tree { document, version, export } => {
            let tree = service.build_tree(document).await?;
            print_tree(&tree);

            let mut conn = service.database().pool().acquire().await?;
            for registered in Queries::list_versions(&mut conn, &document).await? {
                println!(
                    "version {} ({}){}",
                    registered.version_id,
                    registered.status.as_str(),
                    registered
                        .root_digest
                        .map(|digest| format!(" root {}", short_hash(&digest)))
                        .unwrap_or_default()
                );
            }
            drop(conn);

            if let (Some(version), Some(path)) = (version, export) {
                let root = service.export_version_log(version, &path).await?;
                println!("Exported version {} to {} (root {})", version, path.display(), root);
            }
        }
        Commands::Verify { version } => {
            let result = service.verify_version(version).await?;
            println!("{}", result.summary());
            if !result.is_valid() {
                return Err(anyhow!("Stored audit log of version {} is invalid", version));
            }
        }
        Commands::Register { document, version } => {
            service.register_version(document, version).await?;
            println!("Registered version {} for document {}", version, document);
        }
    }

    service.database().close().await;
    Ok(())
}

fn print_tree(tree: &VersionTree) {
    println!(
        "Document {}: {} nodes, {} versions, {} shared entries",
        tree.document_guid(),
        tree.tree_size(),
        tree.version_count(),
        tree.shared_entry_count()
    );
    for id in tree.walk().into_iter().skip(1) {
        let node = tree.node(id);
        let versions = if node.versions().is_empty() {
            String::new()
        } else {
            format!(
                "  <- {}",
                node.versions()
                    .iter()
                    .map(|v| format!("v{}", v))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        println!(
            "{}{}{}",
            "  ".repeat(node.depth),
            short_hash(&node.entry_hash),
            versions
        );
    }
}
