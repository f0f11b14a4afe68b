#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use strata_storage::changelog::ChangeLogger;
use strata_storage::{ListOptions, Query, SortDir, Storage, StorageError, StrataConfig, connect};
use tracing_subscriber::EnvFilter;

/// Strata Inspect - read and maintain raw records in a storage backend
#[derive(Parser)]
#[command(name = "strata-inspect")]
#[command(about = "Read and maintain raw records in a Strata storage backend")]
#[command(version)]
struct Cli {
    /// Path to configuration file (YAML); `STRATA__*` variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print one record
    Get { kind: String, id: String },
    /// Print matching records, one JSON object per line
    List {
        kind: String,
        /// Query in its JSON wire form, e.g. '{"path":"active","value":true}'
        #[arg(long)]
        query: Option<String>,
        /// Dotted path to order by
        #[arg(long)]
        order_by: Option<String>,
        /// Order descending
        #[arg(long)]
        desc: bool,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Count matching records
    Count {
        kind: String,
        #[arg(long)]
        query: Option<String>,
    },
    /// Delete one record
    Delete { kind: String, id: String },
    /// Validate configuration and connect to every configured backend
    Check,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_query(query: Option<&str>) -> Result<Option<Query>> {
    query
        .map(|q| serde_json::from_str(q).context("invalid --query"))
        .transpose()
}

fn list_options(
    query: Option<&str>,
    order_by: Option<String>,
    desc: bool,
    offset: usize,
    limit: Option<usize>,
) -> Result<ListOptions> {
    let mut options = ListOptions::new().with_offset(offset);
    if let Some(query) = parse_query(query)? {
        options = options.with_query(query);
    }
    if let Some(path) = order_by {
        let direction = if desc { SortDir::Desc } else { SortDir::Asc };
        options = options.with_order_by(path, direction);
    }
    if let Some(limit) = limit {
        options = options.with_limit(limit);
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = StrataConfig::load(cli.config.as_deref())?;
    tracing::info!(backend = config.storage.backend_name(), "configuration loaded");

    if matches!(cli.command, Commands::Check) {
        return check(&config).await;
    }

    let storage = connect(&config.storage)?;
    storage.init().await?;
    let logger = config
        .change_log
        .as_ref()
        .map(ChangeLogger::from_config)
        .transpose()?
        .filter(ChangeLogger::is_enabled);
    if let Some(logger) = &logger {
        logger.init().await?;
    }

    let target = command_storage(&storage, logger.as_ref());
    let outcome = run(&target, cli.command).await;
    if let Some(logger) = &logger {
        logger.dispose().await?;
    }
    storage.dispose().await?;
    outcome
}

/// The primary storage, recording its writes when a change log is active.
fn command_storage(storage: &Storage, logger: Option<&ChangeLogger>) -> Storage {
    logger.map_or_else(
        || storage.clone(),
        |logger| logger.wrap(storage, Some(json!({ "source": "strata-inspect" }))),
    )
}

async fn run(storage: &Storage, command: Commands) -> Result<()> {
    let backend = storage.backend();
    match command {
        Commands::Get { kind, id } => {
            let raw = backend
                .get_raw(&kind, &id)
                .await?
                .ok_or_else(|| StorageError::not_found(&kind, &id))?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(raw))?);
        }
        Commands::List {
            kind,
            query,
            order_by,
            desc,
            offset,
            limit,
        } => {
            let options = list_options(query.as_deref(), order_by, desc, offset, limit)?;
            for record in backend.list_raw(&kind, &options).await? {
                println!("{}", json!({ "id": record.id, "data": record.raw }));
            }
        }
        Commands::Count { kind, query } => {
            let query = parse_query(query.as_deref())?;
            println!("{}", backend.count(&kind, query.as_ref()).await?);
        }
        Commands::Delete { kind, id } => {
            backend.delete_raw(&kind, &id).await?;
            tracing::info!(kind = %kind, id = %id, "record deleted");
        }
        Commands::Check => {}
    }
    Ok(())
}

async fn check(config: &StrataConfig) -> Result<()> {
    let storage = connect(&config.storage)?;
    storage
        .init()
        .await
        .with_context(|| format!("{} backend is not reachable", storage.name()))?;
    println!("storage: {} backend is reachable", storage.name());
    storage.dispose().await?;

    if let Some(section) = &config.change_log {
        let logger = ChangeLogger::from_config(section)?;
        logger
            .init()
            .await
            .context("change log backend is not reachable")?;
        println!(
            "change log: {} backend is reachable (enabled: {})",
            section.storage.backend_name(),
            logger.is_enabled()
        );
        logger.dispose().await?;
    }
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_storage::{ChangeAction, ChangeLoggerConfig, MemoryBackend};

    #[test]
    fn test_list_arguments() {
        let cli = Cli::try_parse_from([
            "strata-inspect",
            "-vv",
            "list",
            "account",
            "--query",
            r#"{"path":"active","value":true}"#,
            "--order-by",
            "profile.age",
            "--desc",
            "--limit",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::List {
            kind,
            query,
            order_by,
            desc,
            offset,
            limit,
        } = cli.command
        else {
            panic!("expected list");
        };
        assert_eq!(kind, "account");

        let options = list_options(query.as_deref(), order_by, desc, offset, limit).unwrap();
        assert_eq!(options.query, Some(Query::eq("active", true)));
        assert_eq!(options.order_by.as_deref(), Some("profile.age"));
        assert_eq!(options.order_by_direction, SortDir::Desc);
        assert_eq!(options.offset, 0);
        assert_eq!(options.limit, Some(5));
    }

    #[test]
    fn test_invalid_query_is_reported() {
        let err = parse_query(Some("{not json")).unwrap_err();
        assert!(err.to_string().contains("invalid --query"));
    }

    fn get_account(id: &str) -> Commands {
        Commands::Get {
            kind: "account".to_owned(),
            id: id.to_owned(),
        }
    }

    fn delete_account(id: &str) -> Commands {
        Commands::Delete {
            kind: "account".to_owned(),
            id: id.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_delete_is_recorded_by_the_change_log() {
        let primary = Storage::new(MemoryBackend::new());
        let raw = json!({"name": "Ann"}).as_object().unwrap().clone();
        primary
            .backend()
            .save_raw("account", "a1", &raw)
            .await
            .unwrap();
        let logger = ChangeLogger::new(
            Storage::new(MemoryBackend::new()),
            ChangeLoggerConfig {
                enabled: true,
                exclude_kinds: Vec::new(),
            },
        );

        let storage = command_storage(&primary, Some(&logger));
        run(&storage, delete_account("a1")).await.unwrap();

        assert!(
            primary
                .backend()
                .get_raw("account", "a1")
                .await
                .unwrap()
                .is_none()
        );
        let entries = logger.list(&ListOptions::new()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, ChangeAction::Delete);
        assert_eq!(entries[0].object_id, "a1");
        assert_eq!(entries[0].before, Some(raw));
        assert_eq!(
            entries[0].context,
            Some(json!({"source": "strata-inspect"}))
        );
    }

    #[tokio::test]
    async fn test_without_change_log_commands_use_the_primary() {
        let primary = Storage::new(MemoryBackend::new());
        let storage = command_storage(&primary, None);
        assert!(Arc::ptr_eq(storage.backend(), primary.backend()));
    }

    #[tokio::test]
    async fn test_commands_against_memory_backend() {
        let storage = Storage::new(MemoryBackend::new());
        let raw = json!({"name": "Ann"}).as_object().unwrap().clone();
        storage
            .backend()
            .save_raw("account", "a1", &raw)
            .await
            .unwrap();

        run(&storage, get_account("a1")).await.unwrap();
        run(&storage, delete_account("a1")).await.unwrap();
        let err = run(&storage, get_account("a1")).await.unwrap_err();
        assert!(
            err.downcast_ref::<StorageError>()
                .is_some_and(StorageError::is_not_found)
        );
    }
}
