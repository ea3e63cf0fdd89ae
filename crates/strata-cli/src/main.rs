//! Strata CLI - trigger analytics table refreshes
//!
//! Usage:
//!   # Full refresh of every table
//!   strata refresh --config strata.yaml --metadata metadata.yaml
//!
//!   # Latest partitions only
//!   strata refresh --config strata.yaml --metadata metadata.yaml --latest
//!
//!   # Rebuild years from a date on, leaving older partitions alone
//!   strata refresh --config strata.yaml --metadata metadata.yaml --from-date 2023-01-01
//!
//!   # Show the tables and DDL a refresh would produce
//!   strata plan --config strata.yaml --metadata metadata.yaml

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use strata_analytics::prelude::*;
use strata_analytics::sql::SqlGenerator;
use strata_rdbc::postgres::PgConnectionFactory;
use strata_rdbc::{dialect_for, Connection, ConnectionPool, SqlDialect};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - analytics table materialization for tracker data")]
#[command(version)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info", env = "STRATA_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh analytics tables
    Refresh {
        #[command(flatten)]
        common: CommonArgs,

        /// Emit the report as compact JSON
        #[arg(long)]
        compact: bool,
    },

    /// Show the tables a refresh would build, without touching them
    Plan {
        #[command(flatten)]
        common: CommonArgs,

        /// Print the staging DDL of each table
        #[arg(long)]
        ddl: bool,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Engine configuration file
    #[arg(short, long, env = "STRATA_CONFIG", default_value = "strata.yaml")]
    config: PathBuf,

    /// Metadata file (.yaml, .yml or .json)
    #[arg(short, long, env = "STRATA_METADATA")]
    metadata: PathBuf,

    /// Update the latest partitions instead of rebuilding
    #[arg(long, conflicts_with = "from_date")]
    latest: bool,

    /// Only rebuild years from this date on (YYYY-MM-DD)
    #[arg(long)]
    from_date: Option<NaiveDate>,

    /// Run start time (YYYY-MM-DDTHH:MM:SS), defaults to now
    #[arg(long)]
    start_time: Option<NaiveDateTime>,

    /// Subject UIDs to skip
    #[arg(long = "skip-subject", value_delimiter = ',')]
    skip_subjects: Vec<String>,

    /// Table families to skip (event, enrollment)
    #[arg(long = "skip-table-type", value_delimiter = ',', value_parser = parse_table_type)]
    skip_table_types: Vec<TableType>,

    /// Warn when a staged table holds fewer rows than this
    #[arg(long)]
    min_rows: Option<u64>,
}

impl CommonArgs {
    fn params(&self) -> RefreshParams {
        let mut params = if self.latest {
            RefreshParams::latest()
        } else {
            RefreshParams::full()
        };
        if let Some(from_date) = self.from_date {
            params = params.with_from_date(from_date);
        }
        if let Some(start_time) = self.start_time {
            params = params.with_start_time(start_time);
        }
        for uid in &self.skip_subjects {
            params = params.skip_subject(uid.clone());
        }
        for table_type in &self.skip_table_types {
            params = params.skip_table_type(*table_type);
        }
        params
    }
}

fn parse_table_type(value: &str) -> std::result::Result<TableType, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "event" => Ok(TableType::Event),
        "enrollment" => Ok(TableType::Enrollment),
        other => Err(format!(
            "unknown table type '{}', allowed options: event,enrollment",
            other
        )),
    }
}

/// Everything a command needs from the environment
struct Runtime {
    orchestrator: RefreshOrchestrator,
    dialect: Arc<dyn SqlDialect>,
    pool: Arc<ConnectionPool>,
}

async fn connect(args: &CommonArgs, refreshing: bool) -> anyhow::Result<Runtime> {
    let config = Arc::new(
        AnalyticsConfig::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?,
    );
    let metadata = StaticMetadata::from_file(&args.metadata)
        .with_context(|| format!("loading {}", args.metadata.display()))?;
    let dialect: Arc<dyn SqlDialect> = Arc::from(dialect_for(config.database.database_type()?)?);

    let pool = Arc::new(
        ConnectionPool::new(config.database.pool_config(), Arc::new(PgConnectionFactory))
            .await
            .context("connecting to the analytics database")?,
    );
    let connection: Arc<dyn Connection> = pool.clone();

    let orchestrator = wire(
        args,
        config,
        metadata,
        connection,
        Arc::clone(&dialect),
        refreshing,
    )
    .await?;

    Ok(Runtime {
        orchestrator,
        dialect,
        pool,
    })
}

/// Build the orchestrator over `connection`. Only `refreshing` commands
/// create the watermark table; `plan` never writes.
async fn wire(
    args: &CommonArgs,
    config: Arc<AnalyticsConfig>,
    metadata: StaticMetadata,
    connection: Arc<dyn Connection>,
    dialect: Arc<dyn SqlDialect>,
    refreshing: bool,
) -> anyhow::Result<RefreshOrchestrator> {
    let watermarks = SqlWatermarkStore::new(Arc::clone(&connection), dialect);
    if refreshing {
        watermarks.ensure_table().await?;
    }

    let hooks: Vec<Arc<dyn TableHook>> = args
        .min_rows
        .map(|min| Arc::new(RowCountHook::new(min)) as Arc<dyn TableHook>)
        .into_iter()
        .collect();

    Ok(RefreshOrchestrator::new(OrchestratorDeps {
        config,
        connection,
        metadata: Arc::new(metadata),
        watermarks: Arc::new(watermarks),
        hooks,
        locks: TableLockRegistry::new(),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Refresh { common, compact } => {
            let runtime = connect(&common, true).await?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Received Ctrl+C, cancelling refresh");
                    on_signal.cancel();
                }
            });

            let result = runtime.orchestrator.run(common.params(), cancel).await;
            if let Err(e) = runtime.pool.shutdown().await {
                tracing::warn!("Failed to close connection pool: {}", e);
            }
            let report = result?;

            let json = if compact {
                serde_json::to_string(&report)?
            } else {
                report.to_json()?
            };
            println!("{}", json);

            if report.status == RunStatus::Failed {
                std::process::exit(2);
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Plan { common, ddl } => {
            let runtime = connect(&common, false).await?;
            let tables = runtime.orchestrator.plan(common.params()).await;
            runtime.pool.shutdown().await?;
            let tables = tables?;

            let sql = SqlGenerator::new(runtime.dialect.as_ref(), "plan");
            for table in &tables {
                println!(
                    "{} ({} columns, subject '{}')",
                    table.name(),
                    table.columns.len(),
                    table.subject.name
                );
                if ddl {
                    println!("  {};", sql.create_staging_table(table));
                    for index in sql.create_indexes(table, &table.staging_name()) {
                        println!("  {};", index);
                    }
                }
            }
            println!("{} table(s)", tables.len());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_rdbc::testing::MockConnection;
    use strata_rdbc::PostgresDialect;

    const METADATA: &str = r#"
programs:
  - { id: 7, uid: IpHINAT79UW, name: Child Programme }
"#;

    fn common(args: &[&str]) -> CommonArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Refresh { common, .. } | Commands::Plan { common, .. } => common,
        }
    }

    async fn wired(args: &[&str], refreshing: bool) -> (MockConnection, RefreshOrchestrator) {
        let mock = MockConnection::new();
        let config =
            AnalyticsConfig::from_yaml("database:\n  url: postgres://localhost/dhis2\n").unwrap();
        let orchestrator = wire(
            &common(args),
            Arc::new(config),
            StaticMetadata::from_yaml(METADATA).unwrap(),
            Arc::new(mock.clone()),
            Arc::new(PostgresDialect),
            refreshing,
        )
        .await
        .unwrap();
        (mock, orchestrator)
    }

    #[tokio::test]
    async fn test_plan_never_writes() {
        let (mock, orchestrator) =
            wired(&["strata", "plan", "--metadata", "metadata.yaml"], false).await;
        let tables = orchestrator.plan(RefreshParams::full()).await.unwrap();

        assert_eq!(tables.len(), 1);
        assert!(mock.statements().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_creates_watermark_table() {
        let (mock, _) = wired(&["strata", "refresh", "--metadata", "metadata.yaml"], true).await;

        let created = mock.statements_matching("create table if not exists");
        assert_eq!(created.len(), 1);
    }

    #[test]
    fn test_latest_conflicts_with_from_date() {
        let result = Cli::try_parse_from([
            "strata",
            "refresh",
            "--metadata",
            "metadata.yaml",
            "--latest",
            "--from-date",
            "2023-01-01",
        ]);
        assert!(result.is_err());
    }
}
