//! xdb-migrate CLI - cross-vendor relational migration.

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use xdb_migrate::core::DialectAdapter;
use xdb_migrate::progress::EventKind;
use xdb_migrate::{
    BusMessage, Config, ConnectionRegistry, ConnectionRequest, JobOptions, JobRecord,
    JobRequest, JobStatus, JsonFileHistory, MigrateError, Orchestrator, ProgressBus,
    SchemaInspector,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Sample configuration written by `init`.
const SAMPLE_CONFIG: &str = r#"# xdb-migrate job file
source:
  type: mysql            # mysql | postgresql | oracle | sqlserver
  host: localhost
  database: shop
  user: migrator
  password: change-me

target:
  type: postgresql
  host: localhost
  database: warehouse
  user: migrator
  password: change-me
  schema: public

migration:
  tables: []             # empty = every table in the source schema
  create_tables: true
  truncate_tables: false
  include_indexes: true
  use_transactions: true
  batch_size: 1000
  acknowledge_warnings: false
  override_errors: false
  # workers: 4
  # max_retries: 3
  # history_file: migrations.jsonl
"#;

#[derive(Parser)]
#[command(name = "xdb-migrate")]
#[command(about = "Cross-vendor relational migration (MySQL, PostgreSQL, Oracle, SQL Server)")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for a cancelled job to stop (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    /// Print progress events as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Which configured endpoint a command talks to.
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Side {
    Source,
    Target,
}

impl Side {
    fn id(self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Target => "target",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration job
    Run {
        /// Tables to migrate (default: migration.tables, else every table)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override rows per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Clear existing destination tables first
        #[arg(long)]
        truncate: bool,

        /// Proceed despite warning-level compatibility issues
        #[arg(long)]
        acknowledge_warnings: bool,

        /// Proceed despite error-level compatibility issues
        #[arg(long)]
        override_errors: bool,
    },

    /// Test database connections
    HealthCheck,

    /// List databases on an endpoint
    Databases {
        #[arg(long, value_enum, default_value = "source")]
        side: Side,
    },

    /// Print the schema of an endpoint
    Inspect {
        #[arg(long, value_enum, default_value = "source")]
        side: Side,

        /// Schema to inspect (default: the endpoint schema)
        #[arg(long)]
        schema: Option<String>,

        /// Only these tables
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },

    /// Print the compatibility report between source and target
    Compare {
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },

    /// Print the load order without moving data
    Plan {
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },

    /// Print the first rows of a table
    Sample {
        /// Table name
        table: String,

        #[arg(long, value_enum, default_value = "source")]
        side: Side,

        /// Maximum rows to print
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Write a sample configuration file
    Init {
        /// Output path for configuration file [default: config.yaml]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Force overwrite existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    // Handle init command separately (doesn't need existing config)
    if let Commands::Init { output, force } = &cli.command {
        let output_path = output.clone().unwrap_or_else(|| PathBuf::from("config.yaml"));
        write_sample_config(&output_path, *force)?;
        println!("Wrote {}", output_path.display());
        return Ok(ExitCode::SUCCESS);
    }

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    let code = match &cli.command {
        Commands::Init { .. } => unreachable!(), // Handled above
        Commands::HealthCheck => health_check(&cli, &config).await?,
        Commands::Databases { side } => {
            let registry = open_registry(&config, &[*side]).await?;
            let names = registry.lease(side.id()).await?.list_databases().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                for name in &names {
                    println!("{}", name);
                }
            }
            registry.shutdown().await;
            ExitCode::SUCCESS
        }
        Commands::Inspect {
            side,
            schema,
            tables,
        } => {
            let registry = open_registry(&config, &[*side]).await?;
            let inspector = SchemaInspector::new(
                Arc::clone(&registry),
                config.migration.get_inspect_concurrency(),
            );
            let snapshot = if tables.is_empty() {
                inspector.inspect_schema(side.id(), schema.as_deref()).await?
            } else {
                let schema = match schema {
                    Some(s) => s.clone(),
                    None => registry.lease(side.id()).await?.default_schema().to_string(),
                };
                inspector
                    .inspect_tables(side.id(), &schema, tables, false)
                    .await?
            };
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                for table in snapshot.tables.values() {
                    println!("{} ({} columns)", table.full_name(), table.columns.len());
                    for col in &table.columns {
                        println!(
                            "  {:<30} {:<20} {:<24} {}{}",
                            col.name,
                            col.data_type,
                            col.canonical.to_string(),
                            if col.is_nullable { "NULL" } else { "NOT NULL" },
                            if col.is_primary_key { " PK" } else { "" }
                        );
                    }
                    for fk in &table.foreign_keys {
                        println!("  FK {} -> {}", fk.name, fk.ref_full_name());
                    }
                }
            }
            registry.shutdown().await;
            ExitCode::SUCCESS
        }
        Commands::Compare { tables } => {
            let registry = open_registry(&config, &[Side::Source, Side::Target]).await?;
            let inspector = SchemaInspector::new(
                Arc::clone(&registry),
                config.migration.get_inspect_concurrency(),
            );
            let tables = tables_or_configured(tables, &config);
            let (_, _, report) = inspector.compatibility("source", "target", &tables).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Compatibility Report:");
                println!("  Tables: {}", report.tables.len());
                println!("  Missing on target: {:?}", report.missing_tables);
                for issue in &report.issues {
                    println!("  {}", issue);
                }
            }
            registry.shutdown().await;
            let options = JobOptions::from(&config.migration);
            report.ensure_runnable(
                options.create_tables,
                options.acknowledge_warnings,
                options.override_errors,
            )?;
            let blocked = report.blocked_tables(options.override_errors);
            if !blocked.is_empty() {
                let names: Vec<&str> = blocked.keys().map(String::as_str).collect();
                return Err(MigrateError::IncompatibleSchema(format!(
                    "tables blocked by errors: {}",
                    names.join(", ")
                )));
            }
            ExitCode::SUCCESS
        }
        Commands::Plan { tables } => {
            let registry = open_registry(&config, &[Side::Source, Side::Target]).await?;
            let orchestrator = Orchestrator::from_config(Arc::clone(&registry), &config.migration);
            let request = JobRequest::new("source", "target")
                .tables(tables_or_configured(tables, &config))
                .options(JobOptions::from(&config.migration));
            let validated = orchestrator.validate(&request).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&validated.plan)?);
            } else {
                println!("Load order:");
                for (i, name) in validated.plan.order.iter().enumerate() {
                    let deps: Vec<&String> = validated.plan.dependencies_of(name).collect();
                    if deps.is_empty() {
                        println!("  {:>3}. {}", i + 1, name);
                    } else {
                        println!("  {:>3}. {} (after {:?})", i + 1, name, deps);
                    }
                }
                for (from, to) in &validated.plan.deferred_edges {
                    println!("  cycle: {} -> {} deferred", from, to);
                }
                for (name, reason) in &validated.blocked {
                    println!("  blocked: {} ({})", name, reason);
                }
            }
            registry.shutdown().await;
            ExitCode::SUCCESS
        }
        Commands::Sample { table, side, limit } => {
            let registry = open_registry(&config, &[*side]).await?;
            let lease = registry.lease(side.id()).await?;
            let schema = lease.default_schema().to_string();
            let def = lease.describe_table(&schema, table).await?;
            let rows = lease.sample_rows(&def, *limit).await?;
            drop(lease);

            if cli.output_json {
                let objects: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| {
                        let map: serde_json::Map<String, serde_json::Value> = def
                            .columns
                            .iter()
                            .zip(row)
                            .map(|(c, v)| (c.name.clone(), json!(v)))
                            .collect();
                        serde_json::Value::Object(map)
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&objects)?);
            } else {
                println!("{}", def.column_names().join("\t"));
                for row in &rows {
                    let cells: Vec<String> = row
                        .iter()
                        .map(|v| v.to_text().unwrap_or_else(|| "NULL".to_string()))
                        .collect();
                    println!("{}", cells.join("\t"));
                }
            }
            registry.shutdown().await;
            ExitCode::SUCCESS
        }
        Commands::Run {
            tables,
            workers,
            batch_size,
            truncate,
            acknowledge_warnings,
            override_errors,
        } => {
            let mut config = config.clone();
            if let Some(w) = workers {
                config.migration.workers = Some(*w);
            }
            if let Some(b) = batch_size {
                config.migration.batch_size = *b;
            }
            config.migration.truncate_tables |= *truncate;
            config.migration.acknowledge_warnings |= *acknowledge_warnings;
            config.migration.override_errors |= *override_errors;
            config.validate()?;

            let shutdown = setup_signal_handler()?;
            run_job(&cli, &config, tables, shutdown).await?
        }
    };

    Ok(code)
}

async fn run_job(
    cli: &Cli,
    config: &Config,
    tables: &[String],
    shutdown: CancellationToken,
) -> Result<ExitCode, MigrateError> {
    let registry = open_registry(config, &[Side::Source, Side::Target]).await?;
    let bus = ProgressBus::default();
    let mut orchestrator =
        Orchestrator::from_config(Arc::clone(&registry), &config.migration).with_bus(bus.clone());
    if let Some(path) = &config.migration.history_file {
        orchestrator = orchestrator.with_history(Arc::new(JsonFileHistory::new(path.clone())));
    }

    let forwarder = tokio::spawn(forward_progress(bus.subscribe(), cli.progress));

    let request = JobRequest::new("source", "target")
        .tables(tables_or_configured(tables, config))
        .options(JobOptions::from(&config.migration));

    let ticket = orchestrator.submit(request).await?;
    let job_id = ticket.id().to_string();
    info!("Job {} started", job_id);

    let wait = ticket.wait();
    tokio::pin!(wait);
    let record = tokio::select! {
        r = &mut wait => r?,
        _ = shutdown.cancelled() => {
            orchestrator.cancel(&job_id)?;
            match tokio::time::timeout(Duration::from_secs(cli.shutdown_timeout), &mut wait).await {
                Ok(r) => r?,
                Err(_) => {
                    warn!("Job {} did not stop within {}s", job_id, cli.shutdown_timeout);
                    return Err(MigrateError::Cancelled);
                }
            }
        }
    };

    if let Err(e) = forwarder.await {
        debug!("progress forwarder ended: {}", e);
    }
    registry.shutdown().await;

    print_record(&record, cli.output_json)?;
    Ok(match record.status {
        JobStatus::Completed => ExitCode::SUCCESS,
        JobStatus::Cancelled => ExitCode::from(MigrateError::Cancelled.exit_code()),
        _ => ExitCode::from(1),
    })
}

/// Log bus events until the job's record arrives.
async fn forward_progress(mut rx: broadcast::Receiver<BusMessage>, json_lines: bool) {
    loop {
        match rx.recv().await {
            Ok(BusMessage::Progress(event)) => {
                if json_lines {
                    if let Ok(line) = serde_json::to_string(&event) {
                        eprintln!("{}", line);
                    }
                    continue;
                }
                let table = event.table.as_deref().unwrap_or("job");
                match event.kind {
                    EventKind::Batch => debug!(
                        "{}: {}/{} rows",
                        table,
                        event.rows_migrated,
                        event.total_rows.unwrap_or_default()
                    ),
                    EventKind::Task | EventKind::Job => info!(
                        "{}: {} ({} rows)",
                        table,
                        serde_json::to_value(event.status)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default(),
                        event.rows_migrated
                    ),
                }
            }
            Ok(BusMessage::Finished(_)) => break,
            Err(RecvError::Lagged(n)) => warn!("progress output skipped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_record(record: &JobRecord, output_json: bool) -> Result<(), MigrateError> {
    if output_json {
        println!("{}", record.to_json()?);
        return Ok(());
    }
    let done = record.tables.len() - record.unfinished().count();
    println!("\nMigration {}!", record.status);
    println!("  Job ID: {}", record.job_id);
    println!("  Duration: {:.2}s", record.duration_seconds);
    println!("  Tables: {}/{}", done, record.tables.len());
    println!("  Rows: {}", record.rows_migrated);
    println!("  Throughput: {} rows/sec", record.rows_per_second);
    for task in record.unfinished() {
        println!(
            "  {} {}: {}",
            task.table,
            task.status,
            task.last_error.as_deref().unwrap_or("-")
        );
        if task.partial_batch_risk {
            println!("    (last batch may be partially written)");
        }
    }
    for c in &record.constraint_errors {
        println!("  constraint {}.{}: {}", c.table, c.constraint, c.error);
    }
    Ok(())
}

async fn health_check(cli: &Cli, config: &Config) -> Result<ExitCode, MigrateError> {
    let registry = ConnectionRegistry::new();
    let mut results = Vec::new();
    let mut healthy = true;

    for (side, endpoint) in [(Side::Source, &config.source), (Side::Target, &config.target)] {
        let opened = registry
            .open(ConnectionRequest::new(endpoint.clone()).with_id(side.id()))
            .await;
        let checked = match opened {
            Ok(_) => registry.health_check(side.id()).await,
            Err(e) => Err(e),
        };
        healthy &= checked.is_ok();
        results.push(json!({
            "side": side.id(),
            "type": endpoint.r#type,
            "endpoint": endpoint.describe(),
            "connected": checked.is_ok(),
            "latency_ms": checked.as_ref().map(|d| d.as_millis() as u64).unwrap_or(0),
            "error": checked.as_ref().err().map(|e| e.to_string()),
        }));
    }
    registry.shutdown().await;

    if cli.output_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "healthy": healthy, "connections": results }))?
        );
    } else {
        println!("Health Check Results:");
        for r in &results {
            println!(
                "  {} ({}): {} ({}ms)",
                r["side"].as_str().unwrap_or_default(),
                r["endpoint"].as_str().unwrap_or_default(),
                if r["connected"] == true { "OK" } else { "FAILED" },
                r["latency_ms"]
            );
            if let Some(err) = r["error"].as_str() {
                println!("    Error: {}", err);
            }
        }
        println!(
            "\n  Overall: {}",
            if healthy { "HEALTHY" } else { "UNHEALTHY" }
        );
    }

    if !healthy {
        return Err(MigrateError::connection(
            "health check failed",
            "one or more endpoints unreachable",
        ));
    }
    Ok(ExitCode::SUCCESS)
}

async fn open_registry(
    config: &Config,
    sides: &[Side],
) -> Result<Arc<ConnectionRegistry>, MigrateError> {
    let registry = Arc::new(ConnectionRegistry::new());
    let pool_size = config.migration.get_pool_size();
    for side in sides {
        let endpoint = match side {
            Side::Source => &config.source,
            Side::Target => &config.target,
        };
        registry
            .open(
                ConnectionRequest::new(endpoint.clone())
                    .with_id(side.id())
                    .with_pool_size(pool_size),
            )
            .await?;
    }
    Ok(registry)
}

fn tables_or_configured(tables: &[String], config: &Config) -> Vec<String> {
    if tables.is_empty() {
        config.migration.tables.clone()
    } else {
        tables.to_vec()
    }
}

fn write_sample_config(path: &Path, force: bool) -> Result<(), MigrateError> {
    if path.exists() && !force {
        return Err(MigrateError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    std::fs::write(path, SAMPLE_CONFIG)?;
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Cancel the returned token on SIGINT (Ctrl-C) or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT. Cancelling at the next batch boundary..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM. Cancelling at the next batch boundary..."),
        }
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Cancelling at the next batch boundary...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xdb_migrate::SqlValue;

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.source.r#type, xdb_migrate::DbType::Mysql);
        assert_eq!(config.migration.batch_size, 1000);
        assert!(config.migration.tables.is_empty());
    }

    #[test]
    fn test_side_ids() {
        assert_eq!(Side::Source.id(), "source");
        assert_eq!(Side::Target.id(), "target");
    }

    #[test]
    fn test_sample_value_text() {
        assert_eq!(SqlValue::I32(4).to_text().as_deref(), Some("4"));
        assert!(SqlValue::Null.to_text().is_none());
    }
}
