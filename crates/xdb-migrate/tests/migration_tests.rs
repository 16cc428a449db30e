//! End-to-end jobs against in-memory databases.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use xdb_migrate::progress::EventKind;
use xdb_migrate::{
    AdapterImpl, BusMessage, CanonicalType, Column, ConnectionRegistry, DbType, ForeignKey,
    HistorySink, Index, JobOptions, JobRequest, JobStatus, MemoryAdapter, MemoryHistory,
    MigrateError, Orchestrator, RetryPolicy, SqlValue, Table, TaskStatus,
};

fn table(schema: &str, name: &str) -> Table {
    let mut t = Table::new(schema, name);
    t.columns
        .push(Column::new("id", "int", CanonicalType::Integer).not_null());
    t.columns.push(Column::new(
        "label",
        "varchar",
        CanonicalType::VariableString(50),
    ));
    t.primary_key = vec!["id".into()];
    t
}

fn with_fk(mut t: Table, column: &str, references: &str) -> Table {
    t.columns
        .push(Column::new(column, "int", CanonicalType::Integer));
    t.foreign_keys.push(ForeignKey {
        name: format!("fk_{}_{}", t.name, references),
        columns: vec![column.into()],
        ref_schema: t.schema.clone(),
        ref_table: references.into(),
        ref_columns: vec!["id".into()],
        on_delete: "NO ACTION".into(),
        on_update: "NO ACTION".into(),
    });
    t
}

fn rows(n: i32, width: usize) -> Vec<Vec<SqlValue>> {
    (1..=n)
        .map(|i| {
            let mut row = vec![SqlValue::I32(i), SqlValue::Text(format!("row {}", i))];
            row.resize(width, SqlValue::Null);
            row
        })
        .collect()
}

struct Fixture {
    registry: Arc<ConnectionRegistry>,
    src: MemoryAdapter,
    dst: MemoryAdapter,
}

impl Fixture {
    async fn new() -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let src = MemoryAdapter::new(DbType::Mysql, "shop");
        let dst = MemoryAdapter::new(DbType::Postgresql, "public");
        registry
            .register("src", AdapterImpl::Memory(src.clone()), 4)
            .await
            .unwrap();
        registry
            .register("dst", AdapterImpl::Memory(dst.clone()), 4)
            .await
            .unwrap();
        Self { registry, src, dst }
    }

    fn add(&self, t: Table, n: i32) {
        let width = t.columns.len();
        self.src.insert_table(t, rows(n, width));
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(Arc::clone(&self.registry))
            .with_workers(2)
            .with_retry_policy(fast_retry())
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        batch_timeout: Duration::from_secs(30),
    }
}

fn options(batch_size: usize) -> JobOptions {
    JobOptions {
        batch_size,
        ..JobOptions::default()
    }
}

fn orders() -> (Table, Vec<Vec<SqlValue>>) {
    let mut t = Table::new("shop", "orders");
    t.columns
        .push(Column::new("id", "int", CanonicalType::Integer).not_null());
    t.columns.push(Column::new(
        "total",
        "decimal",
        CanonicalType::Decimal {
            precision: 10,
            scale: 2,
        },
    ));
    t.primary_key = vec!["id".into()];
    let rows = (1..=10_000)
        .map(|i: i32| {
            let cents = (i64::from(i) * 7_919) % 10_000_000;
            vec![SqlValue::I32(i), SqlValue::Decimal(Decimal::new(cents, 2))]
        })
        .collect();
    (t, rows)
}

#[tokio::test]
async fn test_full_table_copy_publishes_batches() {
    let fx = Fixture::new().await;
    let (t, source_rows) = orders();
    fx.src.insert_table(t, source_rows.clone());
    let history = Arc::new(MemoryHistory::new());
    let orchestrator = fx
        .orchestrator()
        .with_history(Arc::clone(&history) as Arc<dyn HistorySink>);
    let mut rx = orchestrator.bus().subscribe();

    let record = orchestrator
        .run(JobRequest::new("src", "dst").options(options(500)))
        .await
        .unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.rows_migrated, 10_000);
    assert_eq!(fx.dst.rows("public", "orders"), source_rows);
    assert_eq!(history.records().len(), 1);

    let mut batches = Vec::new();
    let mut elapsed = Vec::new();
    loop {
        match rx.recv().await {
            Ok(BusMessage::Progress(e)) => {
                if e.table.as_deref() == Some("orders") {
                    elapsed.push(e.elapsed_ms);
                }
                if e.kind == EventKind::Batch {
                    batches.push(e.rows_migrated);
                }
            }
            Ok(BusMessage::Finished(r)) => {
                assert_eq!(r.job_id, record.job_id);
                break;
            }
            Err(RecvError::Lagged(n)) => panic!("lagged by {}", n),
            Err(RecvError::Closed) => panic!("bus closed"),
        }
    }
    assert_eq!(batches.len(), 20);
    assert!(batches.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(batches.last(), Some(&10_000));
    // Task and batch events share one clock.
    assert!(elapsed.len() > batches.len());
    assert!(elapsed.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_values_survive_the_copy() {
    let fx = Fixture::new().await;
    let mut t = Table::new("shop", "samples");
    t.columns
        .push(Column::new("id", "bigint", CanonicalType::BigInteger).not_null());
    t.columns.push(Column::new(
        "price",
        "decimal",
        CanonicalType::Decimal {
            precision: 12,
            scale: 4,
        },
    ));
    t.columns.push(Column::new("ratio", "double", CanonicalType::Float));
    t.columns.push(Column::new(
        "name",
        "varchar",
        CanonicalType::VariableString(40),
    ));
    t.columns.push(Column::new("active", "tinyint(1)", CanonicalType::Boolean));
    t.columns.push(Column::new("born", "date", CanonicalType::Date));
    t.columns
        .push(Column::new("seen_at", "datetime", CanonicalType::Timestamp));
    t.primary_key = vec!["id".into()];

    let day = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
    let source_rows = vec![
        vec![
            SqlValue::I64(1),
            SqlValue::Decimal(Decimal::new(-12_345_678, 4)),
            SqlValue::F64(0.125),
            SqlValue::Text("Zoë O'Brien".into()),
            SqlValue::Bool(true),
            SqlValue::Date(day),
            SqlValue::DateTime(day.and_hms_opt(23, 59, 58).unwrap()),
        ],
        vec![
            SqlValue::I64(i64::MAX),
            SqlValue::Decimal(Decimal::new(999_999_999_999, 4)),
            SqlValue::F64(-1.5e300),
            SqlValue::Text(String::new()),
            SqlValue::Bool(false),
            SqlValue::Date(NaiveDate::from_ymd_opt(1, 1, 1).unwrap()),
            SqlValue::DateTime(day.and_hms_opt(0, 0, 0).unwrap()),
        ],
        vec![
            SqlValue::I64(3),
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Null,
        ],
    ];
    fx.src.insert_table(t, source_rows.clone());

    let record = fx.orchestrator().run(JobRequest::new("src", "dst")).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);

    let created = fx.dst.table("public", "samples").unwrap();
    assert_eq!(created.columns[1].data_type.to_lowercase(), "numeric(12,4)");
    assert_eq!(fx.dst.rows("public", "samples"), source_rows);
}

#[tokio::test]
async fn test_precision_loss_needs_acknowledgement() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "customers"), 10);
    let mut narrow = table("public", "customers");
    narrow.columns[1] = Column::new("label", "varchar", CanonicalType::VariableString(20));
    fx.dst.insert_table(narrow, Vec::new());
    let orchestrator = fx.orchestrator();

    let err = orchestrator
        .submit(JobRequest::new("src", "dst"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MigrateError::IncompatibleSchema(_)));
    assert!(fx.dst.write_log().is_empty());

    let validated = orchestrator
        .validate(&JobRequest::new("src", "dst").options(JobOptions {
            acknowledge_warnings: true,
            ..JobOptions::default()
        }))
        .await
        .unwrap();
    assert_eq!(validated.report.warnings().count(), 1);

    let record = orchestrator
        .run(JobRequest::new("src", "dst").options(JobOptions {
            acknowledge_warnings: true,
            ..JobOptions::default()
        }))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.rows_migrated, 10);
}

#[tokio::test]
async fn test_parents_load_before_children() {
    let fx = Fixture::new().await;
    fx.add(with_fk(table("shop", "orders"), "customer_id", "customers"), 50);
    fx.add(table("shop", "customers"), 20);
    fx.add(with_fk(table("shop", "items"), "order_id", "orders"), 80);

    let record = fx
        .orchestrator()
        .with_workers(4)
        .run(JobRequest::new("src", "dst").options(options(10)))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.constraint_errors.is_empty());

    let log = fx.dst.write_log();
    let first = |name: &str| log.iter().position(|t| t == name).unwrap();
    let last = |name: &str| log.iter().rposition(|t| t == name).unwrap();
    assert!(last("public.customers") < first("public.orders"));
    assert!(last("public.orders") < first("public.items"));

    // Foreign keys are added after the load.
    let ddl = fx.dst.executed_ddl();
    assert!(ddl.iter().any(|s| s.contains("fk_orders_customers")));
    assert_eq!(fx.dst.table("public", "items").unwrap().foreign_keys.len(), 1);
}

#[tokio::test]
async fn test_cycle_is_broken_and_constraints_deferred() {
    let fx = Fixture::new().await;
    fx.add(with_fk(table("shop", "a"), "b_id", "b"), 5);
    fx.add(with_fk(table("shop", "b"), "a_id", "a"), 5);

    let orchestrator = fx.orchestrator();
    let validated = orchestrator
        .validate(&JobRequest::new("src", "dst"))
        .await
        .unwrap();
    assert!(validated.plan.has_cycles());
    assert_eq!(validated.plan.order, vec!["a", "b"]);

    let record = orchestrator.run(JobRequest::new("src", "dst")).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.constraint_errors.is_empty());
    assert_eq!(fx.dst.table("public", "a").unwrap().foreign_keys.len(), 1);
    assert_eq!(fx.dst.table("public", "b").unwrap().foreign_keys.len(), 1);
}

#[tokio::test]
async fn test_failed_parent_fails_dependents() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "customers"), 10);
    fx.add(with_fk(table("shop", "orders"), "customer_id", "customers"), 10);
    fx.add(table("shop", "products"), 10);
    fx.dst.fail_ddl("public", "customers");

    let record = fx.orchestrator().run(JobRequest::new("src", "dst")).await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);

    let status = |name: &str| {
        record
            .tables
            .iter()
            .find(|t| t.table == name)
            .unwrap()
            .clone()
    };
    assert_eq!(status("customers").status, TaskStatus::Failed);
    let orders = status("orders");
    assert_eq!(orders.status, TaskStatus::Failed);
    assert_eq!(orders.error_kind.as_deref(), Some("dependency_failed"));
    assert_eq!(orders.rows_migrated, 0);
    assert_eq!(status("products").status, TaskStatus::Done);

    // The skipped foreign key is reported, not silently dropped.
    assert_eq!(record.constraint_errors.len(), 1);
    assert_eq!(record.constraint_errors[0].table, "orders");
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "events"), 100);
    fx.add(table("shop", "broken"), 100);
    fx.dst.insert_table(table("public", "events"), Vec::new());
    fx.dst.insert_table(table("public", "broken"), Vec::new());
    fx.dst.fail_writes_transiently("public", "events", 2);
    fx.dst.fail_writes_permanently("public", "broken");

    let record = fx
        .orchestrator()
        .run(JobRequest::new("src", "dst").options(options(25)))
        .await
        .unwrap();

    let events = record.tables.iter().find(|t| t.table == "events").unwrap();
    assert_eq!(events.status, TaskStatus::Done);
    assert_eq!(events.rows_migrated, 100);
    assert_eq!(fx.dst.rows("public", "events").len(), 100);

    let broken = record.tables.iter().find(|t| t.table == "broken").unwrap();
    assert_eq!(broken.status, TaskStatus::Failed);
    assert_eq!(broken.error_kind.as_deref(), Some("write"));
    assert!(!broken.partial_batch_risk);
    assert_eq!(record.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_non_transactional_failure_flags_partial_batch() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "events"), 100);
    fx.add(table("shop", "broken"), 100);
    fx.dst.insert_table(table("public", "events"), Vec::new());
    fx.dst.insert_table(table("public", "broken"), Vec::new());
    // The first attempt lands half of the batch before failing, so the
    // replay collides with its own rows.
    fx.dst.fail_writes_transiently("public", "events", 1);
    fx.dst.fail_writes_permanently("public", "broken");

    let record = fx
        .orchestrator()
        .run(JobRequest::new("src", "dst").options(JobOptions {
            use_transactions: false,
            ..options(20)
        }))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Failed);

    for name in ["events", "broken"] {
        let task = record.tables.iter().find(|t| t.table == name).unwrap();
        assert_eq!(task.status, TaskStatus::Failed, "{}", name);
        assert_eq!(task.error_kind.as_deref(), Some("write"), "{}", name);
        assert!(task.partial_batch_risk, "{}", name);
        assert_eq!(task.rows_migrated, 0, "{}", name);
        assert_eq!(fx.dst.rows("public", name).len(), 10, "{}", name);
    }
    let events = record.tables.iter().find(|t| t.table == "events").unwrap();
    assert!(events
        .last_error
        .as_deref()
        .unwrap()
        .contains("duplicate primary key"));
}

#[tokio::test]
async fn test_same_connection_on_both_sides_is_rejected() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "orders"), 5);

    let err = fx
        .orchestrator()
        .submit(JobRequest::new("src", "src"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MigrateError::Config(_)));
    assert!(fx.src.write_log().is_empty());
}

#[tokio::test]
async fn test_cancel_while_waiting_for_a_connection() {
    let registry = Arc::new(ConnectionRegistry::new());
    let src = MemoryAdapter::new(DbType::Mysql, "shop");
    let dst = MemoryAdapter::new(DbType::Postgresql, "public");
    src.insert_table(table("shop", "orders"), rows(50, 2));
    registry
        .register("src", AdapterImpl::Memory(src.clone()), 1)
        .await
        .unwrap();
    registry
        .register("dst", AdapterImpl::Memory(dst.clone()), 1)
        .await
        .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&registry)).with_retry_policy(fast_retry());

    let ticket = orchestrator
        .submit(JobRequest::new("src", "dst"))
        .await
        .unwrap();
    // Hold the only source connection so the job cannot read.
    let held = registry.lease("src").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel(ticket.id()).unwrap();

    let record = tokio::time::timeout(Duration::from_secs(1), ticket.wait())
        .await
        .expect("job stuck waiting for a connection")
        .unwrap();
    drop(held);
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.tables[0].status, TaskStatus::Cancelled);
    assert!(dst.rows("public", "orders").is_empty());
}

#[tokio::test]
async fn test_incompatible_table_is_skipped_with_dependents() {
    let fx = Fixture::new().await;
    let mut shapes = table("shop", "shapes");
    shapes.columns.push(Column::new(
        "outline",
        "geometry",
        CanonicalType::Unknown("geometry".into()),
    ));
    fx.add(shapes, 5);
    fx.add(with_fk(table("shop", "parts"), "shape_id", "shapes"), 5);
    fx.add(table("shop", "customers"), 5);

    let record = fx.orchestrator().run(JobRequest::new("src", "dst")).await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);

    let status = |name: &str| record.tables.iter().find(|t| t.table == name).unwrap();
    assert_eq!(status("shapes").status, TaskStatus::Failed);
    assert_eq!(status("shapes").error_kind.as_deref(), Some("incompatible_schema"));
    assert!(status("shapes").last_error.as_deref().unwrap().contains("outline"));
    assert_eq!(status("parts").error_kind.as_deref(), Some("dependency_failed"));
    assert_eq!(status("customers").status, TaskStatus::Done);

    assert!(fx.dst.table("public", "shapes").is_none());
    assert_eq!(fx.dst.rows("public", "customers").len(), 5);

    // Overriding lets the table through as text.
    let fx = Fixture::new().await;
    let mut shapes = table("shop", "shapes");
    shapes.columns.push(Column::new(
        "outline",
        "geometry",
        CanonicalType::Unknown("geometry".into()),
    ));
    fx.add(shapes, 5);
    let validated = fx
        .orchestrator()
        .validate(&JobRequest::new("src", "dst").options(JobOptions {
            override_errors: true,
            acknowledge_warnings: true,
            ..JobOptions::default()
        }))
        .await
        .unwrap();
    assert!(validated.blocked.is_empty());
}

#[tokio::test]
async fn test_transient_read_failure_restarts_scan() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "events"), 60);
    fx.src.fail_reads_transiently("shop", "events", 1);

    let record = fx
        .orchestrator()
        .run(JobRequest::new("src", "dst").options(options(20)))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(fx.dst.rows("public", "events").len(), 60);
}

#[tokio::test]
async fn test_cancel_stops_at_batch_boundary() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "slow"), 1_000);
    fx.dst.set_write_delay(Duration::from_millis(20));
    let orchestrator = fx.orchestrator();
    let mut rx = orchestrator.bus().subscribe();

    let ticket = orchestrator
        .submit(JobRequest::new("src", "dst").options(options(10)))
        .await
        .unwrap();
    loop {
        if let Ok(BusMessage::Progress(e)) = rx.recv().await {
            if e.kind == EventKind::Batch {
                break;
            }
        }
    }
    orchestrator.cancel(ticket.id()).unwrap();

    let record = ticket.wait().await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    let task = &record.tables[0];
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.rows_migrated > 0 && task.rows_migrated < 1_000);
    assert_eq!(
        fx.dst.rows("public", "slow").len() as i64,
        task.rows_migrated
    );
}

#[tokio::test]
async fn test_truncate_makes_reruns_idempotent() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "orders"), 40);
    let orchestrator = fx.orchestrator();
    let request = JobRequest::new("src", "dst").options(JobOptions {
        truncate_tables: true,
        ..options(15)
    });

    for _ in 0..2 {
        let record = orchestrator.run(request.clone()).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }
    assert_eq!(fx.dst.rows("public", "orders").len(), 40);

    // Without truncation the second load collides on the primary key.
    let record = orchestrator
        .run(JobRequest::new("src", "dst").options(options(15)))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_lost_rows_fail_verification() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "ledger"), 30);
    fx.dst.insert_table(table("public", "ledger"), Vec::new());
    fx.dst.discard_writes("public", "ledger");

    let record = fx.orchestrator().run(JobRequest::new("src", "dst")).await.unwrap();
    let task = &record.tables[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_kind.as_deref(), Some("verification"));
    assert_eq!(record.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_inline_constraints_disable_enforcement() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "customers"), 5);
    fx.add(with_fk(table("shop", "orders"), "customer_id", "customers"), 5);
    fx.dst.set_supports_deferred_constraints(false);

    let record = fx.orchestrator().run(JobRequest::new("src", "dst")).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);

    let log = fx.dst.enforcement_log();
    assert!(log.contains(&("public.orders".to_string(), false)));
    assert!(log.contains(&("public.orders".to_string(), true)));
    // Created inline, so nothing is added afterwards.
    assert!(!fx
        .dst
        .executed_ddl()
        .iter()
        .any(|s| s.starts_with("ALTER TABLE")));
}

#[tokio::test]
async fn test_indexes_created_after_load() {
    let fx = Fixture::new().await;
    let mut t = table("shop", "products");
    t.indexes.push(Index {
        name: "ix_products_label".into(),
        columns: vec!["label".into()],
        is_unique: false,
    });
    fx.add(t, 12);

    let record = fx.orchestrator().run(JobRequest::new("src", "dst")).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(fx.dst.table("public", "products").unwrap().indexes.len(), 1);
    let ddl = fx.dst.executed_ddl();
    assert!(ddl.iter().any(|s| s.contains("ix_products_label")));
}

#[tokio::test]
async fn test_submission_errors() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "orders"), 1);
    let orchestrator = fx.orchestrator();

    let err = orchestrator
        .submit(JobRequest::new("src", "nowhere"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MigrateError::NotFound(_)));

    let err = orchestrator
        .submit(JobRequest::new("src", "dst").options(options(0)))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MigrateError::Config(_)));

    let err = orchestrator
        .submit(JobRequest::new("src", "dst").tables(["ghost"]))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MigrateError::NotFound(_)));

    let err = orchestrator
        .submit(JobRequest::new("src", "dst").options(JobOptions {
            create_tables: false,
            ..JobOptions::default()
        }))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MigrateError::IncompatibleSchema(_)));
}

#[tokio::test]
async fn test_job_snapshot_by_id() {
    let fx = Fixture::new().await;
    fx.add(table("shop", "orders"), 3);
    let orchestrator = fx.orchestrator();

    let ticket = orchestrator
        .submit(JobRequest::new("src", "dst"))
        .await
        .unwrap();
    let id = ticket.id().to_string();
    let record = ticket.wait().await.unwrap();

    let job = orchestrator.job(&id).unwrap();
    assert_eq!(job.status, record.status);
    assert_eq!(job.tasks[0].status, TaskStatus::Done);
    assert!(matches!(
        orchestrator.job("missing"),
        Err(MigrateError::NotFound(_))
    ));
}
