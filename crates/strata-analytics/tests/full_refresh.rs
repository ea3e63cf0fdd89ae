//! Full refresh orchestration against a recording connection

mod common;

use chrono::NaiveDate;
use common::*;
use std::sync::Arc;
use strata_analytics::config::AnalyticsConfig;
use strata_analytics::hooks::RowCountHook;
use strata_analytics::model::TableType;
use strata_analytics::orchestrator::PLANNING_ABORTED;
use strata_analytics::report::{RefreshState, RunStatus};
use strata_analytics::schema::NUMERIC_PATTERN;
use strata_analytics::watermark::{InMemoryWatermarkStore, WatermarkKey};
use strata_analytics::RefreshParams;
use strata_rdbc::testing::{MockConnection, TransactionOutcome};
use strata_rdbc::{Row, Value};
use tokio_util::sync::CancellationToken;

fn child_programme_only() -> RefreshParams {
    RefreshParams::full()
        .with_start_time(ts("2024-05-01 00:00:00"))
        .skip_subject(INPATIENT)
        .skip_table_type(TableType::Enrollment)
}

fn years(values: &[i32]) -> Vec<Row> {
    values.iter().map(|y| Row::single("datayear", *y)).collect()
}

#[tokio::test]
async fn test_partitions_follow_data_years_within_bounds() {
    let mock = MockConnection::new().on_query("as datayear", years(&[2018, 2020, 2023, 2031]));
    let harness = Harness::with_watermarks(
        mock.clone(),
        InMemoryWatermarkStore::new().with(WatermarkKey::LastLatestRefresh, ts("2024-04-20 00:00:00")),
    );

    let report = harness
        .orchestrator()
        .run(child_programme_only(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].table, event_table(CHILD_PROGRAMME));
    assert_eq!(report.succeeded[0].partitions, vec!["2018", "2020", "2023"]);

    let staging = staging_table(CHILD_PROGRAMME);
    let inserts = mock.statements_matching(&format!("insert into \"{}_", staging));
    assert_eq!(inserts.len(), 3);
    assert!(inserts[0].starts_with(&format!("insert into \"{}_2018\"", staging)));
    assert!(inserts[2].starts_with(&format!("insert into \"{}_2023\"", staging)));

    let creates = mock.statements_matching(&format!("create table \"{}_2018\"", staging));
    assert_eq!(
        creates,
        vec![format!(
            "create table \"{}_2018\" (check (\"yearly\" = '2018')) inherits (\"{}\")",
            staging, staging
        )]
    );

    let transactions = swaps(&mock);
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].outcome, TransactionOutcome::Committed);
    let published = event_table(CHILD_PROGRAMME);
    assert_eq!(
        transactions[0].statements,
        vec![
            format!("DROP TABLE IF EXISTS \"{}\" CASCADE", published),
            format!("ALTER TABLE \"{}\" RENAME TO \"{}\"", staging, published),
            format!("ALTER TABLE \"{}_2018\" RENAME TO \"{}_2018\"", staging, published),
            format!("ALTER TABLE \"{}_2020\" RENAME TO \"{}_2020\"", staging, published),
            format!("ALTER TABLE \"{}_2023\" RENAME TO \"{}_2023\"", staging, published),
        ]
    );

    assert_eq!(
        harness.watermarks.peek(WatermarkKey::LastFullRefresh),
        Some(ts("2024-05-01 00:00:00"))
    );
    assert_eq!(harness.watermarks.peek(WatermarkKey::LastLatestRefresh), None);
}

#[tokio::test]
async fn test_subject_without_data_gets_current_year() {
    let mock = MockConnection::new();
    let harness = Harness::new(mock.clone());

    let report = harness
        .orchestrator()
        .run(
            RefreshParams::full().with_start_time(ts("2024-05-01 00:00:00")),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.succeeded.len(), 3);
    for subject in &report.succeeded {
        assert_eq!(subject.partitions, vec!["2024"], "{}", subject.table);
    }

    let enrollment = mock.statements_matching("create table \"analytics_temp_enrollment_neenwmsyuep_2024\"");
    assert_eq!(enrollment.len(), 1);
    assert!(enrollment[0].contains("\"incidentdate\" >= '2024-01-01' and \"incidentdate\" < '2025-01-01'"));
}

#[tokio::test]
async fn test_numeric_values_are_pattern_guarded() {
    let mock = MockConnection::new().on_query("as datayear", years(&[2023]));
    let harness = Harness::new(mock.clone());

    harness
        .orchestrator()
        .run(child_programme_only(), CancellationToken::new())
        .await
        .unwrap();

    let inserts = mock.statements_matching("insert into");
    assert_eq!(inserts.len(), 1);
    assert!(inserts[0].contains(&format!(
        "eventdatavalues #>> '{{cYeuwXTCPkU, value}}' ~* '{}'",
        NUMERIC_PATTERN
    )));
    // Free text is exposed as is
    assert!(inserts[0].contains("(select eventdatavalues #>> '{oZg33kd9taw, value}' from event where eventid=psi.eventid)"));
}

#[tokio::test]
async fn test_population_failure_is_isolated() {
    let failing = staging_table(INPATIENT);
    let mock = MockConnection::new()
        .on_query("as datayear", years(&[2023]))
        .fail_on(format!("insert into \"{}_", failing), "division by zero");
    let harness = Harness::new(mock.clone());

    let report = harness
        .orchestrator()
        .run(
            RefreshParams::full()
                .with_start_time(ts("2024-05-01 00:00:00"))
                .skip_table_type(TableType::Enrollment),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].subject, CHILD_PROGRAMME);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].subject, INPATIENT);
    assert_eq!(report.failed[0].state, RefreshState::Populating);
    assert!(report.failed[0].reason.contains("division by zero"));

    // The failed subject never reached a swap and its staging table is gone
    let published = event_table(INPATIENT);
    assert!(swaps(&mock)
        .iter()
        .all(|tx| tx.statements.iter().all(|s| !s.contains(&published))));
    let last = mock.statements_matching(&failing).pop().unwrap();
    assert_eq!(last, format!("DROP TABLE IF EXISTS \"{}\" CASCADE", failing));

    assert_eq!(harness.watermarks.peek(WatermarkKey::LastFullRefresh), None);
}

#[tokio::test]
async fn test_swap_failure_rolls_back() {
    let published = event_table(CHILD_PROGRAMME);
    let mock = MockConnection::new().fail_on(format!("RENAME TO \"{}\"", published), "lock timeout");
    let harness = Harness::new(mock.clone());

    let report = harness
        .orchestrator()
        .run(child_programme_only(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed[0].state, RefreshState::Swapping);
    let transactions = swaps(&mock);
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].outcome, TransactionOutcome::RolledBack);

    let last = mock.statements().pop().unwrap();
    assert_eq!(last.transaction, None);
    assert_eq!(
        last.sql,
        format!("DROP TABLE IF EXISTS \"{}\" CASCADE", staging_table(CHILD_PROGRAMME))
    );
}

#[tokio::test]
async fn test_hook_rejection_is_only_logged() {
    let mock = MockConnection::new();
    let mut harness = Harness::new(mock.clone());
    harness.hooks.push(Arc::new(RowCountHook::new(1_000)));

    let report = harness
        .orchestrator()
        .run(child_programme_only(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(mock.statements_matching("select count(*)").len(), 1);
    assert_eq!(swaps(&mock)[0].outcome, TransactionOutcome::Committed);
}

#[tokio::test]
async fn test_from_date_swaps_rebuilt_partitions_only() {
    let mock = MockConnection::new()
        .on_query("pg_tables", vec![Row::single("?column?", 1_i32)])
        .on_query("as datayear", years(&[2023, 2024]));
    let harness = Harness::new(mock.clone());

    let report = harness
        .orchestrator()
        .run(
            child_programme_only().with_from_date(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    let years_sql = mock.statements_matching("as datayear");
    assert!(years_sql[0].contains(">= '2023-01-01'"));

    let published = event_table(CHILD_PROGRAMME);
    let staging = staging_table(CHILD_PROGRAMME);
    let tx = &swaps(&mock)[0];
    assert_eq!(
        tx.statements,
        vec![
            format!(
                "delete from \"{}_latest\" ax where ax.psi in (select psi from \"{}\")",
                published, staging
            ),
            format!("DROP TABLE IF EXISTS \"{}_2023\" CASCADE", published),
            format!("ALTER TABLE \"{}_2023\" RENAME TO \"{}_2023\"", staging, published),
            format!("alter table \"{}_2023\" no inherit \"{}\"", published, staging),
            format!("alter table \"{}_2023\" inherit \"{}\"", published, published),
            format!("DROP TABLE IF EXISTS \"{}_2024\" CASCADE", published),
            format!("ALTER TABLE \"{}_2024\" RENAME TO \"{}_2024\"", staging, published),
            format!("alter table \"{}_2024\" no inherit \"{}\"", published, staging),
            format!("alter table \"{}_2024\" inherit \"{}\"", published, published),
            format!("DROP TABLE IF EXISTS \"{}\" CASCADE", staging),
        ]
    );

    // Years before the bound were not rebuilt, so the watermark stays put
    assert_eq!(harness.watermarks.peek(WatermarkKey::LastFullRefresh), None);
}

#[tokio::test]
async fn test_from_date_without_latest_partition_keeps_swap_minimal() {
    let published = event_table(CHILD_PROGRAMME);
    let latest = format!("{}_latest", published);
    let mock = MockConnection::new()
        .on_query_with("pg_tables", move |_, params| {
            let name = params.first().and_then(Value::as_str).unwrap_or_default();
            Ok(if name == latest {
                Vec::new()
            } else {
                vec![Row::single("?column?", 1_i32)]
            })
        })
        .on_query("as datayear", years(&[2024]));
    let harness = Harness::new(mock.clone());

    let report = harness
        .orchestrator()
        .run(
            child_programme_only().with_from_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    let tx = &swaps(&mock)[0];
    assert_eq!(
        tx.statements[0],
        format!("DROP TABLE IF EXISTS \"{}_2024\" CASCADE", published)
    );
    assert!(mock.statements_matching("delete from").is_empty());
}

#[tokio::test]
async fn test_planning_failure_aborts_before_any_write() {
    let mock = MockConnection::new()
        .on_query("as datayear", years(&[2023]))
        .fail_on("pi.programid = 8", "canceling statement due to statement timeout");
    let mut harness = Harness::new(mock.clone());
    harness.config = Arc::new(
        AnalyticsConfig::from_yaml(&CONFIG.replace("parallel_jobs: 2", "parallel_jobs: 1")).unwrap(),
    );

    let report = harness
        .orchestrator()
        .run(
            RefreshParams::full().with_start_time(ts("2024-05-01 00:00:00")),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.succeeded.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].subject, INPATIENT);
    assert_eq!(report.failed[0].state, RefreshState::Planning);
    assert_eq!(report.skipped.len(), 2);
    assert!(report.skipped.iter().all(|s| s.reason == PLANNING_ABORTED));

    assert!(mock.statements_matching("create table").is_empty());
    assert!(mock.statements_matching("insert into").is_empty());
    assert!(mock.transactions().is_empty());
    assert_eq!(harness.watermarks.peek(WatermarkKey::LastFullRefresh), None);
}

#[tokio::test]
async fn test_spatial_support_is_detected_once() {
    let mock = MockConnection::new().on_query("pg_extension", vec![Row::single("?column?", 1_i32)]);
    let mut harness = Harness::new(mock.clone());
    harness.config = Arc::new(
        AnalyticsConfig::from_yaml("database:\n  url: postgres://localhost/dhis2\n").unwrap(),
    );

    harness
        .orchestrator()
        .run(child_programme_only(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(mock.statements_matching("pg_extension").len(), 1);
    let create = mock.statements_matching(&format!(
        "create table \"{}\"",
        staging_table(CHILD_PROGRAMME)
    ));
    assert!(create[0].contains("\"psigeometry\" geometry"));
    assert!(mock
        .statements_matching("using gist")
        .iter()
        .any(|s| s.contains("\"psigeometry\"")));
}

#[tokio::test]
async fn test_cancelled_run_skips_subjects() {
    let mock = MockConnection::new();
    let harness = Harness::new(mock.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = harness
        .orchestrator()
        .run(
            RefreshParams::full().with_start_time(ts("2024-05-01 00:00:00")),
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(report.skipped.len(), 3);
    assert!(report.skipped.iter().all(|s| s.reason == "Refresh cancelled"));
    assert!(mock.statements_matching("create table").is_empty());
    assert_eq!(harness.watermarks.peek(WatermarkKey::LastFullRefresh), None);
}
