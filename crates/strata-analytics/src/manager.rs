//! Table families
//!
//! A [`TableManager`] knows which subjects its family covers, how their
//! columns are derived and the family-specific statements: populating a
//! partition, finding data years and probing for changed rows.

use chrono::NaiveDateTime;

use crate::context::RefreshContext;
use crate::error::{AnalyticsError, Result};
use crate::metadata::MetadataSnapshot;
use crate::model::{AnalyticsTable, Partition, PartitionKey, Subject, TableType};
use crate::schema::SchemaDeriver;
use crate::template::{SqlParam, SqlTemplate, StatementKind, TemplateParams, DATE_FORMAT};

/// Event statuses that reach analytics tables
pub const EXPORTABLE_EVENT_STATUSES: &[&str] = &["COMPLETED", "ACTIVE", "SCHEDULE"];

/// Date an event counts for: the scheduled date for scheduled events, the
/// occurred date otherwise
pub const EVENT_DATE: &str =
    "case when 'SCHEDULE' = psi.status then psi.scheduleddate else psi.occurreddate end";

/// A family of analytics tables
pub trait TableManager: Send + Sync {
    fn table_type(&self) -> TableType;

    /// Whether latest partitions can be maintained for this family
    fn supports_latest(&self) -> bool {
        false
    }

    /// Tables of every subject not skipped, columns derived, no partitions
    fn tables(&self, ctx: &RefreshContext, metadata: &MetadataSnapshot)
        -> Result<Vec<AnalyticsTable>>;

    /// Query returning the data years of a subject, one integer per row
    fn data_years_sql(&self, ctx: &RefreshContext, table: &AnalyticsTable) -> Result<String>;

    /// Insert-select filling one staging partition
    fn populate_sql(
        &self,
        ctx: &RefreshContext,
        table: &AnalyticsTable,
        partition: &Partition,
    ) -> Result<String>;

    /// Check constraint of a staging partition
    fn partition_check(&self, ctx: &RefreshContext, partition: &Partition) -> Option<String>;

    /// Query returning a row when any source row changed in `[start, end)`
    fn has_updated_sql(
        &self,
        _ctx: &RefreshContext,
        _table: &AnalyticsTable,
        _start: NaiveDateTime,
        _end: NaiveDateTime,
    ) -> Result<String> {
        Err(latest_unsupported(self.table_type()))
    }

    /// Delete published rows whose source changed in `[start, end)`
    fn delete_updated_sql(
        &self,
        _ctx: &RefreshContext,
        _table: &AnalyticsTable,
        _start: NaiveDateTime,
        _end: NaiveDateTime,
    ) -> Result<String> {
        Err(latest_unsupported(self.table_type()))
    }

    /// Delete rows of the published latest partition that the staged year
    /// partitions hold again
    fn prune_latest_sql(&self, _ctx: &RefreshContext, _table: &AnalyticsTable) -> Result<String> {
        Err(latest_unsupported(self.table_type()))
    }
}

fn latest_unsupported(table_type: TableType) -> AnalyticsError {
    AnalyticsError::config(format!(
        "latest partitions are not supported for {} tables",
        table_type
    ))
}

fn select_lists(ctx: &RefreshContext, table: &AnalyticsTable) -> (String, String) {
    let columns = table
        .columns
        .iter()
        .map(|c| ctx.dialect.quote_identifier(&c.name))
        .collect::<Vec<_>>()
        .join(",");
    let selects = table
        .columns
        .iter()
        .map(|c| c.select.as_str())
        .collect::<Vec<_>>()
        .join(",");
    (columns, selects)
}

fn from_date_clause(ctx: &RefreshContext, date_column: &'static str) -> Result<String> {
    match ctx.params.from_date {
        Some(from_date) => FROM_DATE_FILTER.render(
            &TemplateParams::new()
                .set("dateColumn", SqlParam::fragment(date_column))
                .set("fromDate", SqlParam::date(from_date)),
            ctx.dialect.as_ref(),
        ),
        None => Ok(String::new()),
    }
}

fn year_filter(ctx: &RefreshContext, date_column: &'static str, partition: &Partition) -> Result<String> {
    let end = partition.end.ok_or_else(|| {
        AnalyticsError::template(format!("partition '{}' has no end boundary", partition.key))
    })?;
    YEAR_FILTER.render(
        &TemplateParams::new()
            .set("dateColumn", SqlParam::fragment(date_column))
            .set("start", SqlParam::timestamp(partition.start))
            .set("end", SqlParam::timestamp(end)),
        ctx.dialect.as_ref(),
    )
}

const FROM_DATE_FILTER: SqlTemplate = SqlTemplate::new(
    StatementKind::FromDateFilter,
    " and (${dateColumn}) >= ${fromDate}",
);

const YEAR_FILTER: SqlTemplate = SqlTemplate::new(
    StatementKind::PartitionFilter,
    " and (${dateColumn}) >= ${start} and (${dateColumn}) < ${end}",
);

const LATEST_FILTER: SqlTemplate = SqlTemplate::new(
    StatementKind::PartitionFilter,
    " and psi.lastupdated >= ${start}",
);

const EVENT_POPULATE: SqlTemplate = SqlTemplate::new(
    StatementKind::Populate,
    "insert into ${table} (${columns}) select ${selects} \
     from event psi \
     inner join enrollment pi on psi.enrollmentid=pi.enrollmentid \
     inner join programstage ps on psi.programstageid=ps.programstageid \
     inner join program pr on pi.programid=pr.programid and pi.deleted = false \
     inner join categoryoptioncombo ao on psi.attributeoptioncomboid=ao.categoryoptioncomboid \
     left join trackedentity tei on pi.trackedentityid=tei.trackedentityid and tei.deleted = false \
     left join organisationunit registrationou on tei.organisationunitid=registrationou.organisationunitid \
     inner join organisationunit ou on psi.organisationunitid=ou.organisationunitid \
     left join analytics_rs_orgunitstructure ous on psi.organisationunitid=ous.organisationunitid \
     left join analytics_rs_organisationunitgroupsetstructure ougs on psi.organisationunitid=ougs.organisationunitid \
     and (cast(date_trunc('month', ${eventDate}) as date)=ougs.startdate or ougs.startdate is null) \
     left join organisationunit enrollmentou on pi.organisationunitid=enrollmentou.organisationunitid \
     inner join analytics_rs_categorystructure acs on psi.attributeoptioncomboid=acs.categoryoptioncomboid \
     left join analytics_rs_dateperiodstructure dps on cast(${eventDate} as date)=dps.dateperiod \
     where psi.lastupdated < ${startTime}${partitionClause} \
     and pr.programid=${programId} \
     and psi.organisationunitid is not null \
     and (${eventDate}) is not null \
     and dps.year >= ${firstYear} \
     and dps.year <= ${latestYear} \
     and psi.status in (${statuses}) \
     and psi.deleted = false",
);

const EVENT_DATA_YEARS: SqlTemplate = SqlTemplate::new(
    StatementKind::DataYears,
    "select distinct cast(dps.year as integer) as datayear \
     from event psi \
     inner join enrollment pi on psi.enrollmentid=pi.enrollmentid \
     inner join analytics_rs_dateperiodstructure dps on cast(${eventDate} as date)=dps.dateperiod \
     where psi.lastupdated <= ${startTime} \
     and pi.programid = ${programId} \
     and (${eventDate}) is not null \
     and (${eventDate}) > '1000-01-01' \
     and psi.deleted = false${fromDateClause} \
     and dps.year >= ${firstYear} \
     and dps.year <= ${latestYear} \
     order by datayear",
);

const EVENT_HAS_UPDATED: SqlTemplate = SqlTemplate::new(
    StatementKind::HasUpdated,
    "select psi.eventid from event psi \
     inner join enrollment pi on psi.enrollmentid=pi.enrollmentid \
     where pi.programid = ${programId} \
     and psi.lastupdated >= ${start} \
     and psi.lastupdated < ${end} \
     limit 1",
);

const EVENT_DELETE_UPDATED: SqlTemplate = SqlTemplate::new(
    StatementKind::DeleteUpdated,
    "delete from ${table} ax where ax.psi in (\
     select psi.uid from event psi \
     inner join enrollment pi on psi.enrollmentid=pi.enrollmentid \
     where pi.programid = ${programId} \
     and psi.lastupdated >= ${start} \
     and psi.lastupdated < ${end})",
);

const EVENT_PRUNE_LATEST: SqlTemplate = SqlTemplate::new(
    StatementKind::PruneLatest,
    "delete from ${latestTable} ax where ax.psi in (select psi from ${stagingTable})",
);

/// One table per program, rows are events
#[derive(Debug, Clone, Copy, Default)]
pub struct EventTableManager;

impl TableManager for EventTableManager {
    fn table_type(&self) -> TableType {
        TableType::Event
    }

    fn supports_latest(&self) -> bool {
        true
    }

    fn tables(
        &self,
        ctx: &RefreshContext,
        metadata: &MetadataSnapshot,
    ) -> Result<Vec<AnalyticsTable>> {
        let deriver = SchemaDeriver::new(
            ctx.dialect.as_ref(),
            &ctx.config.tables,
            ctx.spatial,
            metadata,
        );
        let mut tables = Vec::new();
        for program in &metadata.programs {
            if ctx.params.skips(&program.uid) {
                tracing::info!("Skipping program '{}' ({})", program.name, program.uid);
                continue;
            }
            tables.push(AnalyticsTable::new(
                &ctx.config.tables.table_prefix,
                TableType::Event,
                Subject {
                    id: program.id,
                    uid: program.uid.clone(),
                    name: program.name.clone(),
                },
                deriver.event_columns(program)?,
                ctx.config.tables.logged(),
            ));
        }
        Ok(tables)
    }

    fn data_years_sql(&self, ctx: &RefreshContext, table: &AnalyticsTable) -> Result<String> {
        EVENT_DATA_YEARS.render(
            &TemplateParams::new()
                .set("eventDate", SqlParam::fragment(EVENT_DATE))
                .set("startTime", SqlParam::timestamp(ctx.start_time))
                .set("programId", SqlParam::integer(table.subject.id))
                .set(
                    "fromDateClause",
                    SqlParam::fragment(from_date_clause(ctx, EVENT_DATE)?),
                )
                .set("firstYear", SqlParam::integer(ctx.bounds.earliest.into()))
                .set("latestYear", SqlParam::integer(ctx.bounds.latest.into())),
            ctx.dialect.as_ref(),
        )
    }

    fn populate_sql(
        &self,
        ctx: &RefreshContext,
        table: &AnalyticsTable,
        partition: &Partition,
    ) -> Result<String> {
        let partition_clause = match partition.key {
            PartitionKey::Year(_) => year_filter(ctx, EVENT_DATE, partition)?,
            PartitionKey::Latest => LATEST_FILTER.render(
                &TemplateParams::new().set("start", SqlParam::timestamp(partition.start)),
                ctx.dialect.as_ref(),
            )?,
        };
        let (columns, selects) = select_lists(ctx, table);

        EVENT_POPULATE.render(
            &TemplateParams::new()
                .set(
                    "table",
                    SqlParam::identifier(table.staging_partition_name(partition)),
                )
                .set("columns", SqlParam::fragment(columns))
                .set("selects", SqlParam::fragment(selects))
                .set("eventDate", SqlParam::fragment(EVENT_DATE))
                .set("startTime", SqlParam::timestamp(ctx.start_time))
                .set("partitionClause", SqlParam::fragment(partition_clause))
                .set("programId", SqlParam::integer(table.subject.id))
                .set("firstYear", SqlParam::integer(ctx.bounds.earliest.into()))
                .set("latestYear", SqlParam::integer(ctx.bounds.latest.into()))
                .set("statuses", SqlParam::statuses(EXPORTABLE_EVENT_STATUSES)),
            ctx.dialect.as_ref(),
        )
    }

    fn partition_check(&self, ctx: &RefreshContext, partition: &Partition) -> Option<String> {
        partition.year_key().map(|year| {
            format!(
                "{} = {}",
                ctx.dialect.quote_identifier("yearly"),
                ctx.dialect.string_literal(&year.to_string())
            )
        })
    }

    fn has_updated_sql(
        &self,
        ctx: &RefreshContext,
        table: &AnalyticsTable,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<String> {
        EVENT_HAS_UPDATED.render(
            &TemplateParams::new()
                .set("programId", SqlParam::integer(table.subject.id))
                .set("start", SqlParam::timestamp(start))
                .set("end", SqlParam::timestamp(end)),
            ctx.dialect.as_ref(),
        )
    }

    fn delete_updated_sql(
        &self,
        ctx: &RefreshContext,
        table: &AnalyticsTable,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<String> {
        EVENT_DELETE_UPDATED.render(
            &TemplateParams::new()
                .set("table", SqlParam::identifier(table.name()))
                .set("programId", SqlParam::integer(table.subject.id))
                .set("start", SqlParam::timestamp(start))
                .set("end", SqlParam::timestamp(end)),
            ctx.dialect.as_ref(),
        )
    }

    fn prune_latest_sql(&self, ctx: &RefreshContext, table: &AnalyticsTable) -> Result<String> {
        EVENT_PRUNE_LATEST.render(
            &TemplateParams::new()
                .set("latestTable", SqlParam::identifier(table.latest_partition_name()))
                .set("stagingTable", SqlParam::identifier(table.staging_name())),
            ctx.dialect.as_ref(),
        )
    }
}

const ENROLLMENT_DATE: &str = "pi.occurreddate";

const ENROLLMENT_POPULATE: SqlTemplate = SqlTemplate::new(
    StatementKind::Populate,
    "insert into ${table} (${columns}) select ${selects} \
     from enrollment pi \
     inner join trackedentity tei on pi.trackedentityid = tei.trackedentityid \
     and tei.deleted = false \
     and tei.trackedentitytypeid = ${trackedEntityTypeId} \
     and tei.lastupdated < ${startTime} \
     left join program p on p.programid = pi.programid \
     left join organisationunit ou on pi.organisationunitid = ou.organisationunitid \
     left join analytics_rs_orgunitstructure ous on ous.organisationunitid = ou.organisationunitid \
     where exists (select 1 from event psi where psi.deleted = false \
     and psi.enrollmentid = pi.enrollmentid \
     and psi.status in (${statuses})) \
     and pi.occurreddate is not null \
     and pi.deleted = false${partitionClause}",
);

const ENROLLMENT_DATA_YEARS: SqlTemplate = SqlTemplate::new(
    StatementKind::DataYears,
    "select distinct cast(dps.year as integer) as datayear \
     from enrollment pi \
     inner join trackedentity tei on pi.trackedentityid = tei.trackedentityid \
     and tei.deleted = false \
     and tei.trackedentitytypeid = ${trackedEntityTypeId} \
     inner join analytics_rs_dateperiodstructure dps on cast(${eventDate} as date)=dps.dateperiod \
     where tei.lastupdated < ${startTime} \
     and pi.occurreddate is not null \
     and pi.deleted = false${fromDateClause} \
     and dps.year >= ${firstYear} \
     and dps.year <= ${latestYear} \
     order by datayear",
);

/// One table per tracked-entity type, rows are enrollments
#[derive(Debug, Clone, Copy, Default)]
pub struct EnrollmentTableManager;

impl TableManager for EnrollmentTableManager {
    fn table_type(&self) -> TableType {
        TableType::Enrollment
    }

    fn tables(
        &self,
        ctx: &RefreshContext,
        metadata: &MetadataSnapshot,
    ) -> Result<Vec<AnalyticsTable>> {
        let deriver = SchemaDeriver::new(
            ctx.dialect.as_ref(),
            &ctx.config.tables,
            ctx.spatial,
            metadata,
        );
        let columns = deriver.enrollment_columns();
        Ok(metadata
            .tracked_entity_types
            .iter()
            .filter(|tet| {
                let skip = ctx.params.skips(&tet.uid);
                if skip {
                    tracing::info!("Skipping tracked entity type '{}' ({})", tet.name, tet.uid);
                }
                !skip
            })
            .map(|tet| {
                AnalyticsTable::new(
                    &ctx.config.tables.table_prefix,
                    TableType::Enrollment,
                    Subject {
                        id: tet.id,
                        uid: tet.uid.clone(),
                        name: tet.name.clone(),
                    },
                    columns.clone(),
                    ctx.config.tables.logged(),
                )
            })
            .collect())
    }

    fn data_years_sql(&self, ctx: &RefreshContext, table: &AnalyticsTable) -> Result<String> {
        ENROLLMENT_DATA_YEARS.render(
            &TemplateParams::new()
                .set("eventDate", SqlParam::fragment(ENROLLMENT_DATE))
                .set("startTime", SqlParam::timestamp(ctx.start_time))
                .set("trackedEntityTypeId", SqlParam::integer(table.subject.id))
                .set(
                    "fromDateClause",
                    SqlParam::fragment(from_date_clause(ctx, ENROLLMENT_DATE)?),
                )
                .set("firstYear", SqlParam::integer(ctx.bounds.earliest.into()))
                .set("latestYear", SqlParam::integer(ctx.bounds.latest.into())),
            ctx.dialect.as_ref(),
        )
    }

    fn populate_sql(
        &self,
        ctx: &RefreshContext,
        table: &AnalyticsTable,
        partition: &Partition,
    ) -> Result<String> {
        if partition.is_latest() {
            return Err(latest_unsupported(self.table_type()));
        }
        let (columns, selects) = select_lists(ctx, table);

        ENROLLMENT_POPULATE.render(
            &TemplateParams::new()
                .set(
                    "table",
                    SqlParam::identifier(table.staging_partition_name(partition)),
                )
                .set("columns", SqlParam::fragment(columns))
                .set("selects", SqlParam::fragment(selects))
                .set("trackedEntityTypeId", SqlParam::integer(table.subject.id))
                .set("startTime", SqlParam::timestamp(ctx.start_time))
                .set("statuses", SqlParam::statuses(EXPORTABLE_EVENT_STATUSES))
                .set(
                    "partitionClause",
                    SqlParam::fragment(year_filter(ctx, ENROLLMENT_DATE, partition)?),
                ),
            ctx.dialect.as_ref(),
        )
    }

    fn partition_check(&self, ctx: &RefreshContext, partition: &Partition) -> Option<String> {
        let end = partition.end?;
        let column = ctx.dialect.quote_identifier("incidentdate");
        Some(format!(
            "{} >= {} and {} < {}",
            column,
            ctx.dialect
                .string_literal(&partition.start.format(DATE_FORMAT).to_string()),
            column,
            ctx.dialect.string_literal(&end.format(DATE_FORMAT).to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyticsConfig;
    use crate::context::RefreshParams;
    use crate::metadata::StaticMetadata;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use strata_rdbc::PostgresDialect;

    const METADATA: &str = r#"
org_unit_levels: 2
programs:
  - id: 7
    uid: IpHINAT79UW
    name: Child Programme
    data_elements:
      - { id: 11, uid: cYeuwXTCPkU, name: Weight, value_type: NUMBER }
  - id: 8
    uid: eBAyeGv0exc
    name: Inpatient morbidity
tracked_entity_types:
  - { id: 3, uid: nEenWmSyUEp, name: Person }
"#;

    fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn metadata() -> MetadataSnapshot {
        let m = StaticMetadata::from_yaml(METADATA).unwrap();
        MetadataSnapshot {
            programs: m.programs,
            tracked_entity_types: m.tracked_entity_types,
            org_unit_levels: m.org_unit_levels,
            org_unit_group_sets: m.org_unit_group_sets,
        }
    }

    fn ctx(params: RefreshParams) -> RefreshContext {
        let yaml = "database:\n  url: postgres://localhost/dhis2\ntables:\n  earliest_year: 2015\n  latest_year: 2024\n";
        RefreshContext::builder(
            params.with_start_time(ts(2024, 5, 1)),
            Arc::new(AnalyticsConfig::from_yaml(yaml).unwrap()),
            Arc::new(PostgresDialect),
        )
        .build()
    }

    #[test]
    fn test_event_tables_respect_skip_list() {
        let ctx = ctx(RefreshParams::full().skip_subject("eBAyeGv0exc"));
        let tables = EventTableManager.tables(&ctx, &metadata()).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name(), "analytics_event_iphinat79uw");
    }

    #[test]
    fn test_event_populate_year() {
        let ctx = ctx(RefreshParams::full());
        let mut tables = EventTableManager.tables(&ctx, &metadata()).unwrap();
        let table = &mut tables[0];
        ctx.planner().plan_years(table, &[2020]).unwrap();

        let sql = EventTableManager
            .populate_sql(&ctx, table, &table.partitions()[0])
            .unwrap();
        assert!(sql.starts_with("insert into \"analytics_temp_event_iphinat79uw_2020\" (\"psi\",\"pi\","));
        assert!(sql.contains("where psi.lastupdated < '2024-05-01 00:00:00' and ("));
        assert!(sql.contains(&format!(
            "({}) >= '2020-01-01 00:00:00' and ({}) < '2021-01-01 00:00:00'",
            EVENT_DATE, EVENT_DATE
        )));
        assert!(sql.contains("and pr.programid=7 "));
        assert!(sql.contains("and dps.year >= 2015 and dps.year <= 2024 "));
        assert!(sql.contains("psi.status in ('COMPLETED','ACTIVE','SCHEDULE')"));
        assert!(sql.ends_with("and psi.deleted = false"));
        assert!(!sql.contains("${"));
    }

    #[test]
    fn test_event_populate_latest() {
        let ctx = ctx(RefreshParams::latest());
        let mut tables = EventTableManager.tables(&ctx, &metadata()).unwrap();
        let table = &mut tables[0];
        ctx.planner()
            .plan_latest(table, Some(ts(2024, 4, 1)), ctx.start_time)
            .unwrap();

        let sql = EventTableManager
            .populate_sql(&ctx, table, &table.partitions()[0])
            .unwrap();
        assert!(sql.starts_with("insert into \"analytics_temp_event_iphinat79uw_latest\""));
        assert!(sql.contains(
            "where psi.lastupdated < '2024-05-01 00:00:00' and psi.lastupdated >= '2024-04-01 00:00:00' and pr.programid=7"
        ));
        assert_eq!(EventTableManager.partition_check(&ctx, &table.partitions()[0]), None);
    }

    #[test]
    fn test_event_data_years_with_from_date() {
        let ctx = ctx(RefreshParams::full().with_from_date(NaiveDate::from_ymd_opt(2022, 3, 1).unwrap()));
        let tables = EventTableManager.tables(&ctx, &metadata()).unwrap();
        let sql = EventTableManager.data_years_sql(&ctx, &tables[0]).unwrap();
        assert!(sql.contains(&format!("psi.deleted = false and ({}) >= '2022-03-01'", EVENT_DATE)));
        assert!(sql.contains("pi.programid = 7"));
        assert!(sql.ends_with("order by datayear"));
    }

    #[test]
    fn test_event_change_statements() {
        let ctx = ctx(RefreshParams::latest());
        let tables = EventTableManager.tables(&ctx, &metadata()).unwrap();
        let probe = EventTableManager
            .has_updated_sql(&ctx, &tables[0], ts(2024, 4, 1), ts(2024, 5, 1))
            .unwrap();
        assert!(probe.ends_with(
            "where pi.programid = 7 and psi.lastupdated >= '2024-04-01 00:00:00' and psi.lastupdated < '2024-05-01 00:00:00' limit 1"
        ));

        let delete = EventTableManager
            .delete_updated_sql(&ctx, &tables[0], ts(2024, 4, 1), ts(2024, 5, 1))
            .unwrap();
        assert!(delete.starts_with(
            "delete from \"analytics_event_iphinat79uw\" ax where ax.psi in (select psi.uid from event psi"
        ));
    }

    #[test]
    fn test_partition_checks() {
        let ctx = ctx(RefreshParams::full());
        let partition = ctx.planner().year_partition(2020).unwrap();
        assert_eq!(
            EventTableManager.partition_check(&ctx, &partition).unwrap(),
            "\"yearly\" = '2020'"
        );
        assert_eq!(
            EnrollmentTableManager.partition_check(&ctx, &partition).unwrap(),
            "\"incidentdate\" >= '2020-01-01' and \"incidentdate\" < '2021-01-01'"
        );
    }

    #[test]
    fn test_enrollment_populate() {
        let ctx = ctx(RefreshParams::full());
        let mut tables = EnrollmentTableManager.tables(&ctx, &metadata()).unwrap();
        let table = &mut tables[0];
        assert_eq!(table.name(), "analytics_enrollment_neenwmsyuep");
        ctx.planner().plan_years(table, &[2023]).unwrap();

        let sql = EnrollmentTableManager
            .populate_sql(&ctx, table, &table.partitions()[0])
            .unwrap();
        assert!(sql.contains("tei.trackedentitytypeid = 3"));
        assert!(sql.ends_with(
            "pi.deleted = false and (pi.occurreddate) >= '2023-01-01 00:00:00' and (pi.occurreddate) < '2024-01-01 00:00:00'"
        ));
    }

    #[test]
    fn test_event_prune_latest() {
        let ctx = ctx(RefreshParams::full());
        let tables = EventTableManager.tables(&ctx, &metadata()).unwrap();
        assert_eq!(
            EventTableManager.prune_latest_sql(&ctx, &tables[0]).unwrap(),
            "delete from \"analytics_event_iphinat79uw_latest\" ax where ax.psi in \
             (select psi from \"analytics_temp_event_iphinat79uw\")"
        );

        let enrollments = EnrollmentTableManager.tables(&ctx, &metadata()).unwrap();
        assert!(EnrollmentTableManager
            .prune_latest_sql(&ctx, &enrollments[0])
            .is_err());
    }

    #[test]
    fn test_enrollment_has_no_latest() {
        let ctx = ctx(RefreshParams::latest());
        let tables = EnrollmentTableManager.tables(&ctx, &metadata()).unwrap();
        assert!(!EnrollmentTableManager.supports_latest());
        let err = EnrollmentTableManager
            .has_updated_sql(&ctx, &tables[0], ts(2024, 4, 1), ts(2024, 5, 1))
            .unwrap_err();
        assert!(err.to_string().contains("not supported for enrollment tables"));
    }
}
