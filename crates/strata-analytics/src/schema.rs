//! Column derivation from metadata
//!
//! Every table starts from a fixed catalogue for its family. Event tables
//! then get one dynamic column per live metadata item, produced by visiting
//! a closed set of [`MetadataItem`] variants in a stable order:
//!
//! 1. fixed columns
//! 2. attribute categories
//! 3. org unit hierarchy levels, name hierarchy, group sets, period types
//! 4. data elements, then tracked attributes
//! 5. legend set variants of data elements, then of tracked attributes
//!
//! Raw numeric and date values are matched against a pattern inside the
//! column's subquery, so a malformed stored value yields NULL instead of a
//! cast failure that would abort the whole insert.

use chrono::{DateTime, Utc};
use strata_rdbc::{SqlDialect, SqlType};

use crate::config::TableSettings;
use crate::error::Result;
use crate::metadata::{
    Category, DataElement, LegendSet, MetadataSnapshot, OrgUnitGroupSet, Program,
    TrackedAttribute, ValueType,
};
use crate::model::{dedup_columns, Column, IndexHint};
use crate::template::{SqlParam, SqlTemplate, StatementKind, TemplateParams};

/// Lenient numeric pattern; accepts `1`, `-1.5`, `.5`, `2e10`
pub const NUMERIC_PATTERN: &str = r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$";

/// Whole numbers that fit a bigint
pub const INTEGER_PATTERN: &str = r"^[+-]?\d{1,18}$";

/// Date and date-time pattern
pub const DATE_PATTERN: &str =
    r"^\d{4}-\d{2}-\d{2}(\s|T)?((\d{2}:)(\d{2}:)?(\d{2}))?(|.(\d{3})|.(\d{3})Z)?$";

/// Suffix of the resolved org unit name column
pub const ORG_UNIT_NAME_SUFFIX: &str = "_name";

/// Suffix of the resolved org unit geometry column
pub const ORG_UNIT_GEOMETRY_SUFFIX: &str = "_geom";

/// Period type columns of the date-period structure
pub const PERIOD_TYPE_COLUMNS: &[&str] = &[
    "daily",
    "weekly",
    "weeklywednesday",
    "weeklythursday",
    "weeklysaturday",
    "weeklysunday",
    "biweekly",
    "monthly",
    "bimonthly",
    "quarterly",
    "quarterlynov",
    "sixmonthly",
    "sixmonthlyapril",
    "sixmonthlynov",
    "yearly",
    "financialapril",
    "financialjuly",
    "financialoct",
    "financialnov",
];

#[derive(Debug, Clone, Copy)]
enum Expr {
    Raw(&'static str),
    /// Client-supplied timestamp when present, else the server one
    PreferClient {
        client: &'static str,
        server: &'static str,
    },
    /// Text field of a JSON user-info column
    UserInfo {
        column: &'static str,
        key: &'static str,
    },
    /// "surname, firstName (username)" from a JSON user-info column
    UserDisplayName(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct FixedColumn {
    name: &'static str,
    data_type: SqlType,
    not_null: bool,
    expr: Expr,
    /// Needs the spatial extension even though the type is not geometry
    spatial: bool,
}

const fn col(name: &'static str, data_type: SqlType, expr: Expr) -> FixedColumn {
    FixedColumn {
        name,
        data_type,
        not_null: false,
        expr,
        spatial: false,
    }
}

const fn required(name: &'static str, data_type: SqlType, expr: Expr) -> FixedColumn {
    FixedColumn {
        not_null: true,
        ..col(name, data_type, expr)
    }
}

const fn spatial(name: &'static str, data_type: SqlType, expr: Expr) -> FixedColumn {
    FixedColumn {
        spatial: true,
        ..col(name, data_type, expr)
    }
}

const UID: SqlType = SqlType::CharacterFixed(11);
const NAME: SqlType = SqlType::Varchar(255);
const STATUS: SqlType = SqlType::Varchar(50);

const EVENT_COLUMNS: &[FixedColumn] = &[
    required("psi", UID, Expr::Raw("psi.uid")),
    required("pi", UID, Expr::Raw("pi.uid")),
    required("ps", UID, Expr::Raw("ps.uid")),
    required("ao", UID, Expr::Raw("ao.uid")),
    col("enrollmentdate", SqlType::Timestamp, Expr::Raw("pi.enrollmentdate")),
    col("incidentdate", SqlType::Timestamp, Expr::Raw("pi.occurreddate")),
    col("occurreddate", SqlType::Timestamp, Expr::Raw("psi.occurreddate")),
    col("scheduleddate", SqlType::Timestamp, Expr::Raw("psi.scheduleddate")),
    col("completeddate", SqlType::Timestamp, Expr::Raw("psi.completeddate")),
    col(
        "created",
        SqlType::Timestamp,
        Expr::PreferClient {
            client: "psi.createdatclient",
            server: "psi.created",
        },
    ),
    col(
        "lastupdated",
        SqlType::Timestamp,
        Expr::PreferClient {
            client: "psi.lastupdatedatclient",
            server: "psi.lastupdated",
        },
    ),
    col("storedby", NAME, Expr::Raw("psi.storedby")),
    col(
        "createdbyusername",
        NAME,
        Expr::UserInfo {
            column: "psi.createdbyuserinfo",
            key: "username",
        },
    ),
    col(
        "createdbyname",
        NAME,
        Expr::UserInfo {
            column: "psi.createdbyuserinfo",
            key: "firstName",
        },
    ),
    col(
        "createdbylastname",
        NAME,
        Expr::UserInfo {
            column: "psi.createdbyuserinfo",
            key: "surname",
        },
    ),
    col(
        "createdbydisplayname",
        NAME,
        Expr::UserDisplayName("psi.createdbyuserinfo"),
    ),
    col(
        "lastupdatedbyusername",
        NAME,
        Expr::UserInfo {
            column: "psi.lastupdatedbyuserinfo",
            key: "username",
        },
    ),
    col(
        "lastupdatedbyname",
        NAME,
        Expr::UserInfo {
            column: "psi.lastupdatedbyuserinfo",
            key: "firstName",
        },
    ),
    col(
        "lastupdatedbylastname",
        NAME,
        Expr::UserInfo {
            column: "psi.lastupdatedbyuserinfo",
            key: "surname",
        },
    ),
    col(
        "lastupdatedbydisplayname",
        NAME,
        Expr::UserDisplayName("psi.lastupdatedbyuserinfo"),
    ),
    col("psistatus", STATUS, Expr::Raw("psi.status")),
    col("pistatus", STATUS, Expr::Raw("pi.status")),
    col("psigeometry", SqlType::Geometry, Expr::Raw("psi.geometry")),
    spatial(
        "longitude",
        SqlType::Double,
        Expr::Raw("CASE WHEN 'POINT' = GeometryType(psi.geometry) THEN ST_X(psi.geometry) ELSE null END"),
    ),
    spatial(
        "latitude",
        SqlType::Double,
        Expr::Raw("CASE WHEN 'POINT' = GeometryType(psi.geometry) THEN ST_Y(psi.geometry) ELSE null END"),
    ),
    required("ou", UID, Expr::Raw("ou.uid")),
    required("ouname", SqlType::Text, Expr::Raw("ou.name")),
    col("oucode", SqlType::Text, Expr::Raw("ou.code")),
    col("oulevel", SqlType::Integer, Expr::Raw("ous.level")),
    col("ougeometry", SqlType::Geometry, Expr::Raw("ou.geometry")),
    col("pigeometry", SqlType::Geometry, Expr::Raw("pi.geometry")),
    required(
        "registrationou",
        UID,
        Expr::Raw("coalesce(registrationou.uid,ou.uid)"),
    ),
    required(
        "enrollmentou",
        UID,
        Expr::Raw("coalesce(enrollmentou.uid,ou.uid)"),
    ),
];

/// Appended to the event catalogue for programs with registration
const REGISTRATION_COLUMNS: &[FixedColumn] = &[
    col("tei", UID, Expr::Raw("tei.uid")),
    col("teigeometry", SqlType::Geometry, Expr::Raw("tei.geometry")),
];

const ENROLLMENT_COLUMNS: &[FixedColumn] = &[
    required("trackedentityinstanceuid", UID, Expr::Raw("tei.uid")),
    col("programuid", UID, Expr::Raw("p.uid")),
    col("programinstanceuid", UID, Expr::Raw("pi.uid")),
    col("enrollmentdate", SqlType::Timestamp, Expr::Raw("pi.enrollmentdate")),
    col("enddate", SqlType::Timestamp, Expr::Raw("pi.completeddate")),
    col("incidentdate", SqlType::Timestamp, Expr::Raw("pi.occurreddate")),
    col("enrollmentstatus", STATUS, Expr::Raw("pi.status")),
    col("pigeometry", SqlType::Geometry, Expr::Raw("pi.geometry")),
    spatial(
        "pilongitude",
        SqlType::Double,
        Expr::Raw("case when 'POINT' = GeometryType(pi.geometry) then ST_X(pi.geometry) end"),
    ),
    spatial(
        "pilatitude",
        SqlType::Double,
        Expr::Raw("case when 'POINT' = GeometryType(pi.geometry) then ST_Y(pi.geometry) end"),
    ),
    col("uidlevel1", UID, Expr::Raw("ous.uidlevel1")),
    col("uidlevel2", UID, Expr::Raw("ous.uidlevel2")),
    col("uidlevel3", UID, Expr::Raw("ous.uidlevel3")),
    col("uidlevel4", UID, Expr::Raw("ous.uidlevel4")),
    col("ou", UID, Expr::Raw("ou.uid")),
    col("ouname", NAME, Expr::Raw("ou.name")),
    col("oucode", SqlType::CharacterFixed(32), Expr::Raw("ou.code")),
    col("oulevel", SqlType::Integer, Expr::Raw("ous.level")),
];

const DATA_ELEMENT_VALUE: SqlTemplate = SqlTemplate::new(
    StatementKind::ColumnExpression,
    "(select ${value} from event where eventid=psi.eventid${dataClause}) as ${column}",
);

const DATA_ELEMENT_ORG_UNIT: SqlTemplate = SqlTemplate::new(
    StatementKind::ColumnExpression,
    "(select ${select} from organisationunit ou where ou.uid = \
     (select ${value} from event where eventid=psi.eventid${dataClause})) as ${column}",
);

const DATA_ELEMENT_LEGEND: SqlTemplate = SqlTemplate::new(
    StatementKind::ColumnExpression,
    "(select l.uid from maplegend l inner join event on l.startvalue <= ${value} \
     and l.endvalue > ${value} and l.maplegendsetid=${legendSetId} \
     and eventid=psi.eventid${dataClause}) as ${column}",
);

const ATTRIBUTE_VALUE: SqlTemplate = SqlTemplate::new(
    StatementKind::ColumnExpression,
    "(select ${value} from trackedentityattributevalue where trackedentityid=pi.trackedentityid \
     and trackedentityattributeid=${attributeId}${dataClause}) as ${column}",
);

const ATTRIBUTE_ORG_UNIT: SqlTemplate = SqlTemplate::new(
    StatementKind::ColumnExpression,
    "(select ${select} from organisationunit ou where ou.uid = \
     (select ${value} from trackedentityattributevalue where trackedentityid=pi.trackedentityid \
     and trackedentityattributeid=${attributeId}${dataClause})) as ${column}",
);

const ATTRIBUTE_LEGEND: SqlTemplate = SqlTemplate::new(
    StatementKind::ColumnExpression,
    "(select l.uid from maplegend l inner join trackedentityattributevalue av \
     on l.startvalue <= ${value} and l.endvalue > ${value} \
     and l.maplegendsetid=${legendSetId} and av.trackedentityid=pi.trackedentityid \
     and av.trackedentityattributeid=${attributeId}${dataClause}) as ${column}",
);

/// A metadata item that contributes dynamic columns
#[derive(Debug, Clone, Copy)]
pub enum MetadataItem<'a> {
    Category(&'a Category),
    GroupSet(&'a OrgUnitGroupSet),
    DataElement(&'a DataElement),
    Attribute(&'a TrackedAttribute),
    DataElementLegend(&'a DataElement, &'a LegendSet),
    AttributeLegend(&'a TrackedAttribute, &'a LegendSet),
}

/// Derives the column list of analytics tables
pub struct SchemaDeriver<'a> {
    dialect: &'a dyn SqlDialect,
    settings: &'a TableSettings,
    spatial: bool,
    org_unit_levels: u32,
    group_sets: &'a [OrgUnitGroupSet],
}

impl<'a> SchemaDeriver<'a> {
    pub fn new(
        dialect: &'a dyn SqlDialect,
        settings: &'a TableSettings,
        spatial: bool,
        metadata: &'a MetadataSnapshot,
    ) -> Self {
        Self {
            dialect,
            settings,
            spatial,
            org_unit_levels: metadata.org_unit_levels,
            group_sets: &metadata.org_unit_group_sets,
        }
    }

    /// Ordered, de-duplicated columns of a program's event table
    pub fn event_columns(&self, program: &Program) -> Result<Vec<Column>> {
        let mut columns = self.fixed_columns(EVENT_COLUMNS);
        if program.registration {
            columns.extend(self.fixed_columns(REGISTRATION_COLUMNS));
        }

        for category in &program.categories {
            self.visit(MetadataItem::Category(category), &mut columns)?;
        }

        columns.extend(self.org_unit_level_columns());
        columns.push(self.org_unit_name_hierarchy_column());
        for group_set in self.group_sets {
            self.visit(MetadataItem::GroupSet(group_set), &mut columns)?;
        }
        columns.extend(self.period_type_columns());

        for de in program.analytics_data_elements() {
            self.visit(MetadataItem::DataElement(de), &mut columns)?;
        }
        for attribute in program.analytics_attributes() {
            self.visit(MetadataItem::Attribute(attribute), &mut columns)?;
        }
        for de in program.analytics_data_elements() {
            for ls in &de.legend_sets {
                self.visit(MetadataItem::DataElementLegend(de, ls), &mut columns)?;
            }
        }
        for attribute in program.analytics_attributes() {
            for ls in &attribute.legend_sets {
                self.visit(MetadataItem::AttributeLegend(attribute, ls), &mut columns)?;
            }
        }

        Ok(dedup_columns(columns))
    }

    /// Columns of a tracked-entity type's enrollment table
    pub fn enrollment_columns(&self) -> Vec<Column> {
        let mut columns = self.fixed_columns(ENROLLMENT_COLUMNS);
        columns.push(self.org_unit_name_hierarchy_column());
        dedup_columns(columns)
    }

    /// Append the columns one metadata item contributes
    pub fn visit(&self, item: MetadataItem<'_>, out: &mut Vec<Column>) -> Result<()> {
        match item {
            MetadataItem::Category(category) => {
                if category.data_dimension {
                    out.push(self.dimension_column(
                        &category.uid,
                        "acs",
                        category.created,
                        self.settings.index_category_columns,
                    ));
                }
            }
            MetadataItem::GroupSet(group_set) => {
                if group_set.data_dimension {
                    out.push(self.dimension_column(
                        &group_set.uid,
                        "ougs",
                        group_set.created,
                        self.settings.index_org_unit_group_set_columns,
                    ));
                }
            }
            MetadataItem::DataElement(de) => self.data_element_columns(de, out)?,
            MetadataItem::Attribute(attribute) => self.attribute_columns(attribute, out)?,
            MetadataItem::DataElementLegend(de, ls) => {
                if let Some(column) = self.data_element_legend_column(de, ls)? {
                    out.push(column);
                }
            }
            MetadataItem::AttributeLegend(attribute, ls) => {
                if let Some(column) = self.attribute_legend_column(attribute, ls)? {
                    out.push(column);
                }
            }
        }
        Ok(())
    }

    fn fixed_columns(&self, catalogue: &[FixedColumn]) -> Vec<Column> {
        catalogue
            .iter()
            .filter(|c| self.spatial || !(c.spatial || c.data_type.is_spatial()))
            .map(|c| {
                let mut column = Column::fixed(c.name, c.data_type, self.render_expr(c.expr));
                if c.not_null {
                    column = column.not_null();
                }
                if c.data_type.is_spatial() {
                    column = column.with_index(IndexHint::Spatial);
                }
                column
            })
            .collect()
    }

    fn render_expr(&self, expr: Expr) -> String {
        match expr {
            Expr::Raw(sql) => sql.to_string(),
            Expr::PreferClient { client, server } => format!(
                "case when {} is not null then {} else {} end",
                client, client, server
            ),
            Expr::UserInfo { column, key } => self.dialect.json_extract_text(column, key),
            Expr::UserDisplayName(column) => format!(
                "concat({}, ', ', {}, ' (', {}, ')')",
                self.dialect.json_extract_text(column, "surname"),
                self.dialect.json_extract_text(column, "firstName"),
                self.dialect.json_extract_text(column, "username"),
            ),
        }
    }

    fn dimension_column(
        &self,
        uid: &str,
        alias: &str,
        created: Option<DateTime<Utc>>,
        indexed: bool,
    ) -> Column {
        let index = if indexed {
            IndexHint::Default
        } else {
            IndexHint::Skip
        };
        Column::dynamic(
            uid,
            UID,
            format!("{}.{}", alias, self.dialect.quote_identifier(uid)),
        )
        .with_index(index)
        .with_created(created)
    }

    fn org_unit_level_columns(&self) -> Vec<Column> {
        (1..=self.org_unit_levels)
            .map(|level| {
                let name = format!("uidlevel{}", level);
                let select = format!("ous.{}", self.dialect.quote_identifier(&name));
                Column::fixed(name, UID, select)
            })
            .collect()
    }

    fn org_unit_name_hierarchy_column(&self) -> Column {
        let select = if self.org_unit_levels == 0 {
            "cast(null as text)".to_string()
        } else {
            let names: Vec<String> = (1..=self.org_unit_levels)
                .map(|level| {
                    format!(
                        "ous.{}",
                        self.dialect
                            .quote_identifier(&format!("namelevel{}", level))
                    )
                })
                .collect();
            format!("concat_ws(' / ', {})", names.join(", "))
        };
        Column::fixed("ounamehierarchy", SqlType::Text, select).with_index(IndexHint::Skip)
    }

    fn period_type_columns(&self) -> Vec<Column> {
        PERIOD_TYPE_COLUMNS
            .iter()
            .map(|name| {
                Column::fixed(
                    *name,
                    SqlType::Text,
                    format!("dps.{}", self.dialect.quote_identifier(name)),
                )
            })
            .collect()
    }

    /// Physical type of a value column, `None` when unsupported
    fn value_column_type(&self, value_type: &ValueType) -> Option<SqlType> {
        let data_type = match value_type {
            ValueType::Unsupported(_) => return None,
            vt if vt.is_decimal() => SqlType::Double,
            vt if vt.is_integer() => SqlType::BigInt,
            vt if vt.is_boolean() => SqlType::Integer,
            vt if vt.is_date() => SqlType::Timestamp,
            vt if vt.is_geo() && self.spatial => SqlType::Geometry,
            _ => SqlType::Text,
        };
        Some(data_type)
    }

    /// Expression converting the raw text value to the column type
    fn cast_value(&self, value_type: &ValueType, raw: &str) -> String {
        let cast = |to: SqlType| format!("cast({} as {})", raw, self.dialect.native_type(to));
        match value_type {
            vt if vt.is_decimal() => cast(SqlType::Double),
            vt if vt.is_integer() => cast(SqlType::BigInt),
            vt if vt.is_boolean() => format!(
                "case when {} = 'true' then 1 when {} = 'false' then 0 else null end",
                raw, raw
            ),
            vt if vt.is_date() => cast(SqlType::Timestamp),
            ValueType::Coordinate if self.spatial => format!(
                "ST_GeomFromGeoJSON('{{\"type\":\"Point\", \"coordinates\":' || ({}) || ', \
                 \"crs\":{{\"type\":\"name\", \"properties\":{{\"name\":\"EPSG:4326\"}}}}}}')",
                raw
            ),
            ValueType::GeoJson if self.spatial => format!("ST_GeomFromGeoJSON({})", raw),
            _ => raw.to_string(),
        }
    }

    /// Pattern guard for numeric and date values, empty otherwise
    fn data_clause(&self, value_type: &ValueType, raw: &str) -> String {
        let pattern = if value_type.is_integer() {
            INTEGER_PATTERN
        } else if value_type.is_decimal() {
            NUMERIC_PATTERN
        } else if value_type.is_date() {
            DATE_PATTERN
        } else {
            return String::new();
        };
        format!(" and {}", self.dialect.regex_match(raw, pattern))
    }

    fn index_hint(value_type: &ValueType, option_set: &Option<String>) -> IndexHint {
        if value_type.is_unindexed_text() && option_set.is_none() {
            IndexHint::Skip
        } else {
            IndexHint::Default
        }
    }

    fn data_element_raw(&self, uid: &str) -> String {
        self.dialect.json_path_text("eventdatavalues", &[uid, "value"])
    }

    fn data_element_columns(&self, de: &DataElement, out: &mut Vec<Column>) -> Result<()> {
        let Some(data_type) = self.value_column_type(&de.value_type) else {
            tracing::debug!(
                "Data element '{}' has unsupported value type '{}', no column derived",
                de.uid,
                de.value_type
            );
            return Ok(());
        };

        let raw = self.data_element_raw(&de.uid);
        let data_clause = self.data_clause(&de.value_type, &raw);
        let select = DATA_ELEMENT_VALUE.render(
            &TemplateParams::new()
                .set("value", SqlParam::fragment(self.cast_value(&de.value_type, &raw)))
                .set("dataClause", SqlParam::fragment(data_clause.clone()))
                .set("column", SqlParam::identifier(de.uid.clone())),
            self.dialect,
        )?;
        out.push(
            Column::dynamic(de.uid.clone(), data_type, select)
                .with_index(Self::index_hint(&de.value_type, &de.option_set)),
        );

        if de.value_type.is_org_unit() {
            for (suffix, field) in self.org_unit_lookups() {
                let name = format!("{}{}", de.uid, suffix);
                let select = DATA_ELEMENT_ORG_UNIT.render(
                    &TemplateParams::new()
                        .set("select", SqlParam::fragment(field.0))
                        .set("value", SqlParam::fragment(raw.clone()))
                        .set("dataClause", SqlParam::fragment(data_clause.clone()))
                        .set("column", SqlParam::identifier(name.clone())),
                    self.dialect,
                )?;
                out.push(Column::dynamic(name, field.1, select).with_index(field.2));
            }
        }
        Ok(())
    }

    fn attribute_columns(&self, attribute: &TrackedAttribute, out: &mut Vec<Column>) -> Result<()> {
        let Some(data_type) = self.value_column_type(&attribute.value_type) else {
            tracing::debug!(
                "Tracked attribute '{}' has unsupported value type '{}', no column derived",
                attribute.uid,
                attribute.value_type
            );
            return Ok(());
        };

        let data_clause = self.data_clause(&attribute.value_type, "value");
        let select = ATTRIBUTE_VALUE.render(
            &TemplateParams::new()
                .set(
                    "value",
                    SqlParam::fragment(self.cast_value(&attribute.value_type, "value")),
                )
                .set("attributeId", SqlParam::integer(attribute.id))
                .set("dataClause", SqlParam::fragment(data_clause.clone()))
                .set("column", SqlParam::identifier(attribute.uid.clone())),
            self.dialect,
        )?;
        out.push(
            Column::dynamic(attribute.uid.clone(), data_type, select)
                .with_index(Self::index_hint(&attribute.value_type, &attribute.option_set)),
        );

        if attribute.value_type.is_org_unit() {
            for (suffix, field) in self.org_unit_lookups() {
                let name = format!("{}{}", attribute.uid, suffix);
                let select = ATTRIBUTE_ORG_UNIT.render(
                    &TemplateParams::new()
                        .set("select", SqlParam::fragment(field.0))
                        .set("value", SqlParam::fragment("value"))
                        .set("attributeId", SqlParam::integer(attribute.id))
                        .set("dataClause", SqlParam::fragment(data_clause.clone()))
                        .set("column", SqlParam::identifier(name.clone())),
                    self.dialect,
                )?;
                out.push(Column::dynamic(name, field.1, select).with_index(field.2));
            }
        }
        Ok(())
    }

    /// Name lookup, plus geometry lookup with spatial support
    fn org_unit_lookups(&self) -> Vec<(&'static str, (&'static str, SqlType, IndexHint))> {
        let mut lookups = vec![(
            ORG_UNIT_NAME_SUFFIX,
            ("ou.name", SqlType::Text, IndexHint::Skip),
        )];
        if self.spatial {
            lookups.push((
                ORG_UNIT_GEOMETRY_SUFFIX,
                ("ou.geometry", SqlType::Geometry, IndexHint::Spatial),
            ));
        }
        lookups
    }

    fn data_element_legend_column(
        &self,
        de: &DataElement,
        legend_set: &LegendSet,
    ) -> Result<Option<Column>> {
        if !de.value_type.is_numeric() {
            tracing::debug!(
                "Legend set '{}' ignored on non-numeric data element '{}'",
                legend_set.uid,
                de.uid
            );
            return Ok(None);
        }
        let raw = self.data_element_raw(&de.uid);
        let name = format!("{}_{}", de.uid, legend_set.uid);
        let select = DATA_ELEMENT_LEGEND.render(
            &TemplateParams::new()
                .set("value", SqlParam::fragment(self.cast_value(&de.value_type, &raw)))
                .set("legendSetId", SqlParam::integer(legend_set.id))
                .set(
                    "dataClause",
                    SqlParam::fragment(self.data_clause(&de.value_type, &raw)),
                )
                .set("column", SqlParam::identifier(name.clone())),
            self.dialect,
        )?;
        Ok(Some(Column::dynamic(name, UID, select)))
    }

    fn attribute_legend_column(
        &self,
        attribute: &TrackedAttribute,
        legend_set: &LegendSet,
    ) -> Result<Option<Column>> {
        if !attribute.value_type.is_numeric() {
            tracing::debug!(
                "Legend set '{}' ignored on non-numeric attribute '{}'",
                legend_set.uid,
                attribute.uid
            );
            return Ok(None);
        }
        let name = format!("{}_{}", attribute.uid, legend_set.uid);
        let select = ATTRIBUTE_LEGEND.render(
            &TemplateParams::new()
                .set(
                    "value",
                    SqlParam::fragment(self.cast_value(&attribute.value_type, "av.value")),
                )
                .set("legendSetId", SqlParam::integer(legend_set.id))
                .set("attributeId", SqlParam::integer(attribute.id))
                .set(
                    "dataClause",
                    SqlParam::fragment(self.data_clause(&attribute.value_type, "av.value")),
                )
                .set("column", SqlParam::identifier(name.clone())),
            self.dialect,
        )?;
        Ok(Some(Column::dynamic(name, UID, select)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::StaticMetadata;
    use crate::model::ColumnKind;
    use strata_rdbc::PostgresDialect;

    const METADATA: &str = r#"
org_unit_levels: 3
org_unit_group_sets:
  - { uid: J5jldMd8OHv, name: Facility Type }
  - { uid: Bpx0589u8y0, name: Ownership, data_dimension: false }
programs:
  - id: 1
    uid: IpHINAT79UW
    name: Child Programme
    registration: true
    categories:
      - { uid: fMZEcRHuamy, name: Location and age }
    data_elements:
      - id: 11
        uid: cYeuwXTCPkU
        name: Weight
        value_type: NUMBER
        legend_sets:
          - { id: 5, uid: fqs276KXCXi }
      - id: 12
        uid: GieVkTxp4HH
        name: Signature
        value_type: SIGNATURE_PAD
      - id: 13
        uid: qrur9Dvnyt5
        name: Referral facility
        value_type: ORGANISATION_UNIT
      - id: 14
        uid: oZg33kd9taw
        name: Comment
        value_type: TEXT
      - id: 15
        uid: x7PaHGvgWY2
        name: Removed
        value_type: NUMBER
        deleted: true
    attributes:
      - id: 21
        uid: iESIqZ0R0R0
        name: Birth date
        value_type: DATE
      - id: 22
        uid: zDhUuAYrxNC
        name: National id
        value_type: TEXT
        confidential: true
"#;

    fn snapshot() -> MetadataSnapshot {
        let m = StaticMetadata::from_yaml(METADATA).unwrap();
        MetadataSnapshot {
            programs: m.programs,
            tracked_entity_types: m.tracked_entity_types,
            org_unit_levels: m.org_unit_levels,
            org_unit_group_sets: m.org_unit_group_sets,
        }
    }

    fn names(columns: &[Column]) -> Vec<&str> {
        columns.iter().map(|c| c.name.as_str()).collect()
    }

    fn find<'c>(columns: &'c [Column], name: &str) -> &'c Column {
        columns.iter().find(|c| c.name == name).unwrap()
    }

    #[test]
    fn test_event_column_order() {
        let metadata = snapshot();
        let settings = TableSettings::default();
        let deriver = SchemaDeriver::new(&PostgresDialect, &settings, true, &metadata);
        let columns = deriver.event_columns(&metadata.programs[0]).unwrap();
        let names = names(&columns);

        let pos = |n: &str| names.iter().position(|c| *c == n).unwrap();
        assert_eq!(names[0], "psi");
        assert!(pos("enrollmentou") < pos("tei"));
        assert!(pos("teigeometry") < pos("fMZEcRHuamy"));
        assert!(pos("fMZEcRHuamy") < pos("uidlevel1"));
        assert!(pos("uidlevel3") < pos("ounamehierarchy"));
        assert!(pos("ounamehierarchy") < pos("J5jldMd8OHv"));
        assert!(pos("J5jldMd8OHv") < pos("daily"));
        assert!(pos("financialnov") < pos("cYeuwXTCPkU"));
        assert!(pos("cYeuwXTCPkU") < pos("iESIqZ0R0R0"));
        assert!(pos("iESIqZ0R0R0") < pos("cYeuwXTCPkU_fqs276KXCXi"));

        assert!(!names.contains(&"uidlevel4"));
        assert!(!names.contains(&"Bpx0589u8y0"));
        assert!(!names.contains(&"GieVkTxp4HH"));
        assert!(!names.contains(&"x7PaHGvgWY2"));
        assert!(!names.contains(&"zDhUuAYrxNC"));
    }

    #[test]
    fn test_derivation_is_stable() {
        let metadata = snapshot();
        let settings = TableSettings::default();
        let deriver = SchemaDeriver::new(&PostgresDialect, &settings, true, &metadata);
        let first = deriver.event_columns(&metadata.programs[0]).unwrap();
        let second = deriver.event_columns(&metadata.programs[0]).unwrap();
        assert_eq!(first, second);

        let again = dedup_columns(first.clone());
        assert_eq!(again, first);
    }

    #[test]
    fn test_integer_value_guarded_by_whole_number_pattern() {
        let mut metadata = snapshot();
        metadata.programs[0].data_elements[0].value_type = ValueType::Integer;
        let settings = TableSettings::default();
        let deriver = SchemaDeriver::new(&PostgresDialect, &settings, true, &metadata);
        let columns = deriver.event_columns(&metadata.programs[0]).unwrap();

        let weight = find(&columns, "cYeuwXTCPkU");
        assert_eq!(weight.data_type, SqlType::BigInt);
        assert!(weight.select.contains("as bigint)"));
        assert!(weight.select.contains(&format!("~* '{}'", INTEGER_PATTERN)));
        assert!(!weight.select.contains(NUMERIC_PATTERN));

        let integer = regex::Regex::new(INTEGER_PATTERN).unwrap();
        for accepted in ["42", "-7", "+0", "999999999999999999"] {
            assert!(integer.is_match(accepted), "{}", accepted);
        }
        for rejected in ["1.5", "2e3", ".5", "", "9999999999999999999"] {
            assert!(!integer.is_match(rejected), "{}", rejected);
        }
        assert!(regex::Regex::new(NUMERIC_PATTERN).unwrap().is_match("1.5"));
    }

    #[test]
    fn test_numeric_value_guarded_by_pattern() {
        let metadata = snapshot();
        let settings = TableSettings::default();
        let deriver = SchemaDeriver::new(&PostgresDialect, &settings, true, &metadata);
        let columns = deriver.event_columns(&metadata.programs[0]).unwrap();

        let weight = find(&columns, "cYeuwXTCPkU");
        assert_eq!(weight.data_type, SqlType::Double);
        assert_eq!(weight.kind, ColumnKind::Dynamic);
        assert_eq!(
            weight.select,
            format!(
                "(select cast(eventdatavalues #>> '{{cYeuwXTCPkU, value}}' as double precision) \
                 from event where eventid=psi.eventid and eventdatavalues #>> '{{cYeuwXTCPkU, value}}' \
                 ~* '{}') as \"cYeuwXTCPkU\"",
                NUMERIC_PATTERN
            )
        );

        let birth = find(&columns, "iESIqZ0R0R0");
        assert_eq!(birth.data_type, SqlType::Timestamp);
        assert!(birth.select.contains("trackedentityattributeid=21 and value ~* '"));
        assert!(birth.select.contains(DATE_PATTERN));
    }

    #[test]
    fn test_text_without_option_set_skips_index() {
        let metadata = snapshot();
        let settings = TableSettings::default();
        let deriver = SchemaDeriver::new(&PostgresDialect, &settings, true, &metadata);
        let columns = deriver.event_columns(&metadata.programs[0]).unwrap();

        let comment = find(&columns, "oZg33kd9taw");
        assert_eq!(comment.index, IndexHint::Skip);
        assert!(!comment.select.contains("~*"));
    }

    #[test]
    fn test_org_unit_item_columns() {
        let metadata = snapshot();
        let settings = TableSettings::default();

        let spatial = SchemaDeriver::new(&PostgresDialect, &settings, true, &metadata)
            .event_columns(&metadata.programs[0])
            .unwrap();
        let name = find(&spatial, "qrur9Dvnyt5_name");
        assert_eq!(name.index, IndexHint::Skip);
        assert!(name
            .select
            .starts_with("(select ou.name from organisationunit ou where ou.uid = (select eventdatavalues"));
        assert_eq!(find(&spatial, "qrur9Dvnyt5_geom").data_type, SqlType::Geometry);

        let plain = SchemaDeriver::new(&PostgresDialect, &settings, false, &metadata)
            .event_columns(&metadata.programs[0])
            .unwrap();
        let names = names(&plain);
        assert!(names.contains(&"qrur9Dvnyt5_name"));
        assert!(!names.contains(&"qrur9Dvnyt5_geom"));
        assert!(!names.contains(&"psigeometry"));
        assert!(!names.contains(&"longitude"));
        assert!(!names.contains(&"teigeometry"));
    }

    #[test]
    fn test_legend_column() {
        let metadata = snapshot();
        let settings = TableSettings::default();
        let deriver = SchemaDeriver::new(&PostgresDialect, &settings, true, &metadata);
        let columns = deriver.event_columns(&metadata.programs[0]).unwrap();

        let legend = find(&columns, "cYeuwXTCPkU_fqs276KXCXi");
        assert_eq!(legend.data_type, SqlType::CharacterFixed(11));
        assert!(legend.select.contains("l.maplegendsetid=5"));
        assert!(legend.select.ends_with("as \"cYeuwXTCPkU_fqs276KXCXi\""));
    }

    #[test]
    fn test_client_timestamps_preferred() {
        let metadata = snapshot();
        let settings = TableSettings::default();
        let deriver = SchemaDeriver::new(&PostgresDialect, &settings, true, &metadata);
        let columns = deriver.event_columns(&metadata.programs[0]).unwrap();

        assert_eq!(
            find(&columns, "created").select,
            "case when psi.createdatclient is not null then psi.createdatclient else psi.created end"
        );
        assert_eq!(
            find(&columns, "createdbyusername").select,
            "psi.createdbyuserinfo ->> 'username'"
        );
    }

    #[test]
    fn test_dimension_index_switches() {
        let metadata = snapshot();
        let settings = TableSettings {
            index_category_columns: false,
            ..TableSettings::default()
        };
        let deriver = SchemaDeriver::new(&PostgresDialect, &settings, true, &metadata);
        let columns = deriver.event_columns(&metadata.programs[0]).unwrap();

        assert_eq!(find(&columns, "fMZEcRHuamy").index, IndexHint::Skip);
        assert_eq!(find(&columns, "fMZEcRHuamy").select, "acs.\"fMZEcRHuamy\"");
        assert_eq!(find(&columns, "J5jldMd8OHv").index, IndexHint::Default);
    }

    #[test]
    fn test_enrollment_columns() {
        let metadata = snapshot();
        let settings = TableSettings::default();
        let columns = SchemaDeriver::new(&PostgresDialect, &settings, false, &metadata)
            .enrollment_columns();
        let names = names(&columns);
        assert_eq!(names[0], "trackedentityinstanceuid");
        assert_eq!(*names.last().unwrap(), "ounamehierarchy");
        assert!(!names.contains(&"pigeometry"));
        assert!(!names.contains(&"pilongitude"));
    }
}
