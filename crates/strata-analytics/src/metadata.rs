//! Read-only metadata model and the provider seam
//!
//! The engine never mutates metadata. A [`MetadataProvider`] hands out
//! subjects and the items hanging off them; [`StaticMetadata`] is the
//! file-backed provider used by the CLI and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::{AnalyticsError, Result};

/// Value type of a data element or tracked attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValueType {
    Text,
    LongText,
    MultiText,
    Letter,
    PhoneNumber,
    Email,
    Boolean,
    TrueOnly,
    Date,
    DateTime,
    Time,
    Number,
    UnitInterval,
    Percentage,
    Integer,
    IntegerPositive,
    IntegerNegative,
    IntegerZeroOrPositive,
    TrackerAssociate,
    Username,
    Coordinate,
    OrganisationUnit,
    Reference,
    Age,
    Url,
    FileResource,
    Image,
    GeoJson,
    /// A type this engine does not know; items of this type get no column
    Unsupported(String),
}

const VALUE_TYPE_KEYS: &[(&str, ValueType)] = &[
    ("TEXT", ValueType::Text),
    ("LONG_TEXT", ValueType::LongText),
    ("MULTI_TEXT", ValueType::MultiText),
    ("LETTER", ValueType::Letter),
    ("PHONE_NUMBER", ValueType::PhoneNumber),
    ("EMAIL", ValueType::Email),
    ("BOOLEAN", ValueType::Boolean),
    ("TRUE_ONLY", ValueType::TrueOnly),
    ("DATE", ValueType::Date),
    ("DATETIME", ValueType::DateTime),
    ("TIME", ValueType::Time),
    ("NUMBER", ValueType::Number),
    ("UNIT_INTERVAL", ValueType::UnitInterval),
    ("PERCENTAGE", ValueType::Percentage),
    ("INTEGER", ValueType::Integer),
    ("INTEGER_POSITIVE", ValueType::IntegerPositive),
    ("INTEGER_NEGATIVE", ValueType::IntegerNegative),
    ("INTEGER_ZERO_OR_POSITIVE", ValueType::IntegerZeroOrPositive),
    ("TRACKER_ASSOCIATE", ValueType::TrackerAssociate),
    ("USERNAME", ValueType::Username),
    ("COORDINATE", ValueType::Coordinate),
    ("ORGANISATION_UNIT", ValueType::OrganisationUnit),
    ("REFERENCE", ValueType::Reference),
    ("AGE", ValueType::Age),
    ("URL", ValueType::Url),
    ("FILE_RESOURCE", ValueType::FileResource),
    ("IMAGE", ValueType::Image),
    ("GEOJSON", ValueType::GeoJson),
];

impl From<String> for ValueType {
    fn from(key: String) -> Self {
        VALUE_TYPE_KEYS
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
            .map(|(_, vt)| vt.clone())
            .unwrap_or(ValueType::Unsupported(key))
    }
}

impl From<ValueType> for String {
    fn from(vt: ValueType) -> Self {
        vt.key().to_string()
    }
}

impl ValueType {
    /// Canonical upper-case key
    pub fn key(&self) -> &str {
        match self {
            Self::Unsupported(key) => key,
            known => VALUE_TYPE_KEYS
                .iter()
                .find(|(_, vt)| vt == known)
                .map(|(k, _)| *k)
                .unwrap_or("UNSUPPORTED"),
        }
    }

    /// Fractional numbers
    pub fn is_decimal(&self) -> bool {
        matches!(self, Self::Number | Self::UnitInterval | Self::Percentage)
    }

    /// Whole numbers
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Integer
                | Self::IntegerPositive
                | Self::IntegerNegative
                | Self::IntegerZeroOrPositive
        )
    }

    /// Any number
    pub fn is_numeric(&self) -> bool {
        self.is_decimal() || self.is_integer()
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, Self::Boolean | Self::TrueOnly)
    }

    /// Dates and timestamps
    pub fn is_date(&self) -> bool {
        matches!(self, Self::Date | Self::DateTime | Self::Age)
    }

    /// Point or GeoJSON geometry
    pub fn is_geo(&self) -> bool {
        matches!(self, Self::Coordinate | Self::GeoJson)
    }

    pub fn is_org_unit(&self) -> bool {
        matches!(self, Self::OrganisationUnit)
    }

    /// Free text that is not worth indexing unless constrained by an option set
    pub fn is_unindexed_text(&self) -> bool {
        matches!(self, Self::Text | Self::LongText | Self::MultiText)
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Value-to-category mapping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegendSet {
    pub id: i64,
    pub uid: String,
}

/// Data element collected in a program's events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataElement {
    pub id: i64,
    pub uid: String,
    pub name: String,
    pub value_type: ValueType,
    /// UID of the option set constraining values
    #[serde(default)]
    pub option_set: Option<String>,
    #[serde(default)]
    pub legend_sets: Vec<LegendSet>,
    #[serde(default)]
    pub deleted: bool,
}

/// Tracked-entity attribute of a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedAttribute {
    pub id: i64,
    pub uid: String,
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub option_set: Option<String>,
    #[serde(default)]
    pub legend_sets: Vec<LegendSet>,
    /// Confidential attributes never reach analytics tables
    #[serde(default)]
    pub confidential: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// Category of a program's attribute category combo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub uid: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub data_dimension: bool,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

/// Organisation unit group set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgUnitGroupSet {
    pub uid: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub data_dimension: bool,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

/// Program, the subject of an event table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: i64,
    pub uid: String,
    pub name: String,
    /// Programs with registration carry tracked-entity columns
    #[serde(default)]
    pub registration: bool,
    /// Categories of the attribute category combo; empty for the default combo
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub data_elements: Vec<DataElement>,
    #[serde(default)]
    pub attributes: Vec<TrackedAttribute>,
}

impl Program {
    /// Data elements that may produce columns
    pub fn analytics_data_elements(&self) -> impl Iterator<Item = &DataElement> {
        self.data_elements.iter().filter(|de| !de.deleted)
    }

    /// Attributes that may produce columns
    pub fn analytics_attributes(&self) -> impl Iterator<Item = &TrackedAttribute> {
        self.attributes
            .iter()
            .filter(|a| !a.deleted && !a.confidential)
    }
}

/// Tracked-entity type, the subject of an enrollment table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntityType {
    pub id: i64,
    pub uid: String,
    pub name: String,
}

/// Read-only access to metadata
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// All programs
    async fn programs(&self) -> Result<Vec<Program>>;

    /// All tracked-entity types
    async fn tracked_entity_types(&self) -> Result<Vec<TrackedEntityType>>;

    /// Depth of the organisation unit hierarchy
    async fn org_unit_levels(&self) -> Result<u32>;

    /// Organisation unit group sets
    async fn org_unit_group_sets(&self) -> Result<Vec<OrgUnitGroupSet>>;
}

/// Everything one run needs from metadata, loaded once during planning
#[derive(Debug, Clone, Default)]
pub struct MetadataSnapshot {
    pub programs: Vec<Program>,
    pub tracked_entity_types: Vec<TrackedEntityType>,
    pub org_unit_levels: u32,
    pub org_unit_group_sets: Vec<OrgUnitGroupSet>,
}

impl MetadataSnapshot {
    /// Load and check a snapshot
    pub async fn load(provider: &dyn MetadataProvider) -> Result<Self> {
        let snapshot = Self {
            programs: provider.programs().await?,
            tracked_entity_types: provider.tracked_entity_types().await?,
            org_unit_levels: provider.org_unit_levels().await?,
            org_unit_group_sets: provider.org_unit_group_sets().await?,
        };
        snapshot.check()?;
        Ok(snapshot)
    }

    /// Every UID must be well formed and subjects must be unique.
    ///
    /// UIDs end up in table and column names, so a malformed one is a
    /// metadata error for the whole run.
    pub fn check(&self) -> Result<()> {
        let mut subjects = HashSet::new();
        for program in &self.programs {
            check_uid("program", &program.uid)?;
            if !subjects.insert(program.uid.to_ascii_lowercase()) {
                return Err(AnalyticsError::metadata(format!(
                    "duplicate program '{}'",
                    program.uid
                )));
            }
            for category in &program.categories {
                check_uid("category", &category.uid)?;
            }
            for de in &program.data_elements {
                check_uid("data element", &de.uid)?;
                for ls in &de.legend_sets {
                    check_uid("legend set", &ls.uid)?;
                }
            }
            for attribute in &program.attributes {
                check_uid("tracked attribute", &attribute.uid)?;
                for ls in &attribute.legend_sets {
                    check_uid("legend set", &ls.uid)?;
                }
            }
        }

        subjects.clear();
        for tet in &self.tracked_entity_types {
            check_uid("tracked entity type", &tet.uid)?;
            if !subjects.insert(tet.uid.to_ascii_lowercase()) {
                return Err(AnalyticsError::metadata(format!(
                    "duplicate tracked entity type '{}'",
                    tet.uid
                )));
            }
        }

        for group_set in &self.org_unit_group_sets {
            check_uid("org unit group set", &group_set.uid)?;
        }
        Ok(())
    }
}

fn check_uid(what: &str, uid: &str) -> Result<()> {
    strata_rdbc::security::validate_uid(uid)
        .map_err(|e| AnalyticsError::metadata(format!("{} has an invalid UID: {}", what, e)))
}

/// File-backed metadata, in YAML or JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticMetadata {
    #[serde(default)]
    pub programs: Vec<Program>,
    #[serde(default)]
    pub tracked_entity_types: Vec<TrackedEntityType>,
    #[serde(default)]
    pub org_unit_levels: u32,
    #[serde(default)]
    pub org_unit_group_sets: Vec<OrgUnitGroupSet>,
}

impl StaticMetadata {
    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AnalyticsError::metadata(format!(
                "Failed to read metadata file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&content)
                .map_err(|e| AnalyticsError::metadata(format!("Failed to parse metadata: {}", e)))
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Parse YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| AnalyticsError::metadata(format!("Failed to parse metadata: {}", e)))
    }
}

#[async_trait]
impl MetadataProvider for StaticMetadata {
    async fn programs(&self) -> Result<Vec<Program>> {
        Ok(self.programs.clone())
    }

    async fn tracked_entity_types(&self) -> Result<Vec<TrackedEntityType>> {
        Ok(self.tracked_entity_types.clone())
    }

    async fn org_unit_levels(&self) -> Result<u32> {
        Ok(self.org_unit_levels)
    }

    async fn org_unit_group_sets(&self) -> Result<Vec<OrgUnitGroupSet>> {
        Ok(self.org_unit_group_sets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = r#"
org_unit_levels: 4
programs:
  - id: 1
    uid: IpHINAT79UW
    name: Child Programme
    registration: true
    data_elements:
      - id: 11
        uid: cYeuwXTCPkU
        name: Weight
        value_type: NUMBER
        legend_sets:
          - { id: 5, uid: fqs276KXCXi }
      - id: 12
        uid: GieVkTxp4HH
        name: Notes
        value_type: SIGNATURE_PAD
    attributes:
      - id: 21
        uid: w75KJ2mc4zz
        name: First name
        value_type: TEXT
      - id: 22
        uid: zDhUuAYrxNC
        name: National id
        value_type: TEXT
        confidential: true
tracked_entity_types:
  - id: 3
    uid: nEenWmSyUEp
    name: Person
"#;

    #[test]
    fn test_value_type_keys() {
        assert_eq!(ValueType::from("NUMBER".to_string()), ValueType::Number);
        assert_eq!(ValueType::from("integer_positive".to_string()), ValueType::IntegerPositive);
        assert_eq!(
            ValueType::from("SIGNATURE_PAD".to_string()),
            ValueType::Unsupported("SIGNATURE_PAD".into())
        );
        assert_eq!(ValueType::GeoJson.key(), "GEOJSON");
        assert!(ValueType::Percentage.is_numeric());
        assert!(ValueType::Age.is_date());
        assert!(!ValueType::Time.is_date());
    }

    #[test]
    fn test_parse_static_metadata() {
        let metadata = StaticMetadata::from_yaml(METADATA).unwrap();
        let program = &metadata.programs[0];
        assert!(program.registration);
        assert_eq!(program.data_elements[0].legend_sets.len(), 1);
        assert!(!program.data_elements[1].value_type.is_supported());

        let attributes: Vec<_> = program.analytics_attributes().map(|a| a.uid.as_str()).collect();
        assert_eq!(attributes, vec!["w75KJ2mc4zz"]);
    }

    #[tokio::test]
    async fn test_snapshot_load() {
        let metadata = StaticMetadata::from_yaml(METADATA).unwrap();
        let snapshot = MetadataSnapshot::load(&metadata).await.unwrap();
        assert_eq!(snapshot.org_unit_levels, 4);
        assert_eq!(snapshot.tracked_entity_types.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_rejects_bad_uid() {
        let mut metadata = StaticMetadata::from_yaml(METADATA).unwrap();
        metadata.programs[0].data_elements[0].uid = "x'; drop".into();
        let err = MetadataSnapshot::load(&metadata).await.unwrap_err();
        assert!(matches!(err, AnalyticsError::Metadata(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        std::fs::write(
            &path,
            r#"{"tracked_entity_types":[{"id":3,"uid":"nEenWmSyUEp","name":"Person"}]}"#,
        )
        .unwrap();
        let metadata = StaticMetadata::from_file(&path).unwrap();
        assert_eq!(metadata.tracked_entity_types[0].name, "Person");
        assert!(metadata.programs.is_empty());
    }
}
