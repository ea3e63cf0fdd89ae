//! Configuration and metadata loaded from files

use std::io::Write;
use strata_analytics::config::{AnalyticsConfig, SpatialSupport};
use strata_analytics::metadata::{MetadataSnapshot, StaticMetadata};
use tempfile::NamedTempFile;

fn write(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_config_file_with_env_expansion() {
    std::env::set_var("STRATA_TEST_DB_URL", "postgres://dhis:secret@db/dhis2");
    let file = write(
        ".yaml",
        r#"
database:
  url: ${STRATA_TEST_DB_URL}
  pool_max_size: ${STRATA_TEST_POOL_MAX:-12}
tables:
  unlogged: true
  spatial: enabled
  max_period_years_offset: 5
"#,
    );

    let config = AnalyticsConfig::from_file(file.path()).unwrap();
    assert_eq!(config.database.url, "postgres://dhis:secret@db/dhis2");
    assert_eq!(config.database.pool_max_size, 12);
    assert!(!config.tables.logged());
    assert_eq!(config.tables.spatial, SpatialSupport::Enabled);

    let bounds = config.tables.year_bounds(2024);
    assert_eq!((bounds.earliest, bounds.latest), (2019, 2029));
}

#[test]
fn test_unsupported_database_kind() {
    let file = write(
        ".yaml",
        "database:\n  url: oracle://localhost/dhis2\n  kind: oracle\n",
    );
    let err = AnalyticsConfig::from_file(file.path()).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = AnalyticsConfig::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(err.to_string().contains("absent.yaml"));
}

#[tokio::test]
async fn test_json_metadata_file() {
    let file = write(
        ".json",
        r#"{
  "org_unit_levels": 3,
  "programs": [
    { "id": 7, "uid": "IpHINAT79UW", "name": "Child Programme",
      "data_elements": [
        { "id": 11, "uid": "cYeuwXTCPkU", "name": "Weight", "value_type": "NUMBER" }
      ] }
  ],
  "tracked_entity_types": [ { "id": 3, "uid": "nEenWmSyUEp", "name": "Person" } ]
}"#,
    );

    let metadata = StaticMetadata::from_file(file.path()).unwrap();
    let snapshot = MetadataSnapshot::load(&metadata).await.unwrap();
    assert_eq!(snapshot.org_unit_levels, 3);
    assert_eq!(snapshot.programs[0].data_elements.len(), 1);
}

#[tokio::test]
async fn test_malformed_uid_rejected() {
    let file = write(
        ".yaml",
        "programs:\n  - { id: 1, uid: \"x'; drop\", name: Bad }\n",
    );
    let metadata = StaticMetadata::from_file(file.path()).unwrap();
    let err = MetadataSnapshot::load(&metadata).await.unwrap_err();
    assert!(err.is_configuration());
}
