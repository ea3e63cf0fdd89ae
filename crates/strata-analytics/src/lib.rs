//! # strata-analytics
//!
//! Materializes normalized tracker records (events, enrollments and their
//! attribute values) into denormalized, partitioned analytics tables.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     RefreshOrchestrator                       │
//! │  plan → populate → validate → swap → advance watermarks       │
//! ├──────────────────────┬────────────────────────────────────────┤
//! │ TableManager         │ IncrementalUpdater (latest partitions) │
//! │  event, enrollment   │                                        │
//! ├──────────────────────┴────────────────────────────────────────┤
//! │ SchemaDeriver · PartitionPlanner · SqlGenerator · SqlTemplate │
//! ├───────────────────────────────────────────────────────────────┤
//! │ strata-rdbc: Connection, SqlDialect, ConnectionPool           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strata_analytics::prelude::*;
//!
//! let orchestrator = RefreshOrchestrator::new(OrchestratorDeps {
//!     config,
//!     connection,
//!     metadata: Arc::new(StaticMetadata::from_file("metadata.yaml")?),
//!     watermarks: Arc::new(SqlWatermarkStore::new(connection.clone(), dialect)),
//!     hooks: vec![Arc::new(RowCountHook::new(1))],
//!     locks: TableLockRegistry::new(),
//! });
//!
//! let report = orchestrator
//!     .run(RefreshParams::latest(), CancellationToken::new())
//!     .await?;
//! println!("{}", report.to_json()?);
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod calendar;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod incremental;
pub mod lock;
pub mod manager;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod partition;
pub mod report;
pub mod schema;
pub mod sql;
pub mod template;
pub mod watermark;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::calendar::{Calendar, CalendarKind};
    pub use crate::config::{AnalyticsConfig, SpatialSupport, TableSettings};
    pub use crate::context::{RefreshContext, RefreshMode, RefreshParams};
    pub use crate::error::{AnalyticsError, Result};
    pub use crate::hooks::{RowCountHook, TableHook};
    pub use crate::lock::TableLockRegistry;
    pub use crate::metadata::{MetadataProvider, MetadataSnapshot, StaticMetadata};
    pub use crate::model::{AnalyticsTable, Column, Partition, PartitionKey, TableType};
    pub use crate::orchestrator::{OrchestratorDeps, RefreshOrchestrator};
    pub use crate::report::{RefreshReport, RunStatus};
    pub use crate::watermark::{
        InMemoryWatermarkStore, SqlWatermarkStore, WatermarkKey, WatermarkStore,
    };
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}

pub use config::AnalyticsConfig;
pub use context::{RefreshMode, RefreshParams};
pub use error::{AnalyticsError, Result};
pub use orchestrator::{OrchestratorDeps, RefreshOrchestrator};
pub use report::{RefreshReport, RunStatus};
