//! Fetch → normalize → upsert → audit pipeline for the IMD weather feed.

pub mod audit;
pub mod config;
pub mod pipeline;
pub mod sink;
pub mod store;

pub use audit::{format_run_log_entry, HostIdentity, RunAuditor};
pub use config::{is_valid_table_identifier, ConfigError, ImdConfig};
pub use pipeline::{run_once_with_config, schema_sql, ImdPipeline, RunPhase};
pub use sink::{skip_message, RecordOutcome, RunTally, UpsertSink};
pub use store::{
    InsertOutcome, MemoryAuditRow, MemoryObservationStore, ObservationStore, PgObservationStore, StoreError,
};

pub const CRATE_NAME: &str = "imd-sync";
