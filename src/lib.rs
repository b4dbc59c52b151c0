// src/lib.rs

// Re-export for native module
pub use bytes::Bytes;

pub mod cache;
pub mod cli;
pub mod ingest;
pub mod measurement;
pub mod pending;
pub mod publish;
pub mod store;
pub mod upload;

// Re-export tracing for use in other modules
pub use tracing;

pub use cache::{cache_key_latest, CacheError, LatestCache, MemoryCache, NoopCache};
pub use ingest::{IngestError, IngestOutcome, Ingestor};
pub use measurement::{validate, Measurement, StorableMeasurement, ValidationError};
pub use pending::{DrainSummary, PendingError, PendingQueue};
pub use publish::{HttpPublisher, PublishError, Publisher};
pub use store::{DeviceSeries, MeasurementStore, RangeQuery, SaveOutcome, SqliteBackend, StoreError};
pub use upload::{UploadError, UploadOutcome, Uploader};

pub mod native;

pub use native::build_router;
