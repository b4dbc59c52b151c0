//! Receiver-side write path: decode a published payload, validate it, and store it.

use bytes::Bytes;
use flate2::read::GzDecoder;
use prost::Message;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::measurement::{validate, Measurement, StorableMeasurement};
use crate::store::{MeasurementStore, SaveOutcome, StoreError};

const MAX_DECOMPRESSED_SIZE: usize = 1024 * 1024;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("ingest: decompress error: {0}")]
    Decompress(String),
    #[error("ingest: decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, PartialEq)]
pub enum IngestOutcome {
    Stored(SaveOutcome),
    /// Well-formed but invalid; dropped so the sender does not retry it forever.
    Rejected(String),
}

pub(crate) fn decompress_if_gzipped(body: Bytes) -> Result<Bytes, IngestError> {
    if !body.starts_with(&GZIP_MAGIC) {
        return Ok(body);
    }

    debug!(compressed_size = body.len(), "decompressing gzipped body");
    let mut decompressed = Vec::with_capacity(body.len().saturating_mul(2));
    let bytes_read = GzDecoder::new(body.as_ref())
        .take((MAX_DECOMPRESSED_SIZE + 1) as u64)
        .read_to_end(&mut decompressed)
        .map_err(|e| {
            error!(error = %e, "gzip decompression failed");
            IngestError::Decompress(e.to_string())
        })?;
    if bytes_read > MAX_DECOMPRESSED_SIZE {
        return Err(IngestError::Decompress(format!(
            "exceeds {}KB limit",
            MAX_DECOMPRESSED_SIZE / 1024
        )));
    }
    Ok(Bytes::from(decompressed))
}

pub struct Ingestor {
    store: Arc<MeasurementStore>,
}

impl Ingestor {
    pub fn new(store: Arc<MeasurementStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MeasurementStore {
        &self.store
    }

    /// Decode, validate and save one published measurement. The payload may be gzipped.
    #[tracing::instrument(name = "ingest", skip_all, fields(bytes = payload.len()))]
    pub fn ingest(&self, payload: Bytes) -> Result<IngestOutcome, IngestError> {
        let body = decompress_if_gzipped(payload)?;
        let wire = Measurement::decode(body).map_err(|e| {
            error!(error = %e, "failed to decode measurement");
            IngestError::Decode(e.to_string())
        })?;

        if let Err(e) = validate(&wire) {
            warn!(device_id = %wire.device_id, error = %e, "rejecting invalid measurement");
            return Ok(IngestOutcome::Rejected(e.to_string()));
        }
        let m = match StorableMeasurement::try_from(&wire) {
            Ok(m) => m,
            Err(e) => {
                warn!(device_id = %wire.device_id, error = %e, "rejecting unconvertible measurement");
                return Ok(IngestOutcome::Rejected(e.to_string()));
            }
        };

        let outcome = self.store.save(&m)?;
        info!(measurement = %m, ?outcome, "ingested measurement");
        Ok(IngestOutcome::Stored(outcome))
    }
}
