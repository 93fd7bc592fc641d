use std::sync::Arc;

use grantflow_adapters::{detail_from_data, envelope_data, NormalizeError, OpportunitySource};
use grantflow_core::{FetchAttempt, OpportunityDetail, OpportunityRef, RawPayload};
use grantflow_storage::{sha256_hex, BlobArchive, FetchError, StoredBlob};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("archiving raw payload for {id}: {source:#}")]
    Archive { id: String, source: anyhow::Error },
    #[error("malformed detail for {id}: {source}")]
    Malformed {
        id: String,
        source: NormalizeError,
        attempts: Vec<FetchAttempt>,
    },
}

impl ProcessError {
    pub fn attempts(&self) -> &[FetchAttempt] {
        match self {
            Self::Fetch(err) => err.attempts(),
            Self::Malformed { attempts, .. } => attempts,
            Self::Archive { .. } => &[],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_cancelled())
    }

    pub fn dead_letter_reason(&self) -> String {
        match self {
            Self::Fetch(err) => err.dead_letter_reason(),
            Self::Archive { .. } => "archive".to_string(),
            Self::Malformed { source, .. } => format!("malformed:{source}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedDetail {
    pub detail: OpportunityDetail,
    pub blob: StoredBlob,
    pub attempts: Vec<FetchAttempt>,
}

/// Fetches one opportunity, archives the raw body, then normalizes it.
pub struct DetailStage {
    source: Arc<dyn OpportunitySource>,
    archive: Arc<dyn BlobArchive>,
}

impl DetailStage {
    pub fn new(source: Arc<dyn OpportunitySource>, archive: Arc<dyn BlobArchive>) -> Self {
        Self { source, archive }
    }

    pub async fn process(&self, item: &OpportunityRef) -> Result<ProcessedDetail, ProcessError> {
        let outcome = self.source.fetch_detail(&item.id).await?;

        let payload = RawPayload {
            id: item.id.clone(),
            fetched_at: outcome.fetched_at,
            content_hash: sha256_hex(&outcome.body),
            bytes: outcome.body,
        };
        let blob = self
            .archive
            .put(&payload)
            .await
            .map_err(|source| ProcessError::Archive {
                id: item.id.clone(),
                source,
            })?;
        debug!(id = %item.id, key = %blob.key, bytes = blob.byte_size, "raw detail archived");

        let normalized = envelope_data(&outcome.json)
            .and_then(|data| detail_from_data(&item.id, data, outcome.fetched_at));
        match normalized {
            Ok(detail) => Ok(ProcessedDetail {
                detail,
                blob,
                attempts: outcome.attempts,
            }),
            Err(source) => Err(ProcessError::Malformed {
                id: item.id.clone(),
                source,
                attempts: outcome.attempts,
            }),
        }
    }
}
