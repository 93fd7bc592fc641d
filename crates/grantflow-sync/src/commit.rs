use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::NaiveDate;
use grantflow_core::{OpportunityDetail, OpportunityPatch, GRANT_PARTITION};
use grantflow_storage::{
    Backoff, BackoffPolicy, BackoffPolicyError, FieldMap, OpportunityStore, StoreError,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub id: String,
    pub attempts: u32,
    pub fields_written: usize,
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit of {id} gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        id: String,
        attempts: u32,
        last_error: StoreError,
    },
    #[error("commit of {id} rejected: {source}")]
    Rejected { id: String, source: StoreError },
    #[error("commit of {id} cancelled after {attempts} attempts")]
    Cancelled { id: String, attempts: u32 },
}

impl CommitError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
            Self::Rejected { .. } => 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn dead_letter_reason(&self) -> String {
        match self {
            Self::Exhausted { attempts, .. } => format!("exhausted:{attempts}"),
            Self::Rejected { .. } => "rejected".to_string(),
            Self::Cancelled { .. } => "cancelled".to_string(),
        }
    }

    pub fn last_error(&self) -> String {
        match self {
            Self::Exhausted { last_error, .. } => last_error.to_string(),
            Self::Rejected { source, .. } => source.to_string(),
            Self::Cancelled { .. } => self.to_string(),
        }
    }
}

/// Row fields for a normalized detail. `id` is the row key and `fetched_at`
/// is wall-clock, so neither is written; re-committing the same detail
/// produces an identical row.
pub fn detail_fields(detail: &OpportunityDetail) -> FieldMap {
    let mut fields = FieldMap::new();
    let mut put = |key: &str, value: serde_json::Value| {
        fields.insert(key.to_string(), value);
    };
    let date = |d: Option<chrono::NaiveDate>| {
        d.map(|d| json!(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(serde_json::Value::Null)
    };

    put("number", json!(detail.number));
    put("title", json!(detail.title));
    put("agency", json!(detail.agency));
    put("agency_code", json!(detail.agency_code));
    put("open_date", date(detail.open_date));
    put("close_date", date(detail.close_date));
    put("is_rolling", json!(detail.is_rolling));
    put("deadline", json!(detail.deadline));
    put("award_ceiling", json!(detail.award_ceiling));
    put("award_floor", json!(detail.award_floor));
    put("expected_awards", json!(detail.expected_awards));
    put("estimated_total_funding", json!(detail.estimated_total_funding));
    put("description", json!(detail.description));
    put("eligibility", json!(detail.eligibility));
    put("contact", json!(detail.contact));
    put("cfda_numbers", json!(detail.cfda_numbers));
    put("funding_category", json!(detail.funding_category));
    put("funding_instrument", json!(detail.funding_instrument));
    put("cost_sharing", json!(detail.cost_sharing));
    put("source_url", json!(detail.source_url));
    put("last_updated", date(detail.last_updated));
    fields
}

/// Writes rows through a merge-upsert, retrying conflicts and
/// unavailability under its own backoff policy.
pub struct CommitStage {
    store: Arc<dyn OpportunityStore>,
    policy: BackoffPolicy,
    rng: StdMutex<StdRng>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl CommitStage {
    pub fn new(
        store: Arc<dyn OpportunityStore>,
        policy: BackoffPolicy,
    ) -> Result<Self, BackoffPolicyError> {
        policy.validate()?;
        Ok(Self {
            store,
            policy,
            rng: StdMutex::new(StdRng::from_entropy()),
            shutdown: None,
        })
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: StdMutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn commit(&self, detail: &OpportunityDetail) -> Result<CommitReceipt, CommitError> {
        self.write(&detail.id, detail_fields(detail)).await
    }

    /// Writes only the patched fields; everything else on the row survives.
    pub async fn commit_patch(
        &self,
        patch: &OpportunityPatch,
    ) -> Result<CommitReceipt, CommitError> {
        let mut fields = patch.fields.clone();
        fields.remove("id");
        if fields.is_empty() {
            return Ok(CommitReceipt {
                id: patch.id.clone(),
                attempts: 0,
                fields_written: 0,
            });
        }
        self.write(&patch.id, fields).await
    }

    /// Deletes rows whose `last_updated` falls before `cutoff`. Returns how many went away.
    pub async fn prune(&self, cutoff: NaiveDate) -> Result<usize, StoreError> {
        let ids = self.store.updated_before(GRANT_PARTITION, cutoff).await?;
        let mut deleted = 0;
        for id in &ids {
            if self.store.delete(GRANT_PARTITION, id).await? {
                deleted += 1;
            }
        }
        info!(%cutoff, candidates = ids.len(), deleted, "stale opportunities pruned");
        Ok(deleted)
    }

    fn next_delay(&self, retry_index: u32) -> Backoff {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.policy.next_delay(retry_index, &mut *rng)
    }

    /// Sleeps for `delay`; returns `true` if shutdown was signalled meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        let Some(rx) = &self.shutdown else {
            tokio::time::sleep(delay).await;
            return false;
        };
        let mut rx = rx.clone();
        if *rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            Ok(_) = rx.wait_for(|stop| *stop) => true,
        }
    }

    async fn write(&self, id: &str, fields: FieldMap) -> Result<CommitReceipt, CommitError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.store.merge_upsert(GRANT_PARTITION, id, &fields).await {
                Ok(()) => {
                    info!(id, attempts, fields = fields.len(), "opportunity committed");
                    return Ok(CommitReceipt {
                        id: id.to_string(),
                        attempts,
                        fields_written: fields.len(),
                    });
                }
                Err(err) if !err.is_retryable() => {
                    return Err(CommitError::Rejected {
                        id: id.to_string(),
                        source: err,
                    });
                }
                Err(err) => err,
            };

            match self.next_delay(attempts - 1) {
                Backoff::Exhausted => {
                    return Err(CommitError::Exhausted {
                        id: id.to_string(),
                        attempts,
                        last_error: err,
                    });
                }
                Backoff::Delay(delay) => {
                    warn!(id, attempts, delay_ms = delay.as_millis() as u64, error = %err, "commit retry scheduled");
                    if self.pause(delay).await {
                        return Err(CommitError::Cancelled {
                            id: id.to_string(),
                            attempts,
                        });
                    }
                }
            }
        }
    }
}
