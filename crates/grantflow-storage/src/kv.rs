use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use grantflow_core::{DeadLetter, DeadLetterKind, Watermark};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;

pub type FieldMap = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected operation: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }
}

/// Rows keyed by `(partition, row_key)` holding a JSON field map.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Insert the row if absent, otherwise overwrite only the fields present in `fields`.
    async fn merge_upsert(
        &self,
        partition: &str,
        row_key: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError>;

    async fn get(&self, partition: &str, row_key: &str) -> Result<Option<FieldMap>, StoreError>;

    async fn delete(&self, partition: &str, row_key: &str) -> Result<bool, StoreError>;

    /// Row keys whose `last_updated` field is a date strictly before `cutoff`.
    async fn updated_before(
        &self,
        partition: &str,
        cutoff: NaiveDate,
    ) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load_watermark(&self, name: &str) -> Result<Watermark, StoreError>;
    async fn save_watermark(&self, name: &str, watermark: &Watermark) -> Result<(), StoreError>;
}

/// Dead letters are keyed by `(id, kind)`; recording again replaces the entry.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, letter: &DeadLetter) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<DeadLetter>, StoreError>;
    async fn remove(&self, id: &str, kind: DeadLetterKind) -> Result<bool, StoreError>;
    async fn count(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<(String, String), FieldMap>,
    watermarks: HashMap<String, Watermark>,
    dead_letters: BTreeMap<(String, DeadLetterKind), DeadLetter>,
}

/// Process-local store used by tests and single-process dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> BTreeMap<(String, String), FieldMap> {
        self.state.lock().await.rows.clone()
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn merge_upsert(
        &self,
        partition: &str,
        row_key: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .rows
            .entry((partition.to_string(), row_key.to_string()))
            .or_default();
        for (field, value) in fields {
            row.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn get(&self, partition: &str, row_key: &str) -> Result<Option<FieldMap>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .get(&(partition.to_string(), row_key.to_string()))
            .cloned())
    }

    async fn delete(&self, partition: &str, row_key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .rows
            .remove(&(partition.to_string(), row_key.to_string()))
            .is_some())
    }

    async fn updated_before(
        &self,
        partition: &str,
        cutoff: NaiveDate,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .filter(|((p, _), _)| p == partition)
            .filter_map(|((_, key), fields)| {
                let updated = fields
                    .get("last_updated")?
                    .as_str()
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())?;
                (updated < cutoff).then(|| key.clone())
            })
            .collect())
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn load_watermark(&self, name: &str) -> Result<Watermark, StoreError> {
        let state = self.state.lock().await;
        Ok(state.watermarks.get(name).cloned().unwrap_or_default())
    }

    async fn save_watermark(&self, name: &str, watermark: &Watermark) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.watermarks.insert(name.to_string(), watermark.clone());
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn record(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .dead_letters
            .insert((letter.id.clone(), letter.kind), letter.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let state = self.state.lock().await;
        let mut letters: Vec<_> = state.dead_letters.values().cloned().collect();
        letters.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.id.cmp(&b.id)));
        Ok(letters)
    }

    async fn remove(&self, id: &str, kind: DeadLetterKind) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .dead_letters
            .remove(&(id.to_string(), kind))
            .is_some())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.dead_letters.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn fields(pairs: &[(&str, JsonValue)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn merge_upsert_keeps_fields_missing_from_the_update() {
        let store = MemoryStore::new();
        store
            .merge_upsert(
                "Grant",
                "1",
                &fields(&[("title", json!("Rural Health")), ("award_ceiling", json!(10.0))]),
            )
            .await
            .unwrap();
        store
            .merge_upsert("Grant", "1", &fields(&[("award_ceiling", json!(25.0))]))
            .await
            .unwrap();

        let row = store.get("Grant", "1").await.unwrap().expect("row");
        assert_eq!(row["title"], json!("Rural Health"));
        assert_eq!(row["award_ceiling"], json!(25.0));
        assert_eq!(store.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn updated_before_ignores_rows_without_dates() {
        let store = MemoryStore::new();
        store
            .merge_upsert("Grant", "old", &fields(&[("last_updated", json!("2025-01-01"))]))
            .await
            .unwrap();
        store
            .merge_upsert("Grant", "new", &fields(&[("last_updated", json!("2026-06-01"))]))
            .await
            .unwrap();
        store
            .merge_upsert("Grant", "undated", &fields(&[("last_updated", JsonValue::Null)]))
            .await
            .unwrap();

        let stale = store
            .updated_before("Grant", NaiveDate::from_ymd_opt(2026, 1, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(stale, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn dead_letters_are_keyed_by_id_and_kind() {
        let store = MemoryStore::new();
        let letter = DeadLetter {
            id: "7".into(),
            kind: DeadLetterKind::Fetch,
            reason: "permanent:404".into(),
            attempts: 1,
            last_error: "http 404".into(),
            recorded_at: Utc::now(),
            detail: None,
        };
        store.record(&letter).await.unwrap();
        store.record(&letter).await.unwrap();
        store
            .record(&DeadLetter {
                kind: DeadLetterKind::Commit,
                ..letter.clone()
            })
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.remove("7", DeadLetterKind::Fetch).await.unwrap());
        assert!(!store.remove("7", DeadLetterKind::Fetch).await.unwrap());
        assert_eq!(store.list().await.unwrap()[0].kind, DeadLetterKind::Commit);
    }
}
