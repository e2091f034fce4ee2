//! Resumption state: the watermark each run starts from, and where the
//! next run's watermark is saved.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::ArchiveError;
use crate::model::ArchiveState;
use crate::store::{get_optional, PartitionStore};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// `None` when the account has never been archived.
    async fn load(&self, did: &str) -> Result<Option<ArchiveState>, ArchiveError>;

    async fn save(&self, state: &ArchiveState) -> Result<(), ArchiveError>;
}

/// State kept as a JSON object next to the partitions, at `{base}/state.json`
/// (or `state.json` for an empty base).
pub struct ObjectStateStore<S> {
    store: S,
    base_dir: String,
}

impl<S: PartitionStore> ObjectStateStore<S> {
    pub fn new(store: S, base_dir: impl Into<String>) -> Self {
        ObjectStateStore {
            store,
            base_dir: base_dir.into(),
        }
    }

    fn key(&self) -> String {
        if self.base_dir.is_empty() {
            "state.json".to_string()
        } else {
            format!("{}/state.json", self.base_dir)
        }
    }
}

#[async_trait]
impl<S: PartitionStore> StateStore for ObjectStateStore<S> {
    async fn load(&self, did: &str) -> Result<Option<ArchiveState>, ArchiveError> {
        let key = self.key();
        let Some(data) = get_optional(&self.store, &key).await? else {
            return Ok(None);
        };
        let state: ArchiveState =
            serde_json::from_slice(&data).map_err(|e| ArchiveError::Decode(key.clone(), e))?;
        if state.did != did {
            return Err(ArchiveError::StateMismatch {
                key,
                expected: did.to_string(),
                found: state.did,
            });
        }
        Ok(Some(state))
    }

    async fn save(&self, state: &ArchiveState) -> Result<(), ArchiveError> {
        let key = self.key();
        let body = serde_json::to_vec(state).map_err(|e| ArchiveError::Encode(key.clone(), e))?;
        self.store.put(&key, Bytes::from(body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn missing_state_loads_as_none() {
        let states = ObjectStateStore::new(MemoryStore::new(), "did:plc:a");
        assert_eq!(states.load("did:plc:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn saved_state_is_loaded_back() {
        let store = MemoryStore::new();
        let states = ObjectStateStore::new(store.clone(), "did:plc:a");
        let state = ArchiveState {
            did: "did:plc:a".into(),
            latest_cid: "bafy".into(),
            timestamp: 1_700_000_000,
        };
        states.save(&state).await.unwrap();

        assert!(store.object("did:plc:a/state.json").is_some());
        assert_eq!(states.load("did:plc:a").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn state_for_another_account_is_rejected() {
        let store = MemoryStore::new();
        store.insert(
            "shared/state.json",
            r#"{"did":"did:plc:other","latest_cid":"x","timestamp":1}"#,
        );
        let states = ObjectStateStore::new(store, "shared");
        let err = states.load("did:plc:a").await.unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::StateMismatch { ref found, .. } if found == "did:plc:other"
        ));
    }
}
