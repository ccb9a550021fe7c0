use crate::routing::ResolvedRoute;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallProgress {
    Forwarding,
    Answered,
    TransferredToVoiceAgent,
}

/// Transient per-call state, created when a call is forwarded and dropped
/// when the call completes. If a completion event is lost the record leaks
/// until process restart; an accepted cost of keeping this in memory.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub route: ResolvedRoute,
    pub started_at: DateTime<Utc>,
    pub status: CallProgress,
    pub original_caller: String,
}

impl CallRecord {
    pub fn forwarding(route: ResolvedRoute, original_caller: String) -> Self {
        Self {
            route,
            started_at: Utc::now(),
            status: CallProgress::Forwarding,
            original_caller,
        }
    }
}

/// Store for in-flight call records, keyed by call sid. The dispatcher is
/// the only writer. Status changes go through [`set_status`], a single
/// read-modify-write critical section, so concurrent events for one call
/// cannot lose updates.
///
/// [`set_status`]: CallStateStore::set_status
#[async_trait]
pub trait CallStateStore: Send + Sync {
    async fn insert(&self, call_sid: String, record: CallRecord);
    async fn get(&self, call_sid: &str) -> Option<CallRecord>;
    async fn set_status(&self, call_sid: &str, status: CallProgress) -> Option<CallRecord>;
    async fn remove(&self, call_sid: &str) -> Option<CallRecord>;
    async fn snapshot(&self) -> Vec<(String, CallRecord)>;
}

/// Process-lifetime in-memory store.
#[derive(Default)]
pub struct MemoryCallStateStore {
    records: Mutex<HashMap<String, CallRecord>>,
}

impl MemoryCallStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallStateStore for MemoryCallStateStore {
    async fn insert(&self, call_sid: String, record: CallRecord) {
        self.records.lock().await.insert(call_sid, record);
    }

    async fn get(&self, call_sid: &str) -> Option<CallRecord> {
        self.records.lock().await.get(call_sid).cloned()
    }

    async fn set_status(&self, call_sid: &str, status: CallProgress) -> Option<CallRecord> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(call_sid)?;
        record.status = status;
        Some(record.clone())
    }

    async fn remove(&self, call_sid: &str) -> Option<CallRecord> {
        self.records.lock().await.remove(call_sid)
    }

    async fn snapshot(&self) -> Vec<(String, CallRecord)> {
        self.records
            .lock()
            .await
            .iter()
            .map(|(sid, record)| (sid.clone(), record.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CallRecord {
        CallRecord::forwarding(
            ResolvedRoute {
                called_number: "+15551234567".to_string(),
                target_number: Some("+15034688103".to_string()),
                requires_answer: true,
                assistant_id: Some("owner-assistant".to_string()),
                max_ring_time_ms: 30000,
                description: None,
                whisper_message: None,
            },
            "+15559876543".to_string(),
        )
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let store = MemoryCallStateStore::new();
        store.insert("CA1".to_string(), record()).await;
        assert_eq!(store.get("CA1").await.unwrap().status, CallProgress::Forwarding);
        assert!(store.remove("CA1").await.is_some());
        assert!(store.get("CA1").await.is_none());
    }

    #[tokio::test]
    async fn test_set_status_mutates_in_place() {
        let store = MemoryCallStateStore::new();
        store.insert("CA1".to_string(), record()).await;
        let updated = store.set_status("CA1", CallProgress::Answered).await.unwrap();
        assert_eq!(updated.status, CallProgress::Answered);
        assert_eq!(store.get("CA1").await.unwrap().status, CallProgress::Answered);
    }

    #[tokio::test]
    async fn test_set_status_on_unknown_call_is_none() {
        let store = MemoryCallStateStore::new();
        assert!(store.set_status("CA404", CallProgress::Answered).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_twice_is_safe() {
        let store = MemoryCallStateStore::new();
        store.insert("CA1".to_string(), record()).await;
        assert!(store.remove("CA1").await.is_some());
        assert!(store.remove("CA1").await.is_none());
    }
}
