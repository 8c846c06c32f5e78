//! Call-log persistence bridge
//!
//! Every call attempt gets an external record: created when the call starts
//! with status `connecting`, finalized once when it ends. The bridge never
//! fails a call: store errors are retried briefly, then logged to the event
//! feed and swallowed.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::call::CallDirection;
use crate::client::recovery::{retry_with_backoff, with_timeout, RetryConfig};
use crate::error::{ClientError, ClientResult};
use crate::feed::EventFeed;

/// Identifier of a persisted call-log record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId(pub String);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status stored on a call-log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallLogStatus {
    Connecting,
    Completed,
    Failed,
}

/// Fields written when a record is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCallLog {
    pub direction: CallDirection,
    pub counterpart: String,
    pub status: CallLogStatus,
    pub started_at: DateTime<Utc>,
}

/// Fields written when a record is finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLogUpdate {
    pub status: CallLogStatus,
    pub duration_seconds: u64,
    pub note: Option<String>,
    pub ended_at: DateTime<Utc>,
}

/// A full record as kept by [`MemoryCallLogStore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLogRecord {
    pub id: LogId,
    pub direction: CallDirection,
    pub counterpart: String,
    pub status: CallLogStatus,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: Option<u64>,
    pub note: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Document-style persistence service for call logs
#[async_trait]
pub trait CallLogStore: Send + Sync {
    async fn create(&self, record: NewCallLog) -> ClientResult<LogId>;

    async fn update(&self, id: &LogId, update: CallLogUpdate) -> ClientResult<()>;
}

/// In-process call-log store
#[derive(Debug, Default)]
pub struct MemoryCallLogStore {
    records: DashMap<LogId, CallLogRecord>,
}

impl MemoryCallLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &LogId) -> Option<CallLogRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn records(&self) -> Vec<CallLogRecord> {
        let mut records: Vec<_> = self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CallLogStore for MemoryCallLogStore {
    async fn create(&self, record: NewCallLog) -> ClientResult<LogId> {
        let id = LogId(Uuid::new_v4().to_string());
        self.records.insert(
            id.clone(),
            CallLogRecord {
                id: id.clone(),
                direction: record.direction,
                counterpart: record.counterpart,
                status: record.status,
                started_at: record.started_at,
                duration_seconds: None,
                note: None,
                ended_at: None,
            },
        );
        Ok(id)
    }

    async fn update(&self, id: &LogId, update: CallLogUpdate) -> ClientResult<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| ClientError::persistence(format!("call log {} not found", id)))?;
        record.status = update.status;
        record.duration_seconds = Some(update.duration_seconds);
        record.note = update.note;
        record.ended_at = Some(update.ended_at);
        Ok(())
    }
}

/// Number of finalized record ids the bridge remembers to suppress repeats
pub const FINALIZED_HISTORY: usize = 1024;

/// Recently finalized ids, oldest first
#[derive(Debug, Default)]
struct FinalizedIds {
    ids: HashSet<LogId>,
    order: VecDeque<LogId>,
}

impl FinalizedIds {
    /// Returns `false` if `id` is already remembered
    fn insert(&mut self, id: &LogId, capacity: usize) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Creates and finalizes call-log records on behalf of the call state machine
///
/// ```rust
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use softphone_client_core::{CallDirection, CallLogBridge, CallLogStatus, EventFeed, MemoryCallLogStore};
/// # use softphone_client_core::client::RetryConfig;
/// # tokio_test::block_on(async {
/// let store = Arc::new(MemoryCallLogStore::new());
/// let feed = Arc::new(EventFeed::new(10));
/// let bridge = CallLogBridge::new(store.clone(), feed, RetryConfig::none(), Duration::from_secs(1));
///
/// let id = bridge.start(CallDirection::Outbound, "+12025550123").await.unwrap();
/// assert!(bridge.finalize(&id, CallLogStatus::Completed, 42, None).await);
/// // a second finalize is ignored
/// assert!(!bridge.finalize(&id, CallLogStatus::Failed, 0, None).await);
/// assert_eq!(store.get(&id).unwrap().duration_seconds, Some(42));
/// # });
/// ```
pub struct CallLogBridge {
    store: Arc<dyn CallLogStore>,
    feed: Arc<EventFeed>,
    retry: RetryConfig,
    timeout: Duration,
    finalized: Mutex<FinalizedIds>,
    history: usize,
}

impl CallLogBridge {
    pub fn new(store: Arc<dyn CallLogStore>, feed: Arc<EventFeed>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            store,
            feed,
            retry,
            timeout,
            finalized: Mutex::new(FinalizedIds::default()),
            history: FINALIZED_HISTORY,
        }
    }

    /// How many finalized ids to remember; at least one
    pub fn with_finalized_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    /// Create a `connecting` record; `None` if the store is unavailable
    pub async fn start(&self, direction: CallDirection, counterpart: &str) -> Option<LogId> {
        let record = NewCallLog {
            direction,
            counterpart: counterpart.to_string(),
            status: CallLogStatus::Connecting,
            started_at: Utc::now(),
        };

        let result = with_timeout(
            "call_log_create",
            self.timeout,
            retry_with_backoff("call_log_create", self.retry.clone(), || self.store.create(record.clone())),
        )
        .await;

        match result {
            Ok(id) => {
                tracing::debug!(log_id = %id, direction = %direction, "Call log created");
                Some(id)
            }
            Err(e) => {
                tracing::warn!(error = %e, category = e.category(), "Call log create failed");
                self.feed.push(format!("Call log unavailable: {}", e));
                None
            }
        }
    }

    /// Finalize a record. Returns `false` if `id` was already finalized.
    pub async fn finalize(
        &self,
        id: &LogId,
        status: CallLogStatus,
        duration_seconds: u64,
        note: Option<String>,
    ) -> bool {
        if !self.finalized.lock().insert(id, self.history) {
            tracing::debug!(log_id = %id, "Call log already finalized, ignoring");
            return false;
        }

        let update = CallLogUpdate {
            status,
            duration_seconds,
            note,
            ended_at: Utc::now(),
        };

        let result = with_timeout(
            "call_log_finalize",
            self.timeout,
            retry_with_backoff("call_log_finalize", self.retry.clone(), || self.store.update(id, update.clone())),
        )
        .await;

        if let Err(e) = result {
            tracing::warn!(log_id = %id, error = %e, "Call log finalize failed");
            self.feed.push(format!("Failed to save call log: {}", e));
        }
        true
    }

    pub fn is_finalized(&self, id: &LogId) -> bool {
        self.finalized.lock().ids.contains(id)
    }
}
