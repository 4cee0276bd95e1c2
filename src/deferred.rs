//! Fire-and-forget session metadata writes.
//!
//! Usage and message metadata are informational: the request path records
//! them without waiting, and a bounded queue feeds a single writer task.
//! Delivery is at most once: when the buffer is full the record is dropped,
//! never the request.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::CoordStore;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd_micros: u64,
    pub ts_ms: u64,
}

const MESSAGES_KEPT: usize = 8;

#[derive(Debug)]
enum MetadataWrite {
    Usage { session_id: String, payload: String },
    Messages { session_id: String, payload: String },
}

/// Bounded fire-and-forget writer for session-adjacent metadata.
pub struct MetadataWriter {
    tx: mpsc::Sender<MetadataWrite>,
    worker: JoinHandle<()>,
}

impl MetadataWriter {
    pub fn new(store: CoordStore, ttl_seconds: u64, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(drain(store, rx, ttl_seconds));
        Self { tx, worker }
    }

    /// Enqueue a usage record. Returns false when the buffer was full and
    /// the record was dropped.
    pub fn record_usage(&self, session_id: &str, record: &UsageRecord) -> bool {
        let Ok(payload) = serde_json::to_string(record) else {
            return false;
        };
        self.enqueue(MetadataWrite::Usage {
            session_id: session_id.to_string(),
            payload,
        })
    }

    /// Enqueue the leading message texts for later inspection. Only the
    /// first few are kept.
    pub fn record_messages(&self, session_id: &str, messages: &[String]) -> bool {
        let kept: Vec<&String> = messages.iter().take(MESSAGES_KEPT).collect();
        let Ok(payload) = serde_json::to_string(&kept) else {
            return false;
        };
        self.enqueue(MetadataWrite::Messages {
            session_id: session_id.to_string(),
            payload,
        })
    }

    fn enqueue(&self, write: MetadataWrite) -> bool {
        match self.tx.try_send(write) {
            Ok(()) => true,
            Err(_) => {
                debug!("metadata buffer full, record dropped");
                false
            }
        }
    }

    /// Drain the queue and stop the writer task.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

async fn drain(store: CoordStore, mut rx: mpsc::Receiver<MetadataWrite>, ttl_seconds: u64) {
    while let Some(write) = rx.recv().await {
        if let Err(err) = apply(&store, &write, ttl_seconds).await {
            let session_id = match &write {
                MetadataWrite::Usage { session_id, .. }
                | MetadataWrite::Messages { session_id, .. } => session_id.as_str(),
            };
            warn!(session_id, error = %err, "metadata write dropped");
        }
    }
}

async fn apply(store: &CoordStore, write: &MetadataWrite, ttl_seconds: u64) -> Result<()> {
    let (key, payload) = match write {
        MetadataWrite::Usage {
            session_id,
            payload,
        } => (store.key_session_usage(session_id), payload),
        MetadataWrite::Messages {
            session_id,
            payload,
        } => (store.key_session_messages(session_id), payload),
    };
    let mut conn = store.connection().await?;
    let _: () = redis::cmd("SET")
        .arg(key)
        .arg(payload)
        .arg("EX")
        .arg(ttl_seconds)
        .query_async(&mut conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_record_serializes_compactly() {
        let record = UsageRecord {
            provider_id: "p-1".to_string(),
            input_tokens: 120,
            output_tokens: 64,
            cost_usd_micros: 1_500,
            ts_ms: 1_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: UsageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.provider_id, "p-1");
        assert_eq!(parsed.cost_usd_micros, 1_500);
    }
}
