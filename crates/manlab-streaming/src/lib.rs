//! Credit-based bounded streaming for file downloads and log tails.
//!
//! Each stream is single-writer, single-reader: the agent-side frame
//! handler is the only producer, the download/dashboard consumer is the
//! only reader. The channel capacity itself is the credit window — a slow
//! consumer naturally backpressures the producer through `send().await`
//! blocking, the same way a bounded `mpsc` channel backpressures any
//! producer in this codebase (see the agent's `outgoing_tx`/`outgoing_rx`
//! pair in the node client).

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use manlab_config::HubConfig;
use manlab_proto::{ManlabError, ManlabResult, NodeId, StreamId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk { seq: u64, data: Vec<u8> },
    Progress { bytes_sent: u64, total_bytes: Option<u64> },
    Complete,
    Error(String),
}

/// Throttles progress events so a fast stream doesn't flood the dashboard:
/// an update is only due every `interval_ms` OR after `pct_threshold`
/// percent of additional progress, whichever comes first.
struct ProgressThrottle {
    last_emitted_at: chrono::DateTime<Utc>,
    last_emitted_pct: f32,
    interval_ms: u64,
    pct_threshold: f32,
}

impl ProgressThrottle {
    fn new(interval_ms: u64, pct_threshold: f32) -> Self {
        Self {
            last_emitted_at: Utc::now() - chrono::Duration::milliseconds(interval_ms as i64),
            last_emitted_pct: -pct_threshold,
            interval_ms,
            pct_threshold,
        }
    }

    fn due(&mut self, bytes_sent: u64, total_bytes: Option<u64>) -> bool {
        let now = Utc::now();
        let elapsed_ms = (now - self.last_emitted_at).num_milliseconds().max(0) as u64;
        let pct = total_bytes
            .filter(|t| *t > 0)
            .map(|t| (bytes_sent as f32 / t as f32) * 100.0)
            .unwrap_or(0.0);
        let pct_delta = (pct - self.last_emitted_pct).abs();

        if elapsed_ms >= self.interval_ms || pct_delta >= self.pct_threshold {
            self.last_emitted_at = now;
            self.last_emitted_pct = pct;
            true
        } else {
            false
        }
    }
}

/// A single open stream: the producer half writes chunks (subject to
/// channel backpressure), the registry tracks byte counters for progress
/// reporting and the max-age sweep.
pub struct StreamSession {
    pub id: StreamId,
    pub node_id: NodeId,
    pub total_bytes: Option<u64>,
    pub opened_at: chrono::DateTime<Utc>,
    bytes_sent: AtomicU64,
    next_seq: AtomicU64,
    tx: mpsc::Sender<StreamEvent>,
    throttle: Mutex<ProgressThrottle>,
}

impl StreamSession {
    /// Write one chunk. Blocks (backpressures the caller) if the consumer
    /// hasn't drained the channel — this is the "credit" in credit-based:
    /// no explicit credit message is needed when capacity already encodes it.
    pub async fn write_chunk(&self, data: Vec<u8>) -> ManlabResult<Option<StreamEvent>> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let len = data.len() as u64;
        self.tx
            .send(StreamEvent::Chunk { seq, data })
            .await
            .map_err(|_| ManlabError::TransportFailed(format!("stream {} consumer dropped", self.id)))?;

        let bytes_sent = self.bytes_sent.fetch_add(len, Ordering::SeqCst) + len;
        let due = self.throttle.lock().due(bytes_sent, self.total_bytes);
        if due {
            let event = StreamEvent::Progress {
                bytes_sent,
                total_bytes: self.total_bytes,
            };
            // Progress events use try_send: if the consumer is behind on
            // chunks, a stale progress tick is fine to drop.
            let _ = self.tx.try_send(event.clone());
            return Ok(Some(event));
        }
        Ok(None)
    }

    pub async fn complete(&self) -> ManlabResult<()> {
        self.tx
            .send(StreamEvent::Complete)
            .await
            .map_err(|_| ManlabError::TransportFailed(format!("stream {} consumer dropped", self.id)))
    }

    pub async fn fail(&self, message: impl Into<String>) -> ManlabResult<()> {
        self.tx
            .send(StreamEvent::Error(message.into()))
            .await
            .map_err(|_| ManlabError::TransportFailed(format!("stream {} consumer dropped", self.id)))
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }
}

/// Tracks open streams and hands out the consumer half on [`open`].
pub struct StreamRegistry {
    config: Arc<HubConfig>,
    sessions: Mutex<std::collections::HashMap<StreamId, Arc<StreamSession>>>,
}

impl StreamRegistry {
    pub fn new(config: Arc<HubConfig>) -> Self {
        Self {
            config,
            sessions: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn open(&self, node_id: NodeId, total_bytes: Option<u64>) -> (Arc<StreamSession>, mpsc::Receiver<StreamEvent>) {
        let id = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.stream_channel_capacity);
        let session = Arc::new(StreamSession {
            id,
            node_id,
            total_bytes,
            opened_at: Utc::now(),
            bytes_sent: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            tx,
            throttle: Mutex::new(ProgressThrottle::new(
                self.config.stream_progress_interval_ms,
                self.config.stream_progress_pct_threshold,
            )),
        });
        self.sessions.lock().insert(id, session.clone());
        (session, rx)
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<StreamSession>> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn close(&self, id: StreamId) {
        self.sessions.lock().remove(&id);
    }

    /// Drop streams that have been open longer than `stream_max_age_secs`
    /// without completing — an agent that died mid-transfer shouldn't pin
    /// the channel open forever.
    pub fn sweep_expired(&self) -> Vec<StreamId> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stream_max_age_secs);
        let mut sessions = self.sessions.lock();
        let expired: Vec<StreamId> = sessions
            .values()
            .filter(|s| s.opened_at < cutoff)
            .map(|s| s.id)
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), "swept expired streams");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_chunk_delivers_in_order() {
        let registry = StreamRegistry::new(Arc::new(HubConfig::default()));
        let (session, mut rx) = registry.open(uuid::Uuid::new_v4(), Some(100));

        session.write_chunk(vec![1, 2, 3]).await.unwrap();
        session.write_chunk(vec![4, 5]).await.unwrap();
        session.complete().await.unwrap();

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            let is_complete = matches!(ev, StreamEvent::Complete);
            events.push(ev);
            if is_complete {
                break;
            }
        }
        assert!(matches!(events[0], StreamEvent::Chunk { seq: 0, .. }));
        assert!(matches!(events[1], StreamEvent::Chunk { seq: 1, .. }));
    }

    #[tokio::test]
    async fn progress_throttle_suppresses_rapid_updates() {
        let mut throttle = ProgressThrottle::new(999_999, 50.0);
        assert!(throttle.due(1, Some(1000)));
        assert!(!throttle.due(2, Some(1000)));
    }

    #[tokio::test]
    async fn sweep_expired_removes_stale_sessions() {
        let mut config = HubConfig::default();
        config.stream_max_age_secs = -1;
        let registry = StreamRegistry::new(Arc::new(config));
        let (session, _rx) = registry.open(uuid::Uuid::new_v4(), None);

        let expired = registry.sweep_expired();
        assert_eq!(expired, vec![session.id]);
        assert!(registry.get(session.id).is_none());
    }
}
