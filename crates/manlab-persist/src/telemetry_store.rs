use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use manlab_proto::NodeId;
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::PersistResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupGranularity {
    Raw,
    Hour,
    Day,
}

impl RollupGranularity {
    fn bucket_width(self) -> Duration {
        match self {
            Self::Raw => Duration::seconds(1),
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryBucket {
    pub bucket_start: DateTime<Utc>,
    pub metric: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

/// Heartbeat intake and roll-up queries.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn record_sample(&self, node_id: NodeId, recorded_at: DateTime<Utc>, sample: serde_json::Value) -> PersistResult<()>;
    async fn latest_sample(&self, node_id: NodeId) -> PersistResult<Option<(DateTime<Utc>, serde_json::Value)>>;
    async fn history(
        &self,
        node_id: NodeId,
        since: DateTime<Utc>,
        granularity: RollupGranularity,
        metric_extractor: &(dyn Fn(&serde_json::Value) -> Option<f64> + Send + Sync),
        metric_name: &str,
    ) -> PersistResult<Vec<HistoryBucket>>;
    async fn record_opaque_snapshot(
        &self,
        table: &str,
        node_id: NodeId,
        recorded_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> PersistResult<()>;
    async fn latest_opaque_snapshot(
        &self,
        table: &str,
        node_id: NodeId,
    ) -> PersistResult<Option<DateTime<Utc>>>;
}

fn compute_bucket(ts: DateTime<Utc>, granularity: RollupGranularity) -> DateTime<Utc> {
    match granularity {
        RollupGranularity::Raw => ts,
        RollupGranularity::Hour => ts.date_naive().and_hms_opt(ts.time().hour(), 0, 0).unwrap().and_utc(),
        RollupGranularity::Day => ts.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
    }
}

use chrono::Timelike;

fn percentile95(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
    let idx = idx.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}

fn bucketize(
    samples: &[(DateTime<Utc>, serde_json::Value)],
    granularity: RollupGranularity,
    metric_extractor: &(dyn Fn(&serde_json::Value) -> Option<f64> + Send + Sync),
    metric_name: &str,
) -> Vec<HistoryBucket> {
    let mut buckets: HashMap<DateTime<Utc>, Vec<f64>> = HashMap::new();
    for (ts, sample) in samples {
        if let Some(v) = metric_extractor(sample) {
            buckets.entry(compute_bucket(*ts, granularity)).or_default().push(v);
        }
    }
    let mut out: Vec<HistoryBucket> = buckets
        .into_iter()
        .map(|(bucket_start, mut values)| {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let avg = values.iter().sum::<f64>() / values.len() as f64;
            HistoryBucket {
                bucket_start,
                metric: metric_name.to_string(),
                avg,
                min: values.first().copied().unwrap_or(0.0),
                max: values.last().copied().unwrap_or(0.0),
                p95: percentile95(&values),
            }
        })
        .collect();
    out.sort_by_key(|b| b.bucket_start);
    out
}

// ─── Postgres ─────────────────────────────────────────────────────────────────

pub struct PgTelemetryStore {
    pool: PgPool,
}

impl PgTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    async fn record_sample(&self, node_id: NodeId, recorded_at: DateTime<Utc>, sample: serde_json::Value) -> PersistResult<()> {
        sqlx::query(
            "INSERT INTO telemetry_samples (node_id, recorded_at, sample) VALUES ($1,$2,$3) \
             ON CONFLICT (node_id, recorded_at) DO UPDATE SET sample = EXCLUDED.sample",
        )
        .bind(node_id)
        .bind(recorded_at)
        .bind(sample)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_sample(&self, node_id: NodeId) -> PersistResult<Option<(DateTime<Utc>, serde_json::Value)>> {
        let row: Option<(DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
            "SELECT recorded_at, sample FROM telemetry_samples WHERE node_id = $1 ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn history(
        &self,
        node_id: NodeId,
        since: DateTime<Utc>,
        granularity: RollupGranularity,
        metric_extractor: &(dyn Fn(&serde_json::Value) -> Option<f64> + Send + Sync),
        metric_name: &str,
    ) -> PersistResult<Vec<HistoryBucket>> {
        let rows: Vec<(DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
            "SELECT recorded_at, sample FROM telemetry_samples WHERE node_id = $1 AND recorded_at >= $2 ORDER BY recorded_at ASC",
        )
        .bind(node_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(bucketize(&rows, granularity, metric_extractor, metric_name))
    }

    async fn record_opaque_snapshot(
        &self,
        table: &str,
        node_id: NodeId,
        recorded_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> PersistResult<()> {
        let allowed = [
            "service_status_snapshots",
            "smart_drive_snapshots",
            "gpu_snapshots",
            "ups_snapshots",
        ];
        if !allowed.contains(&table) {
            return Err(crate::PersistError::NotFound);
        }
        sqlx::query(&format!(
            "INSERT INTO {table} (node_id, recorded_at, payload) VALUES ($1,$2,$3) \
             ON CONFLICT (node_id, recorded_at) DO UPDATE SET payload = EXCLUDED.payload"
        ))
        .bind(node_id)
        .bind(recorded_at)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_opaque_snapshot(&self, table: &str, node_id: NodeId) -> PersistResult<Option<DateTime<Utc>>> {
        let allowed = [
            "service_status_snapshots",
            "smart_drive_snapshots",
            "gpu_snapshots",
            "ups_snapshots",
        ];
        if !allowed.contains(&table) {
            return Err(crate::PersistError::NotFound);
        }
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(&format!(
            "SELECT recorded_at FROM {table} WHERE node_id = $1 ORDER BY recorded_at DESC LIMIT 1"
        ))
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(ts,)| ts))
    }
}

// ─── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryTelemetryStore {
    samples: Mutex<HashMap<NodeId, Vec<(DateTime<Utc>, serde_json::Value)>>>,
    snapshots: Mutex<HashMap<(String, NodeId), Vec<(DateTime<Utc>, serde_json::Value)>>>,
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn record_sample(&self, node_id: NodeId, recorded_at: DateTime<Utc>, sample: serde_json::Value) -> PersistResult<()> {
        let mut samples = self.samples.lock();
        let entries = samples.entry(node_id).or_default();
        if let Some(existing) = entries.iter_mut().find(|(ts, _)| *ts == recorded_at) {
            existing.1 = sample;
        } else {
            entries.push((recorded_at, sample));
        }
        Ok(())
    }

    async fn latest_sample(&self, node_id: NodeId) -> PersistResult<Option<(DateTime<Utc>, serde_json::Value)>> {
        Ok(self
            .samples
            .lock()
            .get(&node_id)
            .and_then(|v| v.iter().max_by_key(|(ts, _)| *ts).cloned()))
    }

    async fn history(
        &self,
        node_id: NodeId,
        since: DateTime<Utc>,
        granularity: RollupGranularity,
        metric_extractor: &(dyn Fn(&serde_json::Value) -> Option<f64> + Send + Sync),
        metric_name: &str,
    ) -> PersistResult<Vec<HistoryBucket>> {
        let samples = self.samples.lock();
        let filtered: Vec<_> = samples
            .get(&node_id)
            .map(|v| v.iter().filter(|(ts, _)| *ts >= since).cloned().collect())
            .unwrap_or_default();
        Ok(bucketize(&filtered, granularity, metric_extractor, metric_name))
    }

    async fn record_opaque_snapshot(
        &self,
        table: &str,
        node_id: NodeId,
        recorded_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> PersistResult<()> {
        self.snapshots
            .lock()
            .entry((table.to_string(), node_id))
            .or_default()
            .push((recorded_at, payload));
        Ok(())
    }

    async fn latest_opaque_snapshot(&self, table: &str, node_id: NodeId) -> PersistResult<Option<DateTime<Utc>>> {
        Ok(self
            .snapshots
            .lock()
            .get(&(table.to_string(), node_id))
            .and_then(|v| v.iter().map(|(ts, _)| *ts).max()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_sample_picks_max_timestamp() {
        let store = InMemoryTelemetryStore::new();
        let node_id = uuid::Uuid::new_v4();
        let t0 = Utc::now();
        store.record_sample(node_id, t0, serde_json::json!({"cpu": 10.0})).await.unwrap();
        store
            .record_sample(node_id, t0 + Duration::seconds(5), serde_json::json!({"cpu": 20.0}))
            .await
            .unwrap();

        let (_, latest) = store.latest_sample(node_id).await.unwrap().unwrap();
        assert_eq!(latest["cpu"], 20.0);
    }

    #[tokio::test]
    async fn history_rolls_up_avg_min_max() {
        let store = InMemoryTelemetryStore::new();
        let node_id = uuid::Uuid::new_v4();
        let base = Utc::now();
        for i in 0..5 {
            store
                .record_sample(node_id, base + Duration::seconds(i), serde_json::json!({"cpu": (i * 10) as f64}))
                .await
                .unwrap();
        }

        let extractor = |v: &serde_json::Value| v.get("cpu").and_then(|c| c.as_f64());
        let buckets = store
            .history(node_id, base - Duration::seconds(1), RollupGranularity::Raw, &extractor, "cpu")
            .await
            .unwrap();
        assert_eq!(buckets.len(), 5);
        assert_eq!(buckets.last().unwrap().max, 40.0);
    }

    #[tokio::test]
    async fn latest_opaque_snapshot_picks_newest_timestamp() {
        let store = InMemoryTelemetryStore::new();
        let node_id = uuid::Uuid::new_v4();
        let base = Utc::now();
        store
            .record_opaque_snapshot("service_status_snapshots", node_id, base, serde_json::json!({}))
            .await
            .unwrap();
        store
            .record_opaque_snapshot("service_status_snapshots", node_id, base + Duration::seconds(30), serde_json::json!({}))
            .await
            .unwrap();

        let latest = store.latest_opaque_snapshot("service_status_snapshots", node_id).await.unwrap();
        assert_eq!(latest, Some(base + Duration::seconds(30)));
    }
}
