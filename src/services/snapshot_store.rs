//! 快照存储服务 - 业务能力层
//!
//! 只负责"把达标的指标写一次"，重复写入视为成功

use crate::error::StoreError;
use crate::models::Snapshot;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// 插入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// (地址, 日期) 已存在，本次丢弃
    Duplicate,
}

/// 快照存储
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn insert(&self, snapshot: &Snapshot) -> Result<InsertOutcome, StoreError>;
}

/// 门控结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    BelowThreshold,
    Saved,
    Duplicate,
}

/// 持久化门控：指标严格大于阈值才写入
pub struct SnapshotGate {
    store: std::sync::Arc<dyn SnapshotStore>,
    threshold: f64,
}

impl SnapshotGate {
    pub fn new(store: std::sync::Arc<dyn SnapshotStore>, threshold: f64) -> Self {
        Self { store, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn save_if_qualifying(
        &self,
        target: &str,
        metric: f64,
    ) -> Result<SaveOutcome, StoreError> {
        if metric <= self.threshold {
            return Ok(SaveOutcome::BelowThreshold);
        }

        match self.store.insert(&Snapshot::new(target, metric)).await? {
            InsertOutcome::Inserted => Ok(SaveOutcome::Saved),
            InsertOutcome::Duplicate => {
                debug!("{} 今日快照已存在，忽略", target);
                Ok(SaveOutcome::Duplicate)
            }
        }
    }
}

// ========== PostgreSQL ==========

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS wallet_snapshot (
    id           BIGSERIAL PRIMARY KEY,
    address      VARCHAR(64)    NOT NULL,
    pnl          NUMERIC(18, 3) NOT NULL,
    ts_utc       TIMESTAMPTZ    NOT NULL,
    snapshot_day DATE           NOT NULL,
    CONSTRAINT uix_address_day UNIQUE (address, snapshot_day)
)
"#;

const INSERT_SNAPSHOT: &str = r#"
INSERT INTO wallet_snapshot (address, pnl, ts_utc, snapshot_day)
VALUES ($1, $2::numeric(18, 3), $3, $4)
"#;

/// PostgreSQL 存储，唯一约束冲突（23505）视为重复
#[derive(Clone)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresSnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSnapshotStore")
            .field("pool", &"PgPool")
            .finish()
    }
}

impl PostgresSnapshotStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::database("connect", e))?;
        info!("✓ 已连接 PostgreSQL");
        Ok(Self { pool })
    }

    /// 建表（幂等）
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database("create table", e))?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn insert(&self, snapshot: &Snapshot) -> Result<InsertOutcome, StoreError> {
        let res = sqlx::query(INSERT_SNAPSHOT)
            .bind(&snapshot.address)
            .bind(snapshot.metric)
            .bind(snapshot.taken_at)
            .bind(snapshot.day())
            .execute(&self.pool)
            .await;

        match res {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if StoreError::is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(StoreError::database("insert snapshot", e)),
        }
    }
}

// ========== 内存存储 ==========

/// 内存存储，未配置数据库时和测试中使用
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    rows: Mutex<HashMap<(String, NaiveDate), Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, NaiveDate), Snapshot>> {
        self.rows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn insert(&self, snapshot: &Snapshot) -> Result<InsertOutcome, StoreError> {
        let mut rows = self.lock();
        let key = (snapshot.address.clone(), snapshot.day());
        if rows.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        rows.insert(key, snapshot.clone());
        Ok(InsertOutcome::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn gate(threshold: f64) -> (SnapshotGate, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::new());
        (SnapshotGate::new(store.clone(), threshold), store)
    }

    #[tokio::test]
    async fn test_threshold_boundary_is_exclusive() {
        let (gate, store) = gate(0.6);

        assert_eq!(
            gate.save_if_qualifying("a", 0.6).await.unwrap(),
            SaveOutcome::BelowThreshold
        );
        assert_eq!(
            gate.save_if_qualifying("b", -3.0).await.unwrap(),
            SaveOutcome::BelowThreshold
        );
        assert!(store.is_empty());

        assert_eq!(
            gate.save_if_qualifying("a", 0.601).await.unwrap(),
            SaveOutcome::Saved
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_same_day_keeps_first_row() {
        let (gate, store) = gate(0.0);

        assert_eq!(
            gate.save_if_qualifying("w", 1.0).await.unwrap(),
            SaveOutcome::Saved
        );
        assert_eq!(
            gate.save_if_qualifying("w", 2.0).await.unwrap(),
            SaveOutcome::Duplicate
        );

        let rows = store.snapshots();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metric, 1.0);
    }

    #[tokio::test]
    async fn test_memory_store_keys_by_calendar_day() {
        let store = MemorySnapshotStore::new();
        let morning = Utc.with_ymd_and_hms(2025, 8, 1, 0, 5, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2025, 8, 1, 23, 55, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2025, 8, 2, 0, 1, 0).unwrap();

        let expected = [
            (morning, InsertOutcome::Inserted),
            (evening, InsertOutcome::Duplicate),
            (next_day, InsertOutcome::Inserted),
        ];
        for (at, outcome) in expected {
            let snapshot = Snapshot::at("w", 1.0, at);
            assert_eq!(store.insert(&snapshot).await.unwrap(), outcome);
        }
        assert_eq!(store.len(), 2);
    }
}
