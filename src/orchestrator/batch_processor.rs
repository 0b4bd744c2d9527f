//! 批次编排器 - 编排层
//!
//! ## 职责
//!
//! 接收一个批次，把目标分给 N 个 worker 并发处理，汇总结果。
//!
//! ## 核心流程
//!
//! 1. **确定并发数**：`n = min(max_workers, 可用代理数, 目标数)`
//! 2. **轮询分片**：第 i 个 worker 处理 `targets[i::n]`
//! 3. **先租后启**：先租好 n 个代理，再启动任何 worker
//! 4. **并发控制**：Semaphore + tokio::spawn
//! 5. **汇总统计**：合并每个 worker 的计数为 `BatchSummary`
//!
//! ## 设计特点
//!
//! - 单个 worker 失败（包括 panic）不会中止批次
//! - 不处理单个目标的细节，全部委托给 `workflow::Worker`

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{Batch, Proxy};
use crate::workflow::{BatchProgress, Worker, WorkerDeps, WorkerExit, WorkerSettings, WorkerStats};

/// 批次汇总
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub src: String,
    pub token: String,
    pub targets: usize,
    pub workers: usize,
    /// panic 或提前终止的 worker
    pub failed_workers: usize,
    /// 因停机信号没处理完切片的 worker
    pub interrupted_workers: usize,
    pub stats: WorkerStats,
    pub elapsed: Duration,
}

impl BatchSummary {
    fn empty(batch: &Batch) -> Self {
        Self {
            src: batch.src.clone(),
            token: batch.token.clone(),
            targets: batch.len(),
            ..Default::default()
        }
    }
}

/// 批次编排器
pub struct BatchOrchestrator {
    deps: WorkerDeps,
    settings: WorkerSettings,
    max_workers: usize,
    progress_every: usize,
    semaphore: Arc<Semaphore>,
}

impl BatchOrchestrator {
    pub fn new(
        deps: WorkerDeps,
        settings: WorkerSettings,
        max_workers: usize,
        progress_every: usize,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            deps,
            settings,
            max_workers,
            progress_every,
            semaphore: Arc::new(Semaphore::new(max_workers)),
        }
    }

    pub fn from_config(config: &Config, deps: WorkerDeps) -> Self {
        Self::new(
            deps,
            WorkerSettings::from_config(config),
            config.max_workers,
            config.progress_every,
        )
    }

    /// 本批次实际使用的 worker 数
    pub fn worker_count(&self, targets: usize) -> usize {
        self.max_workers
            .min(self.deps.pool.available())
            .min(targets)
    }

    /// 处理一个批次
    ///
    /// # 返回
    /// 只有代理池本身不可用时返回错误；单个目标和 worker 的失败都体现在汇总里
    pub async fn run(
        &self,
        batch: &Batch,
        shutdown: &CancellationToken,
    ) -> AppResult<BatchSummary> {
        let started = Instant::now();
        let mut summary = BatchSummary::empty(batch);

        let n = self.worker_count(batch.len());
        if n == 0 {
            warn!(
                "⚠️ 批次 {}/{} 无法启动: 目标 {} 个，可用代理 {} 个",
                batch.src,
                batch.token,
                batch.len(),
                self.deps.pool.available()
            );
            return Ok(summary);
        }

        log_batch_start(batch, n);

        let Some(leases) = self.lease_proxies(n, shutdown).await? else {
            info!("批次 {} 在租用代理时收到停机信号", batch.token);
            summary.interrupted_workers = n;
            return Ok(summary);
        };

        let progress = Arc::new(BatchProgress::new(batch.len(), self.progress_every));
        let mut handles = Vec::with_capacity(n);

        for (idx, (proxy, slice)) in leases.into_iter().zip(batch.partition(n)).enumerate() {
            let worker_id = idx + 1;
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Other(format!("worker 信号量已关闭: {e}")))?;

            let worker = Worker::new(worker_id, proxy, self.deps.clone(), self.settings.clone());
            let progress = progress.clone();
            let shutdown = shutdown.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                worker.run(slice, progress, shutdown).await
            });
            handles.push((worker_id, handle));
        }
        summary.workers = handles.len();

        let (worker_ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (worker_id, joined) in worker_ids.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(report) => {
                    summary.stats.merge(&report.stats);
                    match report.exit {
                        WorkerExit::Completed => {}
                        WorkerExit::Shutdown => summary.interrupted_workers += 1,
                        WorkerExit::PoolUnavailable(_) => summary.failed_workers += 1,
                    }
                }
                Err(e) => {
                    error!("[W{:02}] 任务执行失败: {}", worker_id, e);
                    summary.failed_workers += 1;
                }
            }
        }

        summary.elapsed = started.elapsed();
        log_batch_complete(&summary, &self.deps);
        Ok(summary)
    }

    /// 先租好 n 个代理；停机时归还已租到的并返回 `None`
    async fn lease_proxies(
        &self,
        n: usize,
        shutdown: &CancellationToken,
    ) -> AppResult<Option<Vec<Proxy>>> {
        let mut leases = Vec::with_capacity(n);
        while leases.len() < n {
            let acquired = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                acquired = self.deps.pool.acquire() => Some(acquired),
            };

            match acquired {
                Some(Ok(proxy)) => leases.push(proxy),
                Some(Err(e)) => {
                    self.release_all(&leases);
                    return Err(e.into());
                }
                None => {
                    if !leases.is_empty() {
                        warn!(
                            "⚠️ 停机: 归还 {} 个尚未使用的代理，它们同样进入冷却",
                            leases.len()
                        );
                    }
                    self.release_all(&leases);
                    return Ok(None);
                }
            }
        }
        Ok(Some(leases))
    }

    fn release_all(&self, leases: &[Proxy]) {
        for proxy in leases {
            self.deps.pool.release(proxy);
        }
    }
}

// ========== 日志辅助函数 ==========

fn log_batch_start(batch: &Batch, workers: usize) {
    info!("{}", "=".repeat(60));
    info!("📦 开始处理批次 src={} token={}", batch.src, batch.token);
    info!("📄 目标 {} 个，worker {} 个", batch.len(), workers);
    info!("{}", "=".repeat(60));
}

fn log_batch_complete(summary: &BatchSummary, deps: &WorkerDeps) {
    let stats = &summary.stats;
    let pool = deps.pool.status();
    info!("{}", "─".repeat(60));
    info!(
        "✓ 批次 {} 完成，用时 {:.1}s",
        summary.token,
        summary.elapsed.as_secs_f64()
    );
    info!(
        "✅ 成功: {}/{}  💾 保存: {}  重复: {}",
        stats.ok, summary.targets, stats.saved, stats.duplicates
    );
    info!(
        "❌ 403: {}  429: {}  5xx: {}  异常: {}  格式错误: {}",
        stats.forbidden, stats.rate_limited, stats.server_error, stats.transient, stats.malformed
    );
    info!(
        "📒 放弃: {}  🔄 轮换: {}  worker 失败: {}  中断: {}",
        stats.exhausted, stats.rotations, summary.failed_workers, summary.interrupted_workers
    );
    info!(
        "🧮 代理池: 可用 {} / 使用中 {} / 冷却 {}",
        pool.ready, pool.leased, pool.cooling
    );
    info!("{}", "─".repeat(60));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::ProxyPool;
    use crate::services::{
        FailureLedger, FingerprintIdentityProvider, MemorySnapshotStore, SnapshotGate,
    };
    use crate::workflow::worker::tests::{ok, proxies, transient, ScriptedFetcher};
    use crate::workflow::Pacer;

    pub(crate) struct Fixture {
        pub(crate) orchestrator: BatchOrchestrator,
        pub(crate) fetcher: Arc<ScriptedFetcher>,
        pub(crate) pool: Arc<ProxyPool>,
        _dir: tempfile::TempDir,
    }

    pub(crate) async fn fixture(
        fetcher: ScriptedFetcher,
        proxy_count: usize,
        max_workers: usize,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(fetcher);
        let pool = Arc::new(ProxyPool::new(proxies(proxy_count), Duration::from_secs(10)));
        let deps = WorkerDeps {
            pool: pool.clone(),
            identities: Arc::new(FingerprintIdentityProvider::new(2)),
            fetcher: fetcher.clone(),
            gate: Arc::new(SnapshotGate::new(Arc::new(MemorySnapshotStore::new()), 0.6)),
            ledger: Arc::new(FailureLedger::open(dir.path().join("fail.txt")).await.unwrap()),
        };
        let settings = WorkerSettings {
            max_retries: 2,
            error_threshold: 10,
            max_proxy_lifetime: Duration::from_secs(3600),
            retry_backoff: Duration::from_millis(10),
            max_retry_after: Duration::from_secs(60),
            pacer: Pacer::disabled(),
        };
        Fixture {
            orchestrator: BatchOrchestrator::new(deps, settings, max_workers, 0),
            fetcher,
            pool,
            _dir: dir,
        }
    }

    pub(crate) fn batch(count: usize) -> Batch {
        let wallets = (0..count).map(|i| format!("wallet{i:03}")).collect();
        Batch::new("test", "tok", wallets)
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_target_attempted_exactly_once() {
        let f = fixture(ScriptedFetcher::new(ok(1.0)), 3, 20).await;
        let batch = batch(10);

        let summary = f.orchestrator.run(&batch, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.workers, 3);
        assert_eq!(summary.stats.processed, 10);
        assert_eq!(summary.stats.ok, 10);
        assert_eq!(summary.stats.saved, 10);
        assert_eq!(f.fetcher.calls.lock().unwrap().len(), 10);
        for wallet in &batch.wallets {
            assert_eq!(f.fetcher.calls_for(wallet), 1, "{wallet}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_count_is_bounded_by_each_limit() {
        let f = fixture(ScriptedFetcher::new(ok(0.0)), 5, 2).await;
        assert_eq!(f.orchestrator.worker_count(100), 2);
        assert_eq!(f.orchestrator.worker_count(1), 1);

        let f = fixture(ScriptedFetcher::new(ok(0.0)), 3, 20).await;
        assert_eq!(f.orchestrator.worker_count(100), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_proxies_return_to_pool_after_batch() {
        let f = fixture(ScriptedFetcher::new(transient()), 4, 20).await;

        let summary = f.orchestrator.run(&batch(8), &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.stats.exhausted, 8);
        assert_eq!(summary.failed_workers, 0);
        let status = f.pool.status();
        assert_eq!(status.leased, 0);
        assert_eq!(status.ready + status.cooling, 4);
    }

    #[tokio::test]
    async fn test_no_proxies_returns_empty_summary() {
        let f = fixture(ScriptedFetcher::new(ok(0.0)), 0, 20).await;

        let summary = f.orchestrator.run(&batch(5), &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.workers, 0);
        assert_eq!(summary.targets, 5);
        assert!(f.fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let f = fixture(ScriptedFetcher::new(ok(0.0)), 3, 20).await;

        let summary = f.orchestrator.run(&batch(0), &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.workers, 0);
        assert_eq!(f.pool.status().ready, 3);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_attempts_nothing() {
        let f = fixture(ScriptedFetcher::new(ok(0.0)), 3, 20).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let summary = f.orchestrator.run(&batch(6), &shutdown).await.unwrap();

        assert_eq!(summary.stats.processed, 0);
        assert!(f.fetcher.calls.lock().unwrap().is_empty());
        assert_eq!(f.pool.status().leased, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_leasing_returns_partial_leases() {
        let f = fixture(ScriptedFetcher::new(ok(0.0)), 2, 20).await;
        // 一个代理处于冷却，第二次租用要等 10s
        let cooling = f.pool.acquire().await.unwrap();
        f.pool.release(&cooling);

        let shutdown = CancellationToken::new();
        let stopper = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.cancel();
        };
        let jobs = batch(4);
        let (summary, _) = tokio::join!(f.orchestrator.run(&jobs, &shutdown), stopper);
        let summary = summary.unwrap();

        assert_eq!(summary.interrupted_workers, 2);
        assert_eq!(summary.stats.processed, 0);
        assert!(f.fetcher.calls.lock().unwrap().is_empty());
        let status = f.pool.status();
        assert_eq!(status.leased, 0);
        assert_eq!(status.cooling, 2);
    }
}
