//! 单个 Worker 的处理流程 - 流程层
//!
//! 核心职责：持有一个租用的代理，顺序处理分到的目标切片
//!
//! 每个目标的状态机：
//! 1. 请求 → `Success` → 门控落库，错误计数清零
//! 2. `Forbidden` / `RateLimited` / `ServerError` / `TransientError` → 计数 +1，退避后重试
//! 3. `MalformedPayload` 或重试耗尽 → 写入失败清单
//!
//! 每个目标结束后（切片最后一个除外）检查是否需要轮换代理，然后随机停顿。

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::PoolError;
use crate::infrastructure::ProxyPool;
use crate::models::{FetchOutcome, Proxy};
use crate::services::fetcher::short;
use crate::services::{Fetcher, FailureLedger, IdentityProvider, SaveOutcome, SnapshotGate};
use crate::workflow::pacing::Pacer;

/// Worker 运行参数
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_retries: usize,
    pub error_threshold: usize,
    pub max_proxy_lifetime: Duration,
    pub retry_backoff: Duration,
    /// Retry-After 提示的上限
    pub max_retry_after: Duration,
    pub pacer: Pacer,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            error_threshold: config.error_threshold,
            max_proxy_lifetime: config.max_proxy_lifetime(),
            retry_backoff: config.retry_backoff(),
            max_retry_after: config.max_retry_after(),
            pacer: Pacer::new(config.avg_delay_sec, config.pause_outlier_prob),
        }
    }
}

/// Worker 共享的能力集合
///
/// 全部是 `Arc`，clone 给每个 worker 一份。
#[derive(Clone)]
pub struct WorkerDeps {
    pub pool: Arc<ProxyPool>,
    pub identities: Arc<dyn IdentityProvider>,
    pub fetcher: Arc<dyn Fetcher>,
    pub gate: Arc<SnapshotGate>,
    pub ledger: Arc<FailureLedger>,
}

/// Worker 的运行时状态
///
/// 封装"我是哪个 worker、用着哪个代理、已经连错几次"
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub worker_id: usize,
    pub proxy: Proxy,
    /// 当前代理上的连续失败次数
    pub error_streak: usize,
    /// 当前代理上发出的请求数，传给身份提供者
    pub request_count: u64,
    pub lease_started_at: Instant,
    /// 代理是否仍由本 worker 持有
    holding: bool,
}

impl WorkerSlot {
    pub fn new(worker_id: usize, proxy: Proxy) -> Self {
        Self {
            worker_id,
            proxy,
            error_streak: 0,
            request_count: 0,
            lease_started_at: Instant::now(),
            holding: true,
        }
    }

    pub fn proxy_age(&self) -> Duration {
        self.lease_started_at.elapsed()
    }

    fn reassign(&mut self, proxy: Proxy) {
        self.proxy = proxy;
        self.error_streak = 0;
        self.request_count = 0;
        self.lease_started_at = Instant::now();
        self.holding = true;
    }
}

impl Display for WorkerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[W{:02} {}]", self.worker_id, self.proxy)
    }
}

/// 单个 worker 的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// 处理完的目标数（成功或放弃）
    pub processed: usize,
    pub ok: usize,
    pub forbidden: usize,
    pub rate_limited: usize,
    pub server_error: usize,
    pub transient: usize,
    pub malformed: usize,
    /// 写入失败清单的目标数
    pub exhausted: usize,
    pub saved: usize,
    pub duplicates: usize,
    pub rotations: usize,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.processed += other.processed;
        self.ok += other.ok;
        self.forbidden += other.forbidden;
        self.rate_limited += other.rate_limited;
        self.server_error += other.server_error;
        self.transient += other.transient;
        self.malformed += other.malformed;
        self.exhausted += other.exhausted;
        self.saved += other.saved;
        self.duplicates += other.duplicates;
        self.rotations += other.rotations;
    }

    fn count_failure(&mut self, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Forbidden => self.forbidden += 1,
            FetchOutcome::RateLimited { .. } => self.rate_limited += 1,
            FetchOutcome::ServerError { .. } => self.server_error += 1,
            FetchOutcome::TransientError { .. } => self.transient += 1,
            FetchOutcome::MalformedPayload { .. } => self.malformed += 1,
            FetchOutcome::Success(_) => {}
        }
    }
}

/// Worker 退出原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// 切片全部处理完
    Completed,
    /// 收到停机信号，剩余目标未处理
    Shutdown,
    /// 轮换时拿不到新代理
    PoolUnavailable(PoolError),
}

/// Worker 交给编排层的报告
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub assigned: usize,
    pub stats: WorkerStats,
    pub exit: WorkerExit,
}

impl WorkerReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.exit, WorkerExit::PoolUnavailable(_))
    }
}

/// 批次进度，所有 worker 共享
#[derive(Debug)]
pub struct BatchProgress {
    total: usize,
    every: usize,
    done: AtomicUsize,
}

impl BatchProgress {
    pub fn new(total: usize, every: usize) -> Self {
        Self {
            total,
            every,
            done: AtomicUsize::new(0),
        }
    }

    pub fn tick(&self) -> usize {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if self.every > 0 && done % self.every == 0 {
            info!("⏳ 进度: {}/{}", done, self.total);
        }
        done
    }
}

/// Worker
///
/// - 只处理自己的切片，不与其他 worker 共享状态（代理池除外）
/// - 单个目标的失败不会中止 worker
/// - 退出时归还代理
pub struct Worker {
    slot: WorkerSlot,
    deps: WorkerDeps,
    settings: WorkerSettings,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(worker_id: usize, proxy: Proxy, deps: WorkerDeps, settings: WorkerSettings) -> Self {
        Self {
            slot: WorkerSlot::new(worker_id, proxy),
            deps,
            settings,
            stats: WorkerStats::default(),
        }
    }

    pub async fn run(
        mut self,
        targets: Vec<String>,
        progress: Arc<BatchProgress>,
        shutdown: CancellationToken,
    ) -> WorkerReport {
        let assigned = targets.len();
        info!("{} ▶ 开始处理 {} 个目标", self.slot, assigned);

        let mut exit = WorkerExit::Completed;
        for (idx, target) in targets.iter().enumerate() {
            if shutdown.is_cancelled() {
                info!("{} 收到停机信号，剩余 {} 个目标未处理", self.slot, assigned - idx);
                exit = WorkerExit::Shutdown;
                break;
            }

            self.process_target(target).await;
            self.stats.processed += 1;
            progress.tick();

            // 最后一个目标之后不再轮换，退出时的归还已经让代理进入冷却
            if idx + 1 == assigned {
                break;
            }

            if let Err(e) = self.maybe_rotate(&shutdown).await {
                exit = e;
                break;
            }

            self.pace(&shutdown).await;
        }

        self.release_proxy();

        match &exit {
            WorkerExit::PoolUnavailable(e) => {
                error!("{} ❌ 提前结束: {}", self.slot, e);
            }
            _ => info!(
                "{} ■ 结束: 成功 {} / 放弃 {} / 轮换 {}",
                self.slot, self.stats.ok, self.stats.exhausted, self.stats.rotations
            ),
        }

        WorkerReport {
            worker_id: self.slot.worker_id,
            assigned,
            stats: self.stats,
            exit,
        }
    }

    async fn process_target(&mut self, target: &str) {
        let max_retries = self.settings.max_retries.max(1);

        for attempt in 1..=max_retries {
            self.slot.request_count += 1;
            let identity = self
                .deps
                .identities
                .identity_for(&self.slot.proxy, self.slot.request_count);
            let outcome = self
                .deps
                .fetcher
                .fetch(target, &self.slot.proxy, &identity)
                .await;

            let backoff = match &outcome {
                FetchOutcome::Success(stat) => {
                    self.stats.ok += 1;
                    self.slot.error_streak = 0;
                    info!(
                        "{} ✓ {} 第 {} 次: pnl={:.3}",
                        self.slot,
                        short(target),
                        attempt,
                        stat.pnl
                    );
                    self.persist(target, stat.pnl).await;
                    return;
                }
                FetchOutcome::Forbidden => {
                    self.deps.identities.invalidate(&self.slot.proxy);
                    self.settings.retry_backoff
                }
                FetchOutcome::RateLimited { retry_after } => {
                    let hint = retry_after
                        .unwrap_or_default()
                        .min(self.settings.max_retry_after);
                    self.settings.retry_backoff * 2 + hint
                }
                _ => self.settings.retry_backoff,
            };

            self.stats.count_failure(&outcome);
            if !outcome.is_retryable() {
                warn!(
                    "{} ⚠️ {} 第 {} 次: {}，不再重试",
                    self.slot,
                    short(target),
                    attempt,
                    outcome
                );
                break;
            }
            self.slot.error_streak += 1;
            warn!(
                "{} {} 第 {}/{} 次: {}",
                self.slot,
                short(target),
                attempt,
                max_retries,
                outcome
            );

            if attempt < max_retries && !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
        }

        self.give_up(target).await;
    }

    async fn persist(&mut self, target: &str, metric: f64) {
        match self.deps.gate.save_if_qualifying(target, metric).await {
            Ok(SaveOutcome::Saved) => {
                self.stats.saved += 1;
                info!("{} 💾 {} 已保存 pnl={:.3}", self.slot, short(target), metric);
            }
            Ok(SaveOutcome::Duplicate) => self.stats.duplicates += 1,
            Ok(SaveOutcome::BelowThreshold) => {
                debug!(
                    "{} {} 未达阈值 {:.3}",
                    self.slot,
                    short(target),
                    self.deps.gate.threshold()
                );
            }
            Err(e) => error!("{} ❌ {} 保存失败: {}", self.slot, short(target), e),
        }
    }

    async fn give_up(&mut self, target: &str) {
        self.stats.exhausted += 1;
        match self.deps.ledger.record(target).await {
            Ok(true) => warn!("{} 📒 {} 已写入失败清单", self.slot, short(target)),
            Ok(false) => debug!("{} {} 已在失败清单中", self.slot, short(target)),
            Err(e) => error!("{} ❌ {} 写入失败清单出错: {}", self.slot, short(target), e),
        }
    }

    async fn maybe_rotate(&mut self, shutdown: &CancellationToken) -> Result<(), WorkerExit> {
        let too_many_errors = self.slot.error_streak >= self.settings.error_threshold;
        let too_old = self.slot.proxy_age() >= self.settings.max_proxy_lifetime;
        if !too_many_errors && !too_old {
            return Ok(());
        }

        let reason = if too_many_errors {
            format!("连续失败 {} 次", self.slot.error_streak)
        } else {
            format!("已使用 {}s", self.slot.proxy_age().as_secs())
        };
        self.rotate_proxy(&reason, shutdown).await
    }

    /// 归还当前代理，换一个新的，计数和年龄清零
    pub async fn rotate_proxy(
        &mut self,
        reason: &str,
        shutdown: &CancellationToken,
    ) -> Result<(), WorkerExit> {
        info!("{} 🔄 轮换代理: {}", self.slot, reason);
        self.release_proxy();

        let acquired = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(WorkerExit::Shutdown),
            acquired = self.deps.pool.acquire() => acquired,
        };

        let proxy = acquired.map_err(WorkerExit::PoolUnavailable)?;
        self.slot.reassign(proxy);
        self.stats.rotations += 1;
        debug!("{} 新代理就绪", self.slot);
        Ok(())
    }

    async fn pace(&self, shutdown: &CancellationToken) {
        if self.settings.pacer.is_disabled() {
            return;
        }
        let delay = self.settings.pacer.next_delay();
        if delay.is_zero() {
            return;
        }
        debug!("{} 停顿 {:.1}s", self.slot, delay.as_secs_f64());
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn release_proxy(&mut self) {
        if self.slot.holding {
            self.deps.pool.release(&self.slot.proxy);
            self.slot.holding = false;
        }
    }
}
