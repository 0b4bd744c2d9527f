//! 应用装配
//!
//! 从 `Config` 构建代理池、身份、请求、存储、失败清单和编排器，
//! 然后在守护循环里消费 Redis 队列直到收到 Ctrl-C。

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::infrastructure::ProxyPool;
use crate::models::Proxy;
use crate::orchestrator::{run_consumer, supervise, BatchOrchestrator};
use crate::services::{
    FailureLedger, FingerprintIdentityProvider, HttpFetcher, MemorySnapshotStore,
    PostgresSnapshotStore, RedisBatchQueue, SnapshotGate, SnapshotStore,
};
use crate::workflow::WorkerDeps;

/// 应用主结构
pub struct App {
    config: Config,
    pool: Arc<ProxyPool>,
    orchestrator: Arc<BatchOrchestrator>,
    shutdown: CancellationToken,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        log_startup(&config);

        let proxies = load_proxies(&config)?;
        if proxies.is_empty() {
            warn!("⚠️ 没有可用代理，所有批次都会被跳过");
        }
        let pool = Arc::new(ProxyPool::new(proxies, config.cool_down()));
        info!("✓ 代理池就绪: {} 个代理", pool.len());

        let store = open_store(&config).await?;
        let ledger = FailureLedger::open(&config.fail_wallets_file)
            .await
            .context("打开失败清单失败")?;

        let deps = WorkerDeps {
            pool: pool.clone(),
            identities: Arc::new(FingerprintIdentityProvider::new(config.identities_per_proxy)),
            fetcher: Arc::new(HttpFetcher::new(
                config.api_url_template.clone(),
                config.request_timeout(),
            )),
            gate: Arc::new(SnapshotGate::new(store, config.metric_threshold)),
            ledger: Arc::new(ledger),
        };
        let orchestrator = Arc::new(BatchOrchestrator::from_config(&config, deps));

        Ok(Self {
            config,
            pool,
            orchestrator,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn orchestrator(&self) -> Arc<BatchOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 运行应用主逻辑，直到收到停机信号
    pub async fn run(self) -> Result<()> {
        spawn_ctrl_c_handler(self.shutdown.clone());

        let redis_url = self.config.redis_url.clone();
        let queue_name = self.config.redis_queue.clone();
        let pop_timeout = self.config.queue_pop_timeout();
        let orchestrator = self.orchestrator.clone();
        let shutdown = self.shutdown.clone();

        let restarts = supervise(self.config.restart_delay(), self.shutdown.clone(), move || {
            let redis_url = redis_url.clone();
            let queue_name = queue_name.clone();
            let orchestrator = orchestrator.clone();
            let shutdown = shutdown.clone();
            async move {
                let mut queue = RedisBatchQueue::connect(&redis_url, queue_name).await?;
                run_consumer(&mut queue, &orchestrator, pop_timeout, &shutdown).await
            }
        })
        .await;

        print_final_stats(&self.pool, restarts);
        Ok(())
    }
}

/// 读取代理：`PROXY_LIST` 优先，否则读 `PROXIES_FILE`
fn load_proxies(config: &Config) -> Result<Vec<Proxy>> {
    if let Some(list) = &config.proxy_list {
        info!("📋 从 PROXY_LIST 读取代理");
        return Ok(Proxy::parse_list(list.split(','))?);
    }

    info!("📋 从 {} 读取代理", config.proxies_file);
    let content = std::fs::read_to_string(&config.proxies_file)
        .with_context(|| format!("读取代理文件 {} 失败", config.proxies_file))?;
    Ok(Proxy::parse_list(content.lines())?)
}

async fn open_store(config: &Config) -> Result<Arc<dyn SnapshotStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresSnapshotStore::connect(url)
                .await
                .context("连接 PostgreSQL 失败")?;
            store.ensure_schema().await.context("初始化数据表失败")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("⚠️ 未配置 DATABASE_URL，快照只保存在内存中");
            Ok(Arc::new(MemorySnapshotStore::new()))
        }
    }
}

fn spawn_ctrl_c_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 收到 Ctrl-C，正在等待 worker 完成当前目标...");
            shutdown.cancel();
        }
    });
}

// ========== 日志辅助函数 ==========

fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 代理轮换抓取模式");
    info!("📊 最大 worker 数: {}", config.max_workers);
    info!(
        "🔁 单目标最多 {} 次，连续失败 {} 次或使用 {}s 后轮换代理",
        config.max_retries, config.error_threshold, config.max_proxy_lifetime_sec
    );
    info!(
        "🧊 代理冷却 {}s，平均停顿 {:.1}s，落库阈值 {}",
        config.cool_down_sec, config.avg_delay_sec, config.metric_threshold
    );
    info!("📮 队列: {}", config.redis_queue);
    info!("{}", "=".repeat(60));
}

fn print_final_stats(pool: &ProxyPool, restarts: u64) {
    let status = pool.status();
    info!("\n{}", "=".repeat(60));
    info!("📊 程序退出");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!(
        "🧮 代理池: 可用 {} / 使用中 {} / 冷却 {}",
        status.ready, status.leased, status.cooling
    );
    info!("🔁 消费循环重启次数: {}", restarts);
    info!("{}", "=".repeat(60));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Batch;

    #[tokio::test]
    async fn test_initialize_with_inline_proxies_and_memory_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            proxy_list: Some("1.1.1.1:80:u:p, 2.2.2.2:80".to_string()),
            database_url: None,
            fail_wallets_file: dir.path().join("fail.txt").display().to_string(),
            ..Config::default()
        };

        let app = App::initialize(config).await.unwrap();

        assert_eq!(app.pool.len(), 2);
        assert_eq!(app.orchestrator().worker_count(10), 2);
    }

    #[tokio::test]
    async fn test_initialize_fails_on_missing_proxy_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            proxy_list: None,
            proxies_file: dir.path().join("nope.txt").display().to_string(),
            fail_wallets_file: dir.path().join("fail.txt").display().to_string(),
            ..Config::default()
        };

        assert!(App::initialize(config).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_pool_skips_batches() {
        let dir = tempfile::tempdir().unwrap();
        let proxies = dir.path().join("proxies.txt");
        std::fs::write(&proxies, "# nothing here\n\n").unwrap();
        let config = Config {
            proxies_file: proxies.display().to_string(),
            fail_wallets_file: dir.path().join("fail.txt").display().to_string(),
            ..Config::default()
        };

        let app = App::initialize(config).await.unwrap();
        let summary = app
            .orchestrator()
            .run(
                &Batch::new("s", "t", vec!["w".to_string()]),
                &app.shutdown_token(),
            )
            .await
            .unwrap();

        assert_eq!(summary.workers, 0);
    }
}
