//! # PnL Scraper
//!
//! 通过轮换代理池批量抓取钱包指标的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（代理），只暴露能力
//! - `ProxyPool` - 唯一的代理 owner，提供 acquire() / release()
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，每次只处理一个目标
//! - `IdentityProvider` - 按代理生成请求身份
//! - `Fetcher` - 发一次请求并分类结果
//! - `SnapshotGate` - 达标指标落库
//! - `FailureLedger` - 记录放弃的目标
//! - `BatchQueue` - 从队列取批次
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个 worker"的完整处理流程
//! - `WorkerSlot` - 上下文封装（worker_id + 代理 + 计数）
//! - `Worker` - 流程编排（请求 → 重试 → 落库 / 失败清单 → 轮换 → 停顿）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 批次编排器，管理并发和汇总
//! - `orchestrator/consumer` - 队列消费循环和守护重启
//!
//! ## 模块结构

pub mod app;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod logger;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod workflow;

// 重新导出常用类型
pub use app::App;
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::ProxyPool;
pub use models::{Batch, FetchOutcome, Proxy, Snapshot, WalletStat};
pub use orchestrator::{run_consumer, supervise, BatchOrchestrator, BatchSummary};
pub use workflow::{Worker, WorkerDeps, WorkerReport, WorkerSettings, WorkerSlot, WorkerStats};
