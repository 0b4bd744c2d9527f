//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批次调度和进程级的存活保障，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批次编排器
//! - 计算 worker 数量，轮询切分目标
//! - 先租代理，再并发启动 worker（Semaphore）
//! - 汇总每个 worker 的计数，输出批次统计
//!
//! ### `consumer` - 队列消费循环
//! - 带超时地从队列取消息，解析为批次
//! - 交给 `BatchOrchestrator` 处理
//! - `supervise` 在循环崩溃后延时重启
//!
//! ## 层次关系
//!
//! ```text
//! consumer::supervise (进程级守护)
//!     ↓
//! consumer::run_consumer (处理 Vec<Batch>)
//!     ↓
//! batch_processor (处理 Vec<Target>，分给 N 个 worker)
//!     ↓
//! workflow::Worker (处理单个目标切片)
//!     ↓
//! services (能力层：identity / fetcher / store / ledger / queue)
//!     ↓
//! infrastructure (基础设施：ProxyPool)
//! ```
//!
//! ## 设计原则
//!
//! 1. **故障隔离**：目标不影响目标，worker 不影响批次，批次不影响循环
//! 2. **向下依赖**：编排层 → workflow → services → infrastructure
//! 3. **无业务逻辑**：只做调度和统计，不做具体业务判断

pub mod batch_processor;
pub mod consumer;

// 重新导出主要类型
pub use batch_processor::{BatchOrchestrator, BatchSummary};
pub use consumer::{run_consumer, supervise};
