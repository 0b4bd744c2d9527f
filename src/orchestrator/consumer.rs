//! 队列消费循环 - 编排层
//!
//! `run_consumer` 负责"取一条消息 → 交给编排器"，
//! `supervise` 负责在它崩溃后重启。

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AppResult;
use crate::models::Batch;
use crate::orchestrator::batch_processor::BatchOrchestrator;
use crate::services::BatchQueue;

/// 消费循环
///
/// - 超时取不到消息只是空闲，继续等待
/// - 消息格式错误或批次处理失败只记录日志
/// - 队列本身出错时返回错误，交给 `supervise` 重启
/// - 收到停机信号后退出；正在处理的批次会先收尾
pub async fn run_consumer<Q>(
    queue: &mut Q,
    orchestrator: &BatchOrchestrator,
    pop_timeout: Duration,
    shutdown: &CancellationToken,
) -> AppResult<()>
where
    Q: BatchQueue + ?Sized,
{
    info!("👂 开始监听队列 {}", queue.name());

    loop {
        let popped = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            popped = queue.pop(pop_timeout) => popped?,
        };

        let Some(raw) = popped else {
            debug!("队列 {} 暂无消息", queue.name());
            continue;
        };

        let batch = match Batch::from_message(&raw) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("⚠️ 丢弃无法解析的消息: {} (内容: {})", e, preview(&raw));
                continue;
            }
        };

        if batch.is_empty() {
            info!("批次 {}/{} 没有地址，跳过", batch.src, batch.token);
            continue;
        }

        info!(
            "📥 收到批次 src={} token={} 共 {} 个地址",
            batch.src,
            batch.token,
            batch.len()
        );
        if let Err(e) = orchestrator.run(&batch, shutdown).await {
            error!("❌ 批次 {} 处理失败: {}", batch.token, e);
        }
    }

    info!("队列 {} 的消费循环已停止", queue.name());
    Ok(())
}

/// 守护消费循环
///
/// 每次调用 `start` 得到一个新的消费任务（包含连接队列），放到独立的 task 里运行。
/// 任务出错或 panic 后等待 `restart_delay` 再重启，不设上限；只在停机时返回。
///
/// # 返回
/// 重启次数
pub async fn supervise<F, Fut>(
    restart_delay: Duration,
    shutdown: CancellationToken,
    mut start: F,
) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    let mut restarts = 0u64;

    while !shutdown.is_cancelled() {
        match tokio::spawn(start()).await {
            Ok(Ok(())) if shutdown.is_cancelled() => break,
            Ok(Ok(())) => warn!("⚠️ 消费循环意外退出"),
            Ok(Err(e)) => error!("❌ 消费循环出错: {}", e),
            Err(e) => error!("❌ 消费循环崩溃: {}", e),
        }

        restarts += 1;
        warn!(
            "🔁 {:.1}s 后重启消费循环（第 {} 次）",
            restart_delay.as_secs_f64(),
            restarts
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }

    info!("🛑 守护循环退出，共重启 {} 次", restarts);
    restarts
}

fn preview(raw: &str) -> String {
    const MAX: usize = 80;
    if raw.chars().count() > MAX {
        raw.chars().take(MAX).collect::<String>() + "..."
    } else {
        raw.to_string()
    }
}
