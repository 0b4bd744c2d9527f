//! 代理池 - 基础设施层
//!
//! 持有有限的代理资源，只暴露"租用 / 归还"能力
//!
//! 每个代理任一时刻只处于一种状态：
//! - READY：可立即租出
//! - LEASED：被某个 worker 独占
//! - COOLING：归还后休息，`cooldown_until` 之前绝不会再被租出

use crate::error::PoolError;
use crate::models::Proxy;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// 无代理在冷却时的轮询间隔
const IDLE_POLL: Duration = Duration::from_millis(100);
/// 单次等待上限，保证能及时看到其他 worker 的归还
const MAX_POLL: Duration = Duration::from_secs(1);

/// 代理池状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatus {
    pub ready: usize,
    pub leased: usize,
    pub cooling: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    ready: VecDeque<Proxy>,
    leased: HashMap<String, Proxy>,
    /// 按到期时间排序（冷却时长固定，追加即有序）
    cooling: VecDeque<(Proxy, Instant)>,
}

impl PoolState {
    /// 把冷却到期的代理移回 READY
    fn recycle(&mut self, now: Instant) {
        while let Some((_, ready_at)) = self.cooling.front() {
            if *ready_at > now {
                break;
            }
            if let Some((proxy, _)) = self.cooling.pop_front() {
                debug!("代理 {} 冷却结束，重新可用", proxy);
                self.ready.push_back(proxy);
            }
        }
    }

    fn total(&self) -> usize {
        self.ready.len() + self.leased.len() + self.cooling.len()
    }
}

/// 带冷却窗口的代理池
///
/// 所有状态由一把互斥锁保护；锁从不跨越 `.await` 持有。
#[derive(Debug)]
pub struct ProxyPool {
    state: Mutex<PoolState>,
    cool_down: Duration,
}

impl ProxyPool {
    /// 创建代理池，重复的代理只保留一个
    pub fn new(proxies: Vec<Proxy>, cool_down: Duration) -> Self {
        let mut ready: VecDeque<Proxy> = VecDeque::with_capacity(proxies.len());
        for proxy in proxies {
            if ready.iter().any(|p| p.key() == proxy.key()) {
                warn!("忽略重复代理 {}", proxy);
                continue;
            }
            ready.push_back(proxy);
        }

        Self {
            state: Mutex::new(PoolState {
                ready,
                ..Default::default()
            }),
            cool_down,
        }
    }

    pub fn cool_down(&self) -> Duration {
        self.cool_down
    }

    /// 租用一个代理
    ///
    /// 没有 READY 代理时阻塞等待最早的冷却到期；等待期间不持有锁。
    /// 并发调用者永远不会拿到同一个代理。
    pub async fn acquire(&self) -> Result<Proxy, PoolError> {
        loop {
            let wait = {
                let mut state = self.lock();
                let now = Instant::now();
                state.recycle(now);

                if let Some(proxy) = state.ready.pop_front() {
                    state.leased.insert(proxy.key().to_string(), proxy.clone());
                    return Ok(proxy);
                }
                if state.total() == 0 {
                    return Err(PoolError::Empty);
                }

                match state.cooling.front() {
                    Some((_, ready_at)) => ready_at.saturating_duration_since(now),
                    None => IDLE_POLL,
                }
            };

            sleep(wait.clamp(Duration::from_millis(1), MAX_POLL)).await;
        }
    }

    /// 归还代理：LEASED → COOLING
    ///
    /// 对未处于 LEASED 状态的代理调用时只记录警告，不改变任何状态。
    pub fn release(&self, proxy: &Proxy) {
        let mut state = self.lock();
        match state.leased.remove(proxy.key()) {
            Some(proxy) => {
                let ready_at = Instant::now() + self.cool_down;
                debug!("代理 {} 进入冷却 {:?}", proxy, self.cool_down);
                state.cooling.push_back((proxy, ready_at));
            }
            None => {
                warn!("⚠️ 归还未租出的代理 {}，忽略", proxy);
            }
        }
    }

    /// 未被租出的代理数量（READY + COOLING）
    pub fn available(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.cooling.len()
    }

    pub fn status(&self) -> PoolStatus {
        let mut state = self.lock();
        state.recycle(Instant::now());
        PoolStatus {
            ready: state.ready.len(),
            leased: state.leased.len(),
            cooling: state.cooling.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // 持锁期间不会 panic，中毒时直接取回内部状态
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn proxies(n: usize) -> Vec<Proxy> {
        (0..n)
            .map(|i| Proxy::parse(&format!("10.0.0.{}:800{}:user:pass", i + 1, i)).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_acquire_waits_for_cooldown() {
        let pool = ProxyPool::new(proxies(3), Duration::from_secs(10));

        let start = Instant::now();
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let _c = pool.acquire().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        pool.release(&a);
        let d = pool.acquire().await.unwrap();

        assert_eq!(d, a);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_returns_cooling_proxy_early() {
        let pool = ProxyPool::new(proxies(1), Duration::from_secs(30));
        let p = pool.acquire().await.unwrap();
        pool.release(&p);

        let released_at = Instant::now();
        let again = pool.acquire().await.unwrap();
        assert_eq!(again, p);
        assert!(released_at.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_of_unleased_proxy_is_noop() {
        let pool = ProxyPool::new(proxies(2), Duration::from_secs(5));
        let stranger = Proxy::parse("9.9.9.9:1:u:p").unwrap();

        pool.release(&stranger);
        assert_eq!(
            pool.status(),
            PoolStatus {
                ready: 2,
                leased: 0,
                cooling: 0
            }
        );

        let p = pool.acquire().await.unwrap();
        pool.release(&p);
        pool.release(&p);
        pool.release(&p);
        assert_eq!(
            pool.status(),
            PoolStatus {
                ready: 1,
                leased: 0,
                cooling: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_returns_distinct_proxies() {
        let pool = Arc::new(ProxyPool::new(proxies(5), Duration::from_secs(60)));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire().await.unwrap() })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let proxy = handle.await.unwrap();
            assert!(seen.insert(proxy.key().to_string()), "同一代理被租出两次");
        }
        assert_eq!(pool.status().leased, 5);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_acquirer_blocks_until_one_cools_down() {
        let pool = Arc::new(ProxyPool::new(proxies(2), Duration::from_secs(20)));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap() })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        pool.release(&b);
        let got = waiter.await.unwrap();
        assert_eq!(got, b);
        assert_ne!(got, a);
    }

    #[tokio::test]
    async fn test_empty_pool_errors() {
        let pool = ProxyPool::new(Vec::new(), Duration::from_secs(1));
        assert_eq!(pool.acquire().await, Err(PoolError::Empty));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut list = proxies(2);
        list.push(list[0].clone());
        let pool = ProxyPool::new(list, Duration::from_secs(1));
        assert_eq!(pool.len(), 2);
    }
}
