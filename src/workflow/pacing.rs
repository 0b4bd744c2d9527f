//! 目标之间的随机停顿
//!
//! 固定间隔的请求序列很容易被识别，所以停顿服从指数分布，
//! 偶尔再叠加一次 30–90 秒的长停顿。

use rand::Rng;
use std::time::Duration;

/// 长停顿的区间（秒）
const OUTLIER_RANGE_SEC: (f64, f64) = (30.0, 90.0);

/// 停顿生成器
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    mean_sec: f64,
    outlier_prob: f64,
}

impl Pacer {
    pub fn new(mean_sec: f64, outlier_prob: f64) -> Self {
        Self {
            mean_sec: mean_sec.max(0.0),
            outlier_prob: outlier_prob.clamp(0.0, 1.0),
        }
    }

    /// 平均值为 0 时不停顿，测试中常用
    pub fn disabled() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn is_disabled(&self) -> bool {
        self.mean_sec == 0.0 && self.outlier_prob == 0.0
    }

    /// 生成下一次停顿时长
    pub fn next_delay(&self) -> Duration {
        self.next_delay_with(&mut rand::rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let mut secs = 0.0;

        if self.mean_sec > 0.0 {
            // 逆变换采样：U ∈ [0, 1)，1 - U ∈ (0, 1]，ln 不会溢出
            let u: f64 = rng.random();
            secs += -(1.0 - u).ln() * self.mean_sec;
        }

        if self.outlier_prob > 0.0 && rng.random_bool(self.outlier_prob) {
            let (lo, hi) = OUTLIER_RANGE_SEC;
            secs += rng.random_range(lo..hi);
        }

        Duration::from_secs_f64(secs)
    }
}
