use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// 单个地址的指标快照，每个 (地址, UTC 自然日) 最多保留一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub address: String,
    pub metric: f64,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(address: impl Into<String>, metric: f64) -> Self {
        Self::at(address, metric, Utc::now())
    }

    /// 指标在这里保留三位小数，阈值判断使用原始值
    pub fn at(address: impl Into<String>, metric: f64, taken_at: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            metric: round_metric(metric),
            taken_at,
        }
    }

    /// 唯一键中的日期部分
    pub fn day(&self) -> NaiveDate {
        self.taken_at.date_naive()
    }
}

fn round_metric(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_rounded_to_three_places() {
        assert_eq!(Snapshot::new("w", 1.23456).metric, 1.235);
        assert_eq!(Snapshot::new("w", 0.6004).metric, 0.6);
        assert_eq!(Snapshot::new("w", -0.4).metric, -0.4);
    }
}
