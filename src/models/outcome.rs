use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// 单次请求的分类结果，由 Worker 立即消费，不落库
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(WalletStat),
    /// 403，身份/会话可能过期
    Forbidden,
    /// 429，附带 Retry-After 提示
    RateLimited { retry_after: Option<Duration> },
    /// 5xx
    ServerError { status: u16 },
    /// 超时、连接失败、其他非预期状态码
    TransientError { reason: String },
    /// 2xx 但缺少必需字段
    MalformedPayload { reason: String },
}

impl FetchOutcome {
    /// Worker 是否应该在同一代理上重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchOutcome::Forbidden
                | FetchOutcome::RateLimited { .. }
                | FetchOutcome::ServerError { .. }
                | FetchOutcome::TransientError { .. }
        )
    }
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchOutcome::Success(stat) => write!(f, "OK pnl={:.3}", stat.pnl),
            FetchOutcome::Forbidden => write!(f, "HTTP 403 FORBIDDEN"),
            FetchOutcome::RateLimited { retry_after } => {
                write!(f, "HTTP 429 RATE_LIMIT (retry-after: {:?})", retry_after)
            }
            FetchOutcome::ServerError { status } => write!(f, "HTTP {} SERVER_ERROR", status),
            FetchOutcome::TransientError { reason } => write!(f, "TRANSIENT: {}", reason),
            FetchOutcome::MalformedPayload { reason } => write!(f, "MALFORMED: {}", reason),
        }
    }
}

/// 接口返回中我们关心的部分：`{"data": {"pnl": ...}}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WalletStat {
    #[serde(deserialize_with = "deserialize_metric")]
    pub pnl: f64,
}

#[derive(Debug, Deserialize)]
struct StatEnvelope {
    data: WalletStat,
}

impl WalletStat {
    /// 从响应体解析；缺字段或类型不符返回错误描述
    pub fn from_body(body: &str) -> Result<Self, String> {
        serde_json::from_str::<StatEnvelope>(body)
            .map(|envelope| envelope.data)
            .map_err(|e| e.to_string())
    }
}

// 指标既可能是数字，也可能是数字字符串
fn deserialize_metric<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Visitor;

    struct MetricVisitor;

    impl<'de> Visitor<'de> for MetricVisitor {
        type Value = f64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a finite number or numeric string")
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value.is_finite() {
                Ok(value)
            } else {
                Err(E::custom("metric is not finite"))
            }
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value as f64)
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value as f64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| E::custom(format!("metric is not numeric: {value}")))
        }
    }

    deserializer.deserialize_any(MetricVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_stat_from_number_and_string() {
        let stat = WalletStat::from_body(r#"{"code":0,"data":{"pnl":1.23456,"winrate":0.5}}"#)
            .unwrap();
        assert_eq!(stat.pnl, 1.23456);

        let stat = WalletStat::from_body(r#"{"data":{"pnl":"0.61"}}"#).unwrap();
        assert_eq!(stat.pnl, 0.61);
    }

    #[test]
    fn test_wallet_stat_missing_fields() {
        assert!(WalletStat::from_body(r#"{"data":{}}"#).is_err());
        assert!(WalletStat::from_body(r#"{"data":null}"#).is_err());
        assert!(WalletStat::from_body(r#"{"data":{"pnl":null}}"#).is_err());
        assert!(WalletStat::from_body("<html>").is_err());
    }

    #[test]
    fn test_retryable_outcomes() {
        assert!(FetchOutcome::Forbidden.is_retryable());
        assert!(FetchOutcome::ServerError { status: 502 }.is_retryable());
        assert!(!FetchOutcome::MalformedPayload {
            reason: String::new()
        }
        .is_retryable());
        assert!(!FetchOutcome::Success(WalletStat { pnl: 1.0 }).is_retryable());
    }
}
