use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// 一批待处理的目标地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// 来源标记
    pub src: String,
    /// 关联 token
    pub token: String,
    /// 目标地址
    pub wallets: Vec<String>,
}

/// 队列消息解析失败
#[derive(Debug, thiserror::Error)]
pub enum BatchParseError {
    #[error("消息不是合法 JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("消息结构不符合预期: {0}")]
    Shape(String),
}

impl Batch {
    pub fn new(src: impl Into<String>, token: impl Into<String>, wallets: Vec<String>) -> Self {
        Self {
            src: src.into(),
            token: token.into(),
            wallets,
        }
    }

    /// 解析队列消息
    ///
    /// 支持 `{"src", "token", "wallets"}` 对象，也兼容旧格式的纯字符串数组
    /// （此时 src 与 token 都记为 `legacy`）。缺失的 src/token 记为 `unknown`。
    pub fn from_message(raw: &str) -> Result<Self, BatchParseError> {
        let value: JsonValue = serde_json::from_str(raw)?;

        match value {
            JsonValue::Object(map) => {
                let wallets = match map.get("wallets") {
                    Some(JsonValue::Array(items)) => string_items(items)?,
                    Some(other) => {
                        return Err(BatchParseError::Shape(format!(
                            "wallets 应为数组，实际为 {}",
                            other
                        )))
                    }
                    None => Vec::new(),
                };
                let field = |name: &str| {
                    map.get(name)
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string()
                };
                Ok(Self::new(field("src"), field("token"), wallets))
            }
            JsonValue::Array(items) => Ok(Self::new("legacy", "legacy", string_items(&items)?)),
            other => Err(BatchParseError::Shape(format!("不支持的消息类型: {}", other))),
        }
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    /// 按轮询方式切分为 n 份：第 i 份为 `wallets[i::n]`
    pub fn partition(&self, n: usize) -> Vec<Vec<String>> {
        if n == 0 {
            return Vec::new();
        }
        let mut chunks = vec![Vec::with_capacity(self.wallets.len() / n + 1); n];
        for (idx, wallet) in self.wallets.iter().enumerate() {
            chunks[idx % n].push(wallet.clone());
        }
        chunks
    }
}

fn string_items(items: &[JsonValue]) -> Result<Vec<String>, BatchParseError> {
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| BatchParseError::Shape(format!("地址应为字符串: {}", item)))
        })
        .filter(|res| !matches!(res, Ok(s) if s.is_empty()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_message() {
        let batch =
            Batch::from_message(r#"{"src":"PumpSwap","token":"T1","wallets":["a","b"]}"#).unwrap();
        assert_eq!(batch.src, "PumpSwap");
        assert_eq!(batch.token, "T1");
        assert_eq!(batch.wallets, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_legacy_array() {
        let batch = Batch::from_message(r#"["a","b","c"]"#).unwrap();
        assert_eq!(batch.src, "legacy");
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(Batch::from_message("not json").is_err());
        assert!(Batch::from_message(r#"{"wallets":"a"}"#).is_err());
        assert!(Batch::from_message(r#"[1,2]"#).is_err());
        assert!(Batch::from_message("42").is_err());
    }

    #[test]
    fn test_partition_round_robin_covers_every_target_once() {
        let wallets: Vec<String> = (0..10).map(|i| format!("w{i}")).collect();
        let batch = Batch::new("s", "t", wallets.clone());
        let chunks = batch.partition(3);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], vec!["w0", "w3", "w6", "w9"]);
        assert_eq!(chunks[1], vec!["w1", "w4", "w7"]);

        let mut all: Vec<String> = chunks.into_iter().flatten().collect();
        all.sort();
        let mut expected = wallets;
        expected.sort();
        assert_eq!(all, expected);
    }
}
