use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 代理池错误
    #[error("代理池错误: {0}")]
    Pool(#[from] PoolError),
    /// 队列错误
    #[error("队列错误: {0}")]
    Queue(#[from] QueueError),
    /// 快照存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 失败清单错误
    #[error("失败清单错误: {0}")]
    Ledger(#[from] LedgerError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 代理字符串格式错误
    #[error("代理格式错误 '{raw}': 需要 host:port[:user:pass]")]
    BadProxy { raw: String },
    /// 数值越界
    #[error("配置项 {name} 非法: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// 代理池错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// 池中没有任何代理，acquire 永远不会成功
    #[error("代理池为空")]
    Empty,
}

/// 队列错误
#[derive(Debug, Error)]
pub enum QueueError {
    /// 连接或命令失败
    #[error("Redis 操作失败 ({queue}): {source}")]
    Redis {
        queue: String,
        #[source]
        source: redis::RedisError,
    },
    /// 队列已关闭（内存队列的发送端全部被丢弃）
    #[error("队列 {queue} 已关闭")]
    Closed { queue: String },
    /// 消息序列化失败
    #[error("消息序列化失败: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 快照存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("数据库操作失败 ({operation}): {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// 失败清单错误
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("读取失败清单 {path} 失败: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("写入失败清单 {path} 失败: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ========== 便捷构造函数 ==========

impl QueueError {
    pub fn redis(queue: impl Into<String>, source: redis::RedisError) -> Self {
        QueueError::Redis {
            queue: queue.into(),
            source,
        }
    }
}

impl StoreError {
    pub fn database(operation: &'static str, source: sqlx::Error) -> Self {
        StoreError::Database { operation, source }
    }

    /// 是否为唯一约束冲突（SQLSTATE 23505）
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => {
                db_err.code().map(|c| c.to_string()).as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
