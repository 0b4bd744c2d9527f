use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// 程序配置
///
/// 加载顺序：默认值 → `CONFIG_FILE` 指向的 TOML 文件 → 环境变量。
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 同时运行的 worker 上限
    pub max_workers: usize,
    /// 每个目标的最大尝试次数
    pub max_retries: usize,
    /// 单次请求超时（秒）
    pub request_timeout_sec: u64,
    /// 代理释放后的冷却时间（秒）
    pub cool_down_sec: u64,
    /// 连续错误达到该值即轮换代理
    pub error_threshold: usize,
    /// 代理最长连续使用时间（秒）
    pub max_proxy_lifetime_sec: u64,
    /// 目标之间的平均停顿（秒）
    pub avg_delay_sec: f64,
    /// 偶发长停顿的概率
    pub pause_outlier_prob: f64,
    /// 重试之间的固定退避（毫秒）
    pub retry_backoff_ms: u64,
    /// 429 响应中 Retry-After 提示的上限（秒）
    pub max_retry_after_sec: u64,
    /// 指标高于该值才落库（不含等于）
    pub metric_threshold: f64,
    /// 每个代理准备的身份数量
    pub identities_per_proxy: usize,
    /// 每处理多少个目标打印一次进度
    pub progress_every: usize,

    // --- 队列 ---
    pub redis_url: String,
    pub redis_queue: String,
    pub queue_pop_timeout_sec: u64,
    /// 消费循环崩溃后的重启间隔（秒）
    pub restart_delay_sec: u64,

    // --- 存储 ---
    /// 为空时使用内存存储
    pub database_url: Option<String>,
    pub fail_wallets_file: String,

    // --- 代理 / 接口 ---
    pub proxies_file: String,
    /// 逗号分隔，优先于 proxies_file
    pub proxy_list: Option<String>,
    /// `{address}` 会被替换为目标地址
    pub api_url_template: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 20,
            max_retries: 20,
            request_timeout_sec: 30,
            cool_down_sec: 7200,
            error_threshold: 10,
            max_proxy_lifetime_sec: 3600,
            avg_delay_sec: 3.0,
            pause_outlier_prob: 0.02,
            retry_backoff_ms: 1500,
            max_retry_after_sec: 60,
            metric_threshold: 0.6,
            identities_per_proxy: 4,
            progress_every: 100,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            redis_queue: "wallet_queue".to_string(),
            queue_pop_timeout_sec: 5,
            restart_delay_sec: 5,
            database_url: None,
            fail_wallets_file: "fail_wallets.txt".to_string(),
            proxies_file: "proxies.txt".to_string(),
            proxy_list: None,
            api_url_template: "https://gmgn.ai/api/v1/wallet_stat/sol/{address}/7d".to_string(),
        }
    }
}

impl Config {
    /// 按 默认值 → TOML → 环境变量 的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("CONFIG_FILE") {
            Ok(path) if !path.trim().is_empty() => Self::from_toml_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        let config = base.with_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件读取，缺省字段取默认值
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
            path: path.display().to_string(),
            source,
        })
    }

    /// 用环境变量覆盖配置项
    ///
    /// `lookup` 便于测试时注入变量表，生产环境传 `std::env::var`。
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "MAX_WORKERS", &mut self.max_workers)?;
        override_parsed(&lookup, "MAX_RETRIES", &mut self.max_retries)?;
        override_parsed(&lookup, "REQUEST_TIMEOUT_SEC", &mut self.request_timeout_sec)?;
        override_parsed(&lookup, "COOL_DOWN_SEC", &mut self.cool_down_sec)?;
        override_parsed(&lookup, "ERROR_THRESHOLD", &mut self.error_threshold)?;
        override_parsed(&lookup, "MAX_PROXY_LIFETIME_SEC", &mut self.max_proxy_lifetime_sec)?;
        override_parsed(&lookup, "AVG_DELAY_SEC", &mut self.avg_delay_sec)?;
        override_parsed(&lookup, "PAUSE_OUTLIER_PROB", &mut self.pause_outlier_prob)?;
        override_parsed(&lookup, "RETRY_BACKOFF_MS", &mut self.retry_backoff_ms)?;
        override_parsed(&lookup, "MAX_RETRY_AFTER_SEC", &mut self.max_retry_after_sec)?;
        override_parsed(&lookup, "METRIC_THRESHOLD", &mut self.metric_threshold)?;
        override_parsed(&lookup, "IDENTITIES_PER_PROXY", &mut self.identities_per_proxy)?;
        override_parsed(&lookup, "PROGRESS_EVERY", &mut self.progress_every)?;
        override_parsed(&lookup, "QUEUE_POP_TIMEOUT_SEC", &mut self.queue_pop_timeout_sec)?;
        override_parsed(&lookup, "RESTART_DELAY_SEC", &mut self.restart_delay_sec)?;

        if let Some(v) = lookup("REDIS_URL") {
            self.redis_url = v;
        }
        if let Some(v) = lookup("REDIS_QUEUE") {
            self.redis_queue = v;
        }
        if let Some(v) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database_url = Some(v);
        }
        if let Some(v) = lookup("FAIL_WALLETS_FILE") {
            self.fail_wallets_file = v;
        }
        if let Some(v) = lookup("PROXIES_FILE") {
            self.proxies_file = v;
        }
        if let Some(v) = lookup("PROXY_LIST").filter(|v| !v.trim().is_empty()) {
            self.proxy_list = Some(v);
        }
        if let Some(v) = lookup("API_URL_TEMPLATE") {
            self.api_url_template = v;
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(invalid("max_workers", "必须大于 0"));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries", "必须大于 0"));
        }
        if self.error_threshold == 0 {
            return Err(invalid("error_threshold", "必须大于 0"));
        }
        if self.request_timeout_sec == 0 {
            return Err(invalid("request_timeout_sec", "必须大于 0"));
        }
        if !(self.avg_delay_sec >= 0.0 && self.avg_delay_sec.is_finite()) {
            return Err(invalid("avg_delay_sec", "必须是非负数"));
        }
        if !(0.0..=1.0).contains(&self.pause_outlier_prob) {
            return Err(invalid("pause_outlier_prob", "必须在 [0, 1] 之间"));
        }
        if !self.metric_threshold.is_finite() {
            return Err(invalid("metric_threshold", "必须是有限数值"));
        }
        if self.queue_pop_timeout_sec == 0 {
            return Err(invalid("queue_pop_timeout_sec", "必须大于 0，否则 BLPOP 会永久阻塞"));
        }
        if self.identities_per_proxy == 0 {
            return Err(invalid("identities_per_proxy", "必须大于 0"));
        }
        if !self.api_url_template.contains("{address}") {
            return Err(invalid("api_url_template", "缺少 {address} 占位符"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_sec)
    }

    pub fn max_proxy_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_proxy_lifetime_sec)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_sec)
    }

    pub fn queue_pop_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_pop_timeout_sec)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_sec)
    }
}

fn override_parsed<T, F>(lookup: &F, var_name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(var_name) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value: value.clone(),
                expected_type: std::any::type_name::<T>().to_string(),
            })?;
    }
    Ok(())
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_overrides_known_options() {
        let config = Config::default()
            .with_env_overrides(lookup_from(&[
                ("MAX_WORKERS", "7"),
                ("COOL_DOWN_SEC", "600"),
                ("AVG_DELAY_SEC", "1.5"),
                ("METRIC_THRESHOLD", "0.75"),
                ("DATABASE_URL", ""),
            ]))
            .unwrap();

        assert_eq!(config.max_workers, 7);
        assert_eq!(config.cool_down(), Duration::from_secs(600));
        assert_eq!(config.avg_delay_sec, 1.5);
        assert_eq!(config.metric_threshold, 0.75);
        // 空字符串不覆盖
        assert!(config.database_url.is_none());
        // 未设置的保持默认
        assert_eq!(config.max_retries, 20);
    }

    #[test]
    fn test_env_override_parse_error() {
        let err = Config::default()
            .with_env_overrides(lookup_from(&[("MAX_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::EnvVarParseFailed { ref var_name, .. } if var_name == "MAX_RETRIES"
        ));
    }

    #[test]
    fn test_toml_partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            max_workers = 3
            redis_queue = "other_queue"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.max_workers, 3);
        assert_eq!(parsed.redis_queue, "other_queue");
        assert_eq!(parsed.error_threshold, 10);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = Config {
            max_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nan_threshold_and_zero_pop_timeout() {
        let config = Config::default()
            .with_env_overrides(lookup_from(&[("METRIC_THRESHOLD", "NaN")]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "metric_threshold", .. })
        ));

        let config = Config::default()
            .with_env_overrides(lookup_from(&[("QUEUE_POP_TIMEOUT_SEC", "0")]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "queue_pop_timeout_sec", .. })
        ));

        let config = Config::default()
            .with_env_overrides(lookup_from(&[("MAX_RETRY_AFTER_SEC", "30")]))
            .unwrap();
        assert_eq!(config.max_retry_after(), Duration::from_secs(30));
    }
}
