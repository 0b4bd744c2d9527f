//! 请求执行服务 - 业务能力层
//!
//! 只负责"通过某个代理发一次请求并给结果分类"，不做任何重试

use crate::models::{FetchOutcome, Proxy, WalletStat};
use crate::services::identity::HeaderBundle;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// 请求执行器
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// 恰好一次网络尝试
    async fn fetch(&self, target: &str, proxy: &Proxy, identity: &HeaderBundle) -> FetchOutcome;
}

/// 按状态码和响应体分类
pub fn classify(status: u16, retry_after: Option<&str>, body: &str) -> FetchOutcome {
    match status {
        200..=299 => match WalletStat::from_body(body) {
            Ok(stat) => FetchOutcome::Success(stat),
            Err(reason) => FetchOutcome::MalformedPayload { reason },
        },
        403 => FetchOutcome::Forbidden,
        429 => FetchOutcome::RateLimited {
            retry_after: retry_after.and_then(parse_retry_after),
        },
        500..=599 => FetchOutcome::ServerError { status },
        other => FetchOutcome::TransientError {
            reason: format!("unexpected HTTP {other}"),
        },
    }
}

/// 只识别秒数形式的 Retry-After；超出 `Duration` 范围的值视为无效
fn parse_retry_after(raw: &str) -> Option<Duration> {
    let secs = raw.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// 基于 reqwest 的执行器，每个代理复用一个 Client
pub struct HttpFetcher {
    url_template: String,
    timeout: Duration,
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpFetcher {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url_template: url_template.into(),
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn url_for(&self, target: &str) -> String {
        self.url_template.replace("{address}", target)
    }

    fn client_for(&self, proxy: &Proxy) -> Result<Client, reqwest::Error> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(client) = clients.get(proxy.key()) {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .proxy(reqwest::Proxy::all(proxy.url())?)
            .timeout(self.timeout)
            .build()?;
        clients.insert(proxy.key().to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, target: &str, proxy: &Proxy, identity: &HeaderBundle) -> FetchOutcome {
        let client = match self.client_for(proxy) {
            Ok(client) => client,
            Err(e) => {
                return FetchOutcome::TransientError {
                    reason: format!("client build failed: {e}"),
                }
            }
        };

        let url = self.url_for(target);
        let mut request = client
            .get(&url)
            .header("user-agent", identity.user_agent.as_str())
            .header("accept-language", identity.accept_language.as_str())
            .header("referer", format!("https://gmgn.ai/sol/address/{target}"))
            .query(&identity.params);
        for (name, value) in &identity.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return FetchOutcome::TransientError {
                    reason: transport_reason(&e),
                }
            }
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return FetchOutcome::TransientError {
                    reason: transport_reason(&e),
                }
            }
        };
        debug!("[{}] HTTP {} 响应 {} 字节", short(target), status, body.len());

        classify(status, retry_after.as_deref(), &body)
    }
}

fn transport_reason(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timeout: {e}")
    } else if e.is_connect() {
        format!("connect: {e}")
    } else {
        e.to_string()
    }
}

/// 日志中只显示地址前缀
pub fn short(target: &str) -> &str {
    match target.char_indices().nth(6) {
        Some((idx, _)) => &target[..idx],
        None => target,
    }
}
