use crate::error::ConfigError;
use std::fmt;

/// 出站代理
///
/// 从 `host:port:user:pass`（密码中可以再含 `:`）或 `host:port` 解析，
/// 可带 `scheme://` 前缀，默认 `http`。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    key: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Proxy {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let key = raw.trim();
        let bad = || ConfigError::BadProxy {
            raw: raw.to_string(),
        };

        let (scheme, rest) = match key.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => (scheme.to_string(), rest),
            Some(_) => return Err(bad()),
            None => ("http".to_string(), key),
        };

        let mut parts = rest.splitn(4, ':');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(bad)?;
        let port: u16 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(bad)?;
        let (username, password) = match (parts.next(), parts.next()) {
            (None, _) => (None, None),
            (Some(user), Some(pass)) if !user.is_empty() => {
                (Some(user.to_string()), Some(pass.to_string()))
            }
            _ => return Err(bad()),
        };

        Ok(Self {
            key: key.to_string(),
            scheme,
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    /// 解析一组代理字符串，忽略空行和 `#` 注释
    pub fn parse_list<'a, I>(lines: I) -> Result<Vec<Self>, ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        lines
            .into_iter()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(Self::parse)
            .collect()
    }

    /// 池内唯一标识（原始字符串）
    pub fn key(&self) -> &str {
        &self.key
    }

    /// reqwest 可直接使用的代理 URL
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.scheme, user, pass, self.host, self.port
            ),
            _ => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

/// 日志用，密码打码
impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}:{}:{}:***", self.host, self.port, user),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}
