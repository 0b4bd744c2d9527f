//! 身份服务 - 业务能力层
//!
//! 只负责"给某个代理配一套请求身份"，不关心请求本身

use crate::models::Proxy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// 一次请求使用的身份
///
/// 固定字段之外的头和查询参数放在两张扩展表里。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBundle {
    pub user_agent: String,
    pub accept_language: String,
    /// 每次调用都重新生成
    pub trace_id: String,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
}

/// 身份提供者
pub trait IdentityProvider: Send + Sync {
    /// 同一代理的静态字段保持一致，易变字段每次重新生成
    fn identity_for(&self, proxy: &Proxy, request_index: u64) -> HeaderBundle;

    /// 收到 403 时调用，实现方可借此更换身份
    fn invalidate(&self, _proxy: &Proxy) {}
}

// ========== 指纹素材 ==========

const BROWSERS: &[(&str, &str)] = &[
    (
        "Google Chrome",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.0.0 Safari/537.36",
    ),
    (
        "Opera GX",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.0.0 Safari/537.36 OPR/{major}.0.0.0",
    ),
    (
        "Chromium",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.0.0 Safari/537.36",
    ),
];

const PLATFORMS: &[(&str, &str)] = &[
    ("Windows", "15.0.0"),
    ("macOS", "14.5.0"),
    ("Linux", "6.9"),
];

const LANGS: &[&str] = &["ru", "en", "de", "es"];

const TIME_ZONES: &[(&str, i32)] = &[
    ("Europe/Moscow", 10800),
    ("Europe/Berlin", 7200),
    ("Asia/Tokyo", 32400),
];

/// 超过该时长强制切换身份
const ROTATE_EVERY: Duration = Duration::from_secs(30 * 60);

fn pick<'a, T>(rng: &mut StdRng, items: &'a [T]) -> &'a T {
    &items[rng.random_range(0..items.len())]
}

fn hex_digest(input: &[u8]) -> String {
    Sha256::digest(input)
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn seed_for(proxy_key: &str, index: usize) -> u64 {
    let digest = Sha256::digest(format!("{proxy_key}-{index}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// 一套静态指纹
#[derive(Debug, Clone)]
struct Fingerprint {
    user_agent: String,
    accept_language: String,
    headers: BTreeMap<String, String>,
    params: BTreeMap<String, String>,
}

impl Fingerprint {
    fn generate(rng: &mut StdRng) -> Self {
        let (brand, ua_template) = *pick(rng, BROWSERS);
        let major: u32 = rng.random_range(133..=140);
        let user_agent = ua_template.replace("{major}", &major.to_string());
        let (platform, platform_version) = *pick(rng, PLATFORMS);
        let full_version = format!(
            "{}.0.{}.{}",
            major,
            rng.random_range(4000..=8000),
            rng.random_range(50..=200)
        );
        let accept_language = format!(
            "ru-RU,ru;q=0.9,{}-US;q=0.8,en;q=0.7",
            pick(rng, LANGS)
        );

        let mut headers = BTreeMap::new();
        headers.insert(
            "accept".to_string(),
            "application/json, text/plain, */*".to_string(),
        );
        headers.insert(
            "sec-ch-ua".to_string(),
            format!(
                "\"{brand}\";v=\"{major}\", \"Chromium\";v=\"{major}\", \"Not/A)Brand\";v=\"24\""
            ),
        );
        headers.insert(
            "sec-ch-ua-full-version".to_string(),
            format!("\"{full_version}\""),
        );
        headers.insert("sec-ch-ua-platform".to_string(), format!("\"{platform}\""));
        headers.insert(
            "sec-ch-ua-platform-version".to_string(),
            format!("\"{platform_version}\""),
        );
        headers.insert("sec-ch-ua-mobile".to_string(), "?0".to_string());

        let (tz_name, tz_offset) = *pick(rng, TIME_ZONES);
        let stamp = format!(
            "{}-{}-{}",
            chrono::Utc::now().format("%Y%m%d"),
            rng.random_range(50..=1500),
            &hex_digest(&rng.random::<[u8; 16]>())[..7]
        );
        let mut params = BTreeMap::new();
        params.insert(
            "device_id".to_string(),
            Uuid::from_bytes(rng.random::<[u8; 16]>()).to_string(),
        );
        params.insert("client_id".to_string(), format!("gmgn_web_{stamp}"));
        params.insert("app_ver".to_string(), stamp);
        params.insert("from_app".to_string(), "gmgn".to_string());
        params.insert("os".to_string(), "web".to_string());
        params.insert("tz_name".to_string(), tz_name.to_string());
        params.insert("tz_offset".to_string(), tz_offset.to_string());
        params.insert("app_lang".to_string(), pick(rng, LANGS).to_string());

        Self {
            user_agent,
            accept_language,
            headers,
            params,
        }
    }

    /// 附加易变字段
    fn fresh(&self) -> HeaderBundle {
        let trace_id = Uuid::new_v4().simple().to_string();
        let span_id = &Uuid::new_v4().simple().to_string()[..16];

        let mut headers = self.headers.clone();
        headers.insert("sentry-trace".to_string(), format!("{trace_id}-{span_id}-0"));
        headers.insert(
            "baggage".to_string(),
            format!(
                "sentry-environment=production,sentry-trace_id={trace_id},sentry-sample_rate=0.005,sentry-sampled=false"
            ),
        );

        let mut params = self.params.clone();
        params.insert(
            "fp_did".to_string(),
            hex_digest(Uuid::new_v4().as_bytes()),
        );

        HeaderBundle {
            user_agent: self.user_agent.clone(),
            accept_language: self.accept_language.clone(),
            trace_id,
            headers,
            params,
        }
    }
}

#[derive(Debug)]
struct IdentityRing {
    fingerprints: VecDeque<Fingerprint>,
    last_switch: Instant,
}

/// 默认身份提供者
///
/// 每个代理一组固定数量的指纹，由代理标识确定性地生成；
/// 每 `rotate_every_n` 次请求或每 30 分钟切换到下一个。
#[derive(Debug)]
pub struct FingerprintIdentityProvider {
    per_proxy: usize,
    rotate_every_n: u64,
    rings: Mutex<HashMap<String, IdentityRing>>,
}

impl FingerprintIdentityProvider {
    pub fn new(per_proxy: usize) -> Self {
        Self::with_rotation(per_proxy, rand::rng().random_range(50..80))
    }

    pub fn with_rotation(per_proxy: usize, rotate_every_n: u64) -> Self {
        Self {
            per_proxy: per_proxy.max(1),
            rotate_every_n: rotate_every_n.max(1),
            rings: Mutex::new(HashMap::new()),
        }
    }

    fn build_ring(&self, proxy: &Proxy) -> IdentityRing {
        let fingerprints = (0..self.per_proxy)
            .map(|i| Fingerprint::generate(&mut StdRng::seed_from_u64(seed_for(proxy.key(), i))))
            .collect();
        IdentityRing {
            fingerprints,
            last_switch: Instant::now(),
        }
    }

    fn with_ring<R>(&self, proxy: &Proxy, f: impl FnOnce(&mut IdentityRing) -> R) -> R {
        let mut rings = self
            .rings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let ring = rings
            .entry(proxy.key().to_string())
            .or_insert_with(|| self.build_ring(proxy));
        f(ring)
    }
}

impl IdentityProvider for FingerprintIdentityProvider {
    fn identity_for(&self, proxy: &Proxy, request_index: u64) -> HeaderBundle {
        let rotate_every_n = self.rotate_every_n;
        self.with_ring(proxy, |ring| {
            let due_by_count = request_index > 0 && request_index % rotate_every_n == 0;
            if due_by_count || ring.last_switch.elapsed() > ROTATE_EVERY {
                ring.fingerprints.rotate_left(1);
                ring.last_switch = Instant::now();
                debug!("代理 {} 切换身份 (请求序号 {})", proxy, request_index);
            }
            ring.fingerprints
                .front()
                .map(Fingerprint::fresh)
                .unwrap_or_default()
        })
    }

    fn invalidate(&self, proxy: &Proxy) {
        self.with_ring(proxy, |ring| {
            ring.fingerprints.rotate_left(1);
            ring.last_switch = Instant::now();
        });
        debug!("代理 {} 收到 403，提前切换身份", proxy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(s: &str) -> Proxy {
        Proxy::parse(s).unwrap()
    }

    #[test]
    fn test_static_fields_stable_volatile_fields_fresh() {
        let provider = FingerprintIdentityProvider::with_rotation(4, 1000);
        let p = proxy("1.2.3.4:80:u:p");

        let first = provider.identity_for(&p, 1);
        let second = provider.identity_for(&p, 2);

        assert_eq!(first.user_agent, second.user_agent);
        assert_eq!(first.params.get("device_id"), second.params.get("device_id"));
        assert_ne!(first.trace_id, second.trace_id);
        assert_ne!(first.params.get("fp_did"), second.params.get("fp_did"));
        assert!(first.headers.contains_key("sentry-trace"));
    }

    #[test]
    fn test_same_proxy_same_identity_across_providers() {
        let p = proxy("1.2.3.4:80:u:p");
        let a = FingerprintIdentityProvider::with_rotation(2, 1000).identity_for(&p, 1);
        let b = FingerprintIdentityProvider::with_rotation(2, 1000).identity_for(&p, 1);
        assert_eq!(a.user_agent, b.user_agent);
        assert_eq!(a.params.get("device_id"), b.params.get("device_id"));
    }

    #[test]
    fn test_rotation_by_request_count_and_invalidate() {
        let provider = FingerprintIdentityProvider::with_rotation(2, 3);
        let p = proxy("5.6.7.8:80:u:p");

        let id = |i| provider.identity_for(&p, i).params["device_id"].clone();
        let d1 = id(1);
        assert_eq!(id(2), d1);
        let d3 = id(3);
        assert_ne!(d3, d1);

        provider.invalidate(&p);
        assert_eq!(id(4), d1);
    }
}
