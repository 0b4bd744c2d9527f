pub mod proxy_pool;

pub use proxy_pool::{PoolStatus, ProxyPool};
