use lazy_static::lazy_static;
use log::{debug, info};
use lru::LruCache;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// 缓存条目的有效期
const DNS_CACHE_TTL: Duration = Duration::from_secs(60);

lazy_static! {
    static ref DNS_CACHE: Mutex<LruCache<String, (Vec<IpAddr>, Instant)>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(1000).unwrap_or(NonZeroUsize::MIN)));
}

/// 解析 `host` 并拼上端口，IP 字面量不经过 DNS
///
/// host 可以带 IPv6 方括号。
pub async fn resolve_addrs(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let ips = resolve_host_cached(bare).await?;
    Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
}

/// 带缓存的 DNS 解析
pub async fn resolve_host_cached(host: &str) -> io::Result<Vec<IpAddr>> {
    let key = host.to_lowercase();

    {
        let mut cache = DNS_CACHE.lock().await;
        if let Some((ips, resolved_at)) = cache.get(&key) {
            if resolved_at.elapsed() < DNS_CACHE_TTL {
                debug!("DNS 缓存命中: {} -> {:?}", host, ips);
                return Ok(ips.clone());
            }
        }
    }

    debug!("DNS 查询: {}", host);
    let ips: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await?
        .map(|addr| addr.ip())
        .collect();

    if ips.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("DNS 查询返回空列表: {}", host),
        ));
    }

    {
        let mut cache = DNS_CACHE.lock().await;
        cache.put(key, (ips.clone(), Instant::now()));
        debug!("DNS 缓存写入: {} -> {:?}", host, ips);
    }

    Ok(ips)
}

/// 清除 DNS 缓存
pub async fn clear_dns_cache() {
    let mut cache = DNS_CACHE.lock().await;
    cache.clear();
    info!("DNS 缓存已清除");
}
