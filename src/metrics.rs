use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::route::{ProxyScheme, RouteDecision};

/// 代理运行统计
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 连接统计
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    failed_connections: AtomicU64,

    // 请求统计
    http_requests: AtomicU64,
    tunnels: AtomicU64,

    // 路由统计
    direct_routes: AtomicU64,
    http_routes: AtomicU64,
    socks5_routes: AtomicU64,

    // 错误统计
    route_errors: AtomicU64,
    dial_errors: AtomicU64,

    // 流量统计
    bytes_client_to_upstream: AtomicU64,
    bytes_upstream_to_client: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                failed_connections: AtomicU64::new(0),
                http_requests: AtomicU64::new(0),
                tunnels: AtomicU64::new(0),
                direct_routes: AtomicU64::new(0),
                http_routes: AtomicU64::new(0),
                socks5_routes: AtomicU64::new(0),
                route_errors: AtomicU64::new(0),
                dial_errors: AtomicU64::new(0),
                bytes_client_to_upstream: AtomicU64::new(0),
                bytes_upstream_to_client: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn inc_total_connections(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_connections(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_failed_connections(&self) {
        self.inner.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tunnels(&self) {
        self.inner.tunnels.fetch_add(1, Ordering::Relaxed);
    }

    /// 按路由决策分类计数
    pub fn record_route(&self, decision: &RouteDecision) {
        let counter = match decision {
            RouteDecision::Direct => &self.inner.direct_routes,
            RouteDecision::Proxy {
                scheme: ProxyScheme::Http,
                ..
            } => &self.inner.http_routes,
            RouteDecision::Proxy {
                scheme: ProxyScheme::Socks5,
                ..
            } => &self.inner.socks5_routes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_route_errors(&self) {
        self.inner.route_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dial_errors(&self) {
        self.inner.dial_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_client_to_upstream(&self, bytes: u64) {
        self.inner.bytes_client_to_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_upstream_to_client(&self, bytes: u64) {
        self.inner.bytes_upstream_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get_total_connections(&self) -> u64 {
        self.inner.total_connections.load(Ordering::Relaxed)
    }

    pub fn get_active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            failed_connections: self.inner.failed_connections.load(Ordering::Relaxed),
            http_requests: self.inner.http_requests.load(Ordering::Relaxed),
            tunnels: self.inner.tunnels.load(Ordering::Relaxed),
            direct_routes: self.inner.direct_routes.load(Ordering::Relaxed),
            http_routes: self.inner.http_routes.load(Ordering::Relaxed),
            socks5_routes: self.inner.socks5_routes.load(Ordering::Relaxed),
            route_errors: self.inner.route_errors.load(Ordering::Relaxed),
            dial_errors: self.inner.dial_errors.load(Ordering::Relaxed),
            bytes_client_to_upstream: self.inner.bytes_client_to_upstream.load(Ordering::Relaxed),
            bytes_upstream_to_client: self.inner.bytes_upstream_to_client.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    /// 打印监控指标
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 代理运行统计 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!("总连接数: {}", snapshot.total_connections);
        log::info!("活跃连接: {}", snapshot.active_connections);
        log::info!("失败连接: {}", snapshot.failed_connections);
        log::info!("HTTP 请求: {} | CONNECT 隧道: {}", snapshot.http_requests, snapshot.tunnels);
        log::info!(
            "路由 DIRECT: {} | HTTP: {} | SOCKS5: {}",
            snapshot.direct_routes,
            snapshot.http_routes,
            snapshot.socks5_routes
        );
        log::info!("路由错误: {} | 拨号错误: {}", snapshot.route_errors, snapshot.dial_errors);
        log::info!("上行流量: {} KB", snapshot.bytes_client_to_upstream / 1024);
        log::info!("下行流量: {} KB", snapshot.bytes_upstream_to_client / 1024);
    }
}

/// 监控指标快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub http_requests: u64,
    pub tunnels: u64,
    pub direct_routes: u64,
    pub http_routes: u64,
    pub socks5_routes: u64,
    pub route_errors: u64,
    pub dial_errors: u64,
    pub bytes_client_to_upstream: u64,
    pub bytes_upstream_to_client: u64,
    pub uptime: Duration,
}

/// RAII 风格的连接计数器
pub struct ConnectionGuard {
    metrics: Metrics,
}

impl ConnectionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inc_total_connections();
        metrics.inc_active_connections();
        log::debug!(
            "📊 新连接 | 总连接数: {} | 活跃连接: {}",
            metrics.get_total_connections(),
            metrics.get_active_connections()
        );
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.dec_active_connections();
        log::debug!("📊 连接关闭 | 活跃连接: {}", self.metrics.get_active_connections());
    }
}
