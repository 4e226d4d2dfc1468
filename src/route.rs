use log::{info, warn};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::RouteError;
use crate::pac::PacEvaluator;

/// 下一跳代理的协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    Http,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 下一跳地址，host 与 port 均非空
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl ProxyAddr {
    /// 解析 `host:port`，IPv6 地址需带方括号
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        if host.is_empty() || host == "[]" {
            return None;
        }
        let port = port.parse::<u16>().ok()?;
        Some(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 单个请求的路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// 直连目标
    Direct,
    /// 经下一跳代理
    Proxy { scheme: ProxyScheme, addr: ProxyAddr },
}

impl RouteDecision {
    /// 上游代理 URL，直连时为 `None`
    pub fn upstream_url(&self) -> Option<String> {
        match self {
            RouteDecision::Direct => None,
            RouteDecision::Proxy { scheme, addr } => Some(format!("{}://{}", scheme, addr)),
        }
    }
}

impl fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upstream_url() {
            Some(url) => f.write_str(&url),
            None => f.write_str("DIRECT"),
        }
    }
}

/// 解析 PAC 返回的代理配置字符串
///
/// 只使用第一个条目，其余条目被忽略（会记录警告）。
pub fn parse_directive(directive: &str) -> Result<RouteDecision, RouteError> {
    let fields: Vec<&str> = directive.split_whitespace().collect();
    let kind = match fields.first() {
        Some(kind) => kind.trim_end_matches(';'),
        None => return Err(RouteError::EmptyDirective),
    };

    let scheme = match kind {
        "DIRECT" => return Ok(RouteDecision::Direct),
        "PROXY" | "HTTP" => ProxyScheme::Http,
        "SOCKS" | "SOCKS5" => ProxyScheme::Socks5,
        "SOCKS4" => return Err(RouteError::UnsupportedProxy(directive.to_string())),
        _ => return Err(RouteError::UnknownProxy(directive.to_string())),
    };

    let malformed = || RouteError::MalformedDirective {
        directive: directive.to_string(),
        kind: kind.to_string(),
    };

    let host_port = fields.get(1).ok_or_else(malformed)?;
    if fields.len() > 2 {
        warn!("PAC 返回了多个代理 {:?}，只使用第一个", directive);
    }

    let addr = ProxyAddr::parse(host_port.trim_end_matches(';')).ok_or_else(malformed)?;
    Ok(RouteDecision::Proxy { scheme, addr })
}

/// PAC 路由解析器
///
/// 求值器不可重入，所有请求通过同一把互斥锁串行求值；锁只覆盖求值调用本身，
/// 字符串解析在锁外进行。
#[derive(Clone)]
pub struct RouteResolver {
    evaluator: Arc<Mutex<Box<dyn PacEvaluator>>>,
    pac_name: Arc<str>,
}

impl RouteResolver {
    pub fn new(evaluator: Box<dyn PacEvaluator>, pac_name: impl Into<String>) -> Self {
        Self {
            evaluator: Arc::new(Mutex::new(evaluator)),
            pac_name: Arc::from(pac_name.into()),
        }
    }

    /// 为 (url, host) 计算路由
    pub async fn resolve(&self, url: &str, host: &str) -> Result<RouteDecision, RouteError> {
        let directive = self.evaluate(url, host).await.map_err(|e| {
            warn!("PAC 文件错误: {}", e);
            e
        })?;

        info!("{} -> {:?} (PAC: {})", url, directive, self.pac_name);

        parse_directive(&directive).map_err(|e| {
            warn!("PAC 文件错误: {}", e);
            e
        })
    }

    /// 在阻塞线程池上持锁执行一次求值
    async fn evaluate(&self, url: &str, host: &str) -> Result<String, RouteError> {
        let evaluator = Arc::clone(&self.evaluator);
        let (url, host) = (url.to_string(), host.to_string());

        let result = tokio::task::spawn_blocking(move || {
            let mut guard = evaluator
                .lock()
                .map_err(|_| anyhow::anyhow!("PAC 求值器在之前的调用中 panic"))?;
            guard.find_proxy(&url, &host)
        })
        .await;

        match result {
            Ok(Ok(directive)) => Ok(directive),
            Ok(Err(e)) => Err(self.evaluator_error(format!("{:#}", e))),
            Err(e) => Err(self.evaluator_error(format!("求值任务失败: {}", e))),
        }
    }

    fn evaluator_error(&self, message: String) -> RouteError {
        RouteError::Evaluator {
            pac: self.pac_name.to_string(),
            message,
        }
    }
}
