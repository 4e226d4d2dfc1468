use bytes::Bytes;
use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::dialer::{BoxedStream, Dialer};
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::relay::{proxy_data, RelayStats};
use crate::request::RequestHead;
use crate::route::{ProxyScheme, RouteDecision, RouteResolver};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// CONNECT 隧道的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Resolving,
    Dialing,
    /// 仅经下一跳代理时出现
    Handshaking,
    Hijacked,
    Relaying,
    Closed,
}

impl TunnelState {
    /// 状态只能前进；任何状态都可以直接进入 `Closed`，`Closed` 之后不再变化
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Resolving, Dialing)
                | (Dialing, Handshaking)
                | (Dialing, Hijacked)
                | (Handshaking, Hijacked)
                | (Hijacked, Relaying)
                | (Resolving | Dialing | Handshaking | Hijacked | Relaying, Closed)
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 单条隧道的状态跟踪
struct Tunnel<'a> {
    target: &'a str,
    state: TunnelState,
}

impl<'a> Tunnel<'a> {
    fn new(target: &'a str) -> Self {
        Self {
            target,
            state: TunnelState::Resolving,
        }
    }

    fn advance(&mut self, next: TunnelState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid tunnel transition {} -> {}",
            self.state,
            next
        );
        debug!("隧道 {}: {} -> {}", self.target, self.state, next);
        self.state = next;
    }
}

/// 处理 CONNECT 请求：路由、拨号、（可选）与下一跳握手、接管客户端连接并中继
#[derive(Clone)]
pub struct TunnelEstablisher {
    resolver: RouteResolver,
    dialer: Dialer,
    metrics: Metrics,
    idle_timeout: Option<Duration>,
}

impl TunnelEstablisher {
    pub fn new(resolver: RouteResolver, dialer: Dialer, metrics: Metrics) -> Self {
        Self {
            resolver,
            dialer,
            metrics,
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// 建立并运行一条隧道，直到任一端关闭
    ///
    /// `client` 是已经读走 CONNECT 请求头的原始连接，`buffered` 是请求头之后已读入但尚未消费的字节。
    /// 失败时已向客户端写出对应的状态行。
    pub async fn establish<C>(
        &self,
        mut client: C,
        head: RequestHead,
        buffered: Bytes,
        cancel: &CancellationToken,
    ) -> Result<RelayStats, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.metrics.inc_tunnels();
        let mut tunnel = Tunnel::new(&head.target);

        let result = self.open_upstream(&mut tunnel, &mut client, &head, cancel).await;
        let mut upstream = match result {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("CONNECT {} 失败: {}", head.target, e);
                let _ = write_status(&mut client, &e).await;
                tunnel.advance(TunnelState::Closed);
                return Err(e);
            }
        };

        if !buffered.is_empty() {
            debug!("隧道 {}: 转发 {} 字节预读数据", head.target, buffered.len());
            if let Err(e) = upstream.write_all(&buffered).await {
                debug!("隧道 {}: 转发预读数据失败: {}", head.target, e);
                tunnel.advance(TunnelState::Closed);
                return Ok(RelayStats::default());
            }
            self.metrics.add_bytes_client_to_upstream(buffered.len() as u64);
        }

        tunnel.advance(TunnelState::Relaying);
        let mut stats = proxy_data(client, upstream, self.metrics.clone(), self.idle_timeout).await;
        stats.client_to_upstream += buffered.len() as u64;
        tunnel.advance(TunnelState::Closed);

        debug!(
            "隧道 {} 结束: 上行 {} 字节, 下行 {} 字节",
            head.target, stats.client_to_upstream, stats.upstream_to_client
        );
        Ok(stats)
    }

    /// Resolving -> Dialing -> [Handshaking] -> Hijacked
    async fn open_upstream<C>(
        &self,
        tunnel: &mut Tunnel<'_>,
        client: &mut C,
        head: &RequestHead,
        cancel: &CancellationToken,
    ) -> Result<BoxedStream, ProxyError>
    where
        C: AsyncWrite + Unpin,
    {
        let (host, port) = head.connect_target()?;
        let pac_host = host.trim_start_matches('[').trim_end_matches(']');
        let url = connect_url(&host, port);

        let decision = self.resolver.resolve(&url, pac_host).await.map_err(|e| {
            self.metrics.inc_route_errors();
            ProxyError::from(e)
        })?;
        self.metrics.record_route(&decision);
        tunnel.advance(TunnelState::Dialing);

        let upstream = match &decision {
            RouteDecision::Direct => {
                let upstream = self.dial(self.dialer.dial(&head.target, cancel)).await?;
                tunnel.advance(TunnelState::Hijacked);
                write_established(client).await?;
                upstream
            }
            RouteDecision::Proxy {
                scheme: ProxyScheme::Http,
                addr,
            } => {
                let mut upstream = self.dial(self.dialer.dial(&addr.to_string(), cancel)).await?;
                tunnel.advance(TunnelState::Handshaking);
                // 原样转发 CONNECT 请求头，由下一跳代理自己回复客户端
                upstream.write_all(&head.raw).await.map_err(|e| {
                    ProxyError::UpstreamProtocol(format!("向 {} 转发 CONNECT 失败: {}", addr, e))
                })?;
                tunnel.advance(TunnelState::Hijacked);
                upstream
            }
            RouteDecision::Proxy {
                scheme: ProxyScheme::Socks5,
                addr,
            } => {
                // 拨号与握手共用同一个超时，在 dial_socks5 内部完成
                tunnel.advance(TunnelState::Handshaking);
                let upstream = self
                    .dial(self.dialer.dial_socks5(addr, &host, port, cancel))
                    .await?;
                tunnel.advance(TunnelState::Hijacked);
                write_established(client).await?;
                upstream
            }
        };

        info!("CONNECT {} 经 {} 建立", head.target, decision);
        Ok(upstream)
    }

    async fn dial<F>(&self, fut: F) -> Result<BoxedStream, ProxyError>
    where
        F: std::future::Future<Output = Result<BoxedStream, ProxyError>>,
    {
        fut.await.map_err(|e| {
            self.metrics.inc_dial_errors();
            e
        })
    }
}

/// CONNECT 目标交给 PAC 时使用的 URL，443 端口省略
pub fn connect_url(host: &str, port: u16) -> String {
    if port == 443 {
        format!("https://{}/", host)
    } else {
        format!("https://{}:{}/", host, port)
    }
}

async fn write_established<C: AsyncWrite + Unpin>(client: &mut C) -> Result<(), ProxyError> {
    client
        .write_all(CONNECT_ESTABLISHED)
        .await
        .map_err(|e| ProxyError::BadRequest(format!("向客户端写入 CONNECT 响应失败: {}", e)))
}

/// 向客户端写出错误状态行，之后连接即关闭
pub async fn write_status<C: AsyncWrite + Unpin>(client: &mut C, err: &ProxyError) -> std::io::Result<()> {
    let status = err.status_code();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    client.write_all(response.as_bytes()).await?;
    client.flush().await
}
