use futures::future::BoxFuture;
use log::debug;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::dns::resolve_addrs;
use crate::error::ProxyError;
use crate::route::ProxyAddr;
use crate::socks5::connect_via_socks5;

/// 出站连接：对中继阶段而言只是一个双向字节流
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// 可注入的拨号函数，参数为 `host:port`
pub type DialFn = Arc<dyn Fn(String) -> BoxFuture<'static, io::Result<BoxedStream>> + Send + Sync>;

/// 出站拨号器
///
/// 优先使用注入的拨号函数，否则走系统 TCP 拨号；两条路径都受取消令牌和连接超时约束。
#[derive(Clone, Default)]
pub struct Dialer {
    dial_fn: Option<DialFn>,
    connect_timeout: Option<Duration>,
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("custom_dial_fn", &self.dial_fn.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注入自定义拨号函数
    pub fn with_dial_fn(mut self, dial_fn: DialFn) -> Self {
        self.dial_fn = Some(dial_fn);
        self
    }

    /// 设置拨号（含 SOCKS5 握手）超时，`None` 表示不限时
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// 连接到 `addr`（`host:port`）
    pub async fn dial(&self, addr: &str, cancel: &CancellationToken) -> Result<BoxedStream, ProxyError> {
        self.bounded(addr, cancel, self.dial_inner(addr)).await
    }

    /// 先连接 SOCKS5 代理 `hop`，再通过它 CONNECT 到 `target_host:target_port`
    pub async fn dial_socks5(
        &self,
        hop: &ProxyAddr,
        target_host: &str,
        target_port: u16,
        cancel: &CancellationToken,
    ) -> Result<BoxedStream, ProxyError> {
        let hop_addr = hop.to_string();
        let handshake = async {
            let mut stream = self.dial_inner(&hop_addr).await?;
            connect_via_socks5(&mut stream, target_host, target_port).await?;
            Ok::<BoxedStream, ProxyError>(stream)
        };
        self.bounded(&hop_addr, cancel, handshake).await
    }

    async fn dial_inner(&self, addr: &str) -> Result<BoxedStream, ProxyError> {
        match &self.dial_fn {
            Some(dial_fn) => {
                debug!("使用自定义拨号函数连接 {}", addr);
                dial_fn(addr.to_string())
                    .await
                    .map_err(|e| ProxyError::dial(addr, e))
            }
            None => {
                let stream = dial_tcp(addr).await.map_err(|e| ProxyError::dial(addr, e))?;
                Ok(Box::new(stream) as BoxedStream)
            }
        }
    }

    /// 统一施加取消和超时
    async fn bounded<F>(&self, addr: &str, cancel: &CancellationToken, fut: F) -> Result<BoxedStream, ProxyError>
    where
        F: std::future::Future<Output = Result<BoxedStream, ProxyError>>,
    {
        let bounded = async {
            match self.connect_timeout {
                Some(limit) => match timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ProxyError::dial(
                        addr,
                        io::Error::new(io::ErrorKind::TimedOut, format!("连接超时 ({:?})", limit)),
                    )),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProxyError::dial(
                addr,
                io::Error::new(io::ErrorKind::Interrupted, "拨号已取消"),
            )),
            result = bounded => result,
        }
    }
}

/// 系统 TCP 拨号，依次尝试解析出的每个地址
async fn dial_tcp(addr: &str) -> io::Result<TcpStream> {
    let target = ProxyAddr::parse(addr).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("无效的地址: {}", addr))
    })?;

    let mut last_err = None;
    for socket_addr in resolve_addrs(&target.host, target.port).await? {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                debug!("已连接到 {} ({})", addr, socket_addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("连接 {} ({}) 失败: {}", addr, socket_addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("没有可用地址: {}", addr))))
}
