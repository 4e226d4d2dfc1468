use anyhow::{Context, Result};
use bytes::BytesMut;
use futures::FutureExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::dialer::Dialer;
use crate::forward::HttpForwarder;
use crate::metrics::{ConnectionGuard, Metrics};
use crate::pac::{PacDocument, PacEvaluator};
use crate::request::{read_request_head, PrefixedStream};
use crate::route::RouteResolver;
use crate::tunnel::{write_status, TunnelEstablisher};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LISTEN_BACKLOG: i32 = 4096;
const SHUTDOWN_GRACE_SECS: u64 = 30;

/// 根据 CPU 核心数估算的最大并发连接数，每核心 500，上限 10000
pub fn default_max_connections() -> usize {
    std::cmp::min(10000, num_cpus::get() * 500)
}

/// PAC 路由本地代理
pub struct PacProxy {
    listen_addr: SocketAddr,
    pac: Arc<PacDocument>,
    resolver: RouteResolver,
    dialer: Dialer,
    max_connections: usize,
    idle_timeout: Option<Duration>,
    request_timeout: Duration,
    metrics: Metrics,
    cancel: CancellationToken,
}

/// 每个连接任务共享的处理器
#[derive(Clone)]
struct ConnectionContext {
    tunnel: TunnelEstablisher,
    forwarder: HttpForwarder,
    metrics: Metrics,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl PacProxy {
    pub fn new(listen_addr: SocketAddr, pac: PacDocument, evaluator: Box<dyn PacEvaluator>) -> Self {
        let resolver = RouteResolver::new(evaluator, pac.name());
        Self {
            listen_addr,
            pac: Arc::new(pac),
            resolver,
            dialer: Dialer::new().with_connect_timeout(Some(DEFAULT_CONNECT_TIMEOUT)),
            max_connections: default_max_connections(),
            idle_timeout: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            metrics: Metrics::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// 替换出站拨号器（连接超时、自定义拨号函数都在拨号器上配置）
    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = dialer;
        self
    }

    /// 设置最大并发连接数
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// 设置隧道空闲超时，`None` 表示不限时
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// 设置读取请求头的超时
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// 启动代理服务器
    pub async fn run(&self) -> Result<()> {
        self.run_with_shutdown(None).await
    }

    /// 启动代理服务器（支持优雅关闭）
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<watch::Receiver<bool>>) -> Result<()> {
        let listener = bind_listener(self.listen_addr)?;
        info!("✅ TCP backlog 设置为 {}", LISTEN_BACKLOG);
        self.serve(listener, shutdown_rx).await
    }

    /// 在已绑定的监听器上接受连接，直到收到关闭信号
    pub async fn serve(&self, listener: TcpListener, mut shutdown_rx: Option<watch::Receiver<bool>>) -> Result<()> {
        let local_addr = listener.local_addr().context("无法获取监听地址")?;
        info!("PAC 代理启动在 {}", local_addr);
        info!("PAC 文件: {}", self.pac.name());
        info!("最大并发连接数: {}", self.max_connections);
        match self.idle_timeout {
            Some(idle) => info!("隧道空闲超时: {:?}", idle),
            None => info!("隧道空闲超时: 无"),
        }

        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let ctx = self.connection_context();

        // 每分钟打印监控指标
        let metrics_clone = self.metrics.clone();
        let summary_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                metrics_clone.print_summary();
            }
        });

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("🛑 收到关闭信号，停止接受新连接");
                    break;
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((client_stream, client_addr)) => {
                        handle_new_connection(client_stream, client_addr, &semaphore, &ctx, Instant::now()).await;
                    }
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        drop(listener);
        self.cancel.cancel();
        self.drain().await;
        summary_task.abort();

        info!("📊 最终统计:");
        self.metrics.print_summary();
        Ok(())
    }

    fn connection_context(&self) -> ConnectionContext {
        let tunnel = TunnelEstablisher::new(self.resolver.clone(), self.dialer.clone(), self.metrics.clone())
            .with_idle_timeout(self.idle_timeout);
        let forwarder = HttpForwarder::new(
            self.resolver.clone(),
            self.dialer.clone(),
            Arc::clone(&self.pac),
            self.metrics.clone(),
        )
        .with_cancel(self.cancel.clone());

        ConnectionContext {
            tunnel,
            forwarder,
            metrics: self.metrics.clone(),
            request_timeout: self.request_timeout,
            cancel: self.cancel.clone(),
        }
    }

    /// 等待活跃连接结束（最多 30 秒）
    async fn drain(&self) {
        let wait_start = Instant::now();
        for _ in 0..SHUTDOWN_GRACE_SECS * 10 {
            let active = self.metrics.get_active_connections();
            if active == 0 {
                info!("✅ 所有连接已关闭");
                break;
            }
            debug!("⏳ 等待 {} 个活跃连接关闭...", active);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let final_active = self.metrics.get_active_connections();
        if final_active > 0 {
            warn!("⚠️  超时：仍有 {} 个连接未关闭，强制退出", final_active);
        }
        info!("⏱️  关闭耗时: {:?}", wait_start.elapsed());
    }
}

/// 用 socket2 创建监听器以设置 backlog
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("创建监听 socket 失败")?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("无法绑定 {}", addr))?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// 关闭信号为 true 时返回；没有信号源或发送端已关闭时永不返回
async fn wait_for_shutdown(shutdown_rx: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown_rx {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    futures::future::pending::<()>().await
}

async fn handle_new_connection(
    client_stream: TcpStream,
    client_addr: SocketAddr,
    semaphore: &Arc<Semaphore>,
    ctx: &ConnectionContext,
    accept_start: Instant,
) {
    let permit = match semaphore.clone().acquire_owned().await {
        Ok(p) => p,
        Err(e) => {
            error!("获取连接许可失败: {}", e);
            return;
        }
    };

    let waited = accept_start.elapsed();
    if waited.as_millis() > 10 {
        debug!("⏱️  等待许可: {}ms", waited.as_millis());
    }
    debug!("接受来自 {} 的新连接", client_addr);

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let _permit = permit;
        let metrics = ctx.metrics.clone();

        let result = std::panic::AssertUnwindSafe(handle_connection(client_stream, client_addr, ctx))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("处理来自 {} 的连接时出错: {:#}", client_addr, e);
                metrics.inc_failed_connections();
            }
            Err(panic_err) => {
                error!("❌ 连接处理任务 panic: {:?}", panic_err);
                metrics.inc_failed_connections();
            }
        }
    });
}

/// 读取请求头后按方法分派：CONNECT 走隧道，其余交给 HTTP 转发
async fn handle_connection(mut client_stream: TcpStream, client_addr: SocketAddr, ctx: ConnectionContext) -> Result<()> {
    let _guard = ConnectionGuard::new(ctx.metrics.clone());
    let _ = client_stream.set_nodelay(true);

    let (head, buffered) = match timeout(ctx.request_timeout, read_request_head(&mut client_stream)).await {
        Err(_) => {
            debug!("{} 在 {:?} 内未发送完整请求头", client_addr, ctx.request_timeout);
            return Ok(());
        }
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(read))) => read,
        Ok(Err(e)) => {
            let _ = write_status(&mut client_stream, &e).await;
            return Err(e.into());
        }
    };

    debug!("{} {} {} (来自 {})", head.method, head.target, head.version, client_addr);

    if head.is_connect() {
        ctx.tunnel
            .establish(client_stream, head, buffered, &ctx.cancel)
            .await?;
        return Ok(());
    }

    // 把已读走的请求头和多读的字节交还给 HTTP 分帧层
    let mut prefix = BytesMut::with_capacity(head.raw.len() + buffered.len());
    prefix.extend_from_slice(&head.raw);
    prefix.extend_from_slice(&buffered);
    let io = TokioIo::new(PrefixedStream::new(prefix.freeze(), client_stream));

    let forwarder = ctx.forwarder.clone();
    let service = service_fn(move |req| {
        let forwarder = forwarder.clone();
        async move { forwarder.serve(req).await }
    });

    http1::Builder::new()
        .keep_alive(false)
        .serve_connection(io, service)
        .await
        .with_context(|| format!("处理来自 {} 的 HTTP 请求失败", client_addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

    const PAC_SOURCE: &[u8] = b"function FindProxyForURL(url, host) {\n  return \"DIRECT\";\n}";

    fn fixed(directive: String) -> Box<dyn PacEvaluator> {
        Box::new(move |_: &str, _: &str| Ok::<_, anyhow::Error>(directive.clone()))
    }

    fn proxy(directive: impl Into<String>) -> PacProxy {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        PacProxy::new(addr, PacDocument::from_bytes(PAC_SOURCE), fixed(directive.into()))
    }

    async fn start(proxy: PacProxy) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = proxy.serve(listener, None).await;
        });
        addr
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn connect(proxy_addr: SocketAddr, target: &str) -> (TcpStream, String) {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let head = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
        client.write_all(head.as_bytes()).await.unwrap();
        let reply = read_head(&mut client).await;
        (client, reply)
    }

    #[tokio::test]
    async fn test_connect_direct_relays_large_payload() {
        let echo = echo_server().await;
        let proxy_addr = start(proxy("DIRECT")).await;

        let (client, reply) = connect(proxy_addr, &echo.to_string()).await;
        assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();
        let (mut reader, mut writer) = client.into_split();
        let write = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer
        });

        let mut received = vec![0u8; expected.len()];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        drop(write.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_bytes_sent_with_head_are_not_lost() {
        let echo = echo_server().await;
        let proxy_addr = start(proxy("DIRECT")).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!("CONNECT {} HTTP/1.1\r\n\r\nclient-hello", echo);
        client.write_all(request.as_bytes()).await.unwrap();

        let reply = read_head(&mut client).await;
        assert!(reply.starts_with("HTTP/1.1 200"));
        let mut echoed = [0u8; 12];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"client-hello");
    }

    #[tokio::test]
    async fn test_connect_via_http_hop_relays_hop_reply() {
        let hop = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hop_addr = hop.local_addr().unwrap();
        let hop_task = tokio::spawn(async move {
            let (mut stream, _) = hop.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\nX-Hop: stub\r\n\r\n")
                .await
                .unwrap();
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
            head
        });

        let proxy_addr = start(proxy(format!("PROXY {}", hop_addr))).await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = "CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\nUser-Agent: curl/8\r\n\r\n";
        client.write_all(request.as_bytes()).await.unwrap();

        let reply = read_head(&mut client).await;
        assert!(reply.contains("X-Hop: stub"), "{}", reply);

        client.write_all(b"tls").await.unwrap();
        let mut echoed = [0u8; 3];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"tls");

        drop(client);
        assert_eq!(hop_task.await.unwrap(), request);
    }

    #[tokio::test]
    async fn test_connect_via_socks5_stub() {
        let hop = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hop_addr = hop.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = hop.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            stream.write_all(&[5, 0]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [5, 1, 0, 1, 192, 0, 2, 10, 0x01, 0xBB]);
            stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();

            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let proxy_addr = start(proxy(format!("SOCKS5 {}", hop_addr))).await;
        let (mut client, reply) = connect(proxy_addr, "192.0.2.10:443").await;
        assert!(reply.starts_with("HTTP/1.1 200"));

        client.write_all(b"via-socks").await.unwrap();
        let mut echoed = [0u8; 9];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"via-socks");
    }

    #[tokio::test]
    async fn test_pac_endpoint_served_while_tunnel_open() {
        let echo = echo_server().await;
        let proxy_addr = start(proxy("DIRECT")).await;

        let (mut tunnel, reply) = connect(proxy_addr, &echo.to_string()).await;
        assert!(reply.starts_with("HTTP/1.1 200"));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"GET /pac HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200"));
        let mut expected = PAC_SOURCE.to_vec();
        expected.push(b'\n');
        assert_eq!(&response[split + 4..], &expected[..]);

        // 隧道不受影响
        tunnel.write_all(b"still-open").await.unwrap();
        let mut echoed = [0u8; 10];
        tunnel.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"still-open");
    }

    #[tokio::test]
    async fn test_plain_http_forward_direct() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nX-Origin: stub\r\nContent-Length: 7\r\n\r\nmissing")
                .await
                .unwrap();
            head
        });

        let proxy_addr = start(proxy("DIRECT")).await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!(
            "GET http://{}/missing HTTP/1.1\r\nHost: {}\r\n\r\n",
            origin_addr, origin_addr
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
        assert!(response.to_ascii_lowercase().contains("x-origin: stub"));
        assert!(response.ends_with("missing"));

        let head = origin_task.await.unwrap();
        assert!(head.starts_with("GET /missing HTTP/1.1\r\n"), "{}", head);
    }

    #[tokio::test]
    async fn test_connect_bad_directive_is_500() {
        let proxy_addr = start(proxy("SOCKS4 127.0.0.1:1080")).await;
        let (_client, reply) = connect(proxy_addr, "secure.test:443").await;
        assert!(reply.starts_with("HTTP/1.1 500"), "{}", reply);
    }

    #[tokio::test]
    async fn test_connect_closed_port_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let pac_proxy = proxy("DIRECT");
        let metrics = pac_proxy.metrics().clone();
        let proxy_addr = start(pac_proxy).await;
        let (_client, reply) = connect(proxy_addr, &closed.to_string()).await;
        assert!(reply.starts_with("HTTP/1.1 502"), "{}", reply);
        assert_eq!(metrics.snapshot().dial_errors, 1);
    }

    #[tokio::test]
    async fn test_plain_http_bad_directive_is_500() {
        let proxy_addr = start(proxy("")).await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"GET http://origin.test/ HTTP/1.1\r\nHost: origin.test\r\n\r\n")
            .await
            .unwrap();
        let reply = read_head(&mut client).await;
        assert!(reply.starts_with("HTTP/1.1 500"), "{}", reply);
    }

    #[tokio::test]
    async fn test_silent_tunnel_stays_open_without_idle_timeout() {
        let echo = echo_server().await;
        let proxy_addr = start(proxy("DIRECT")).await;
        let (mut client, _) = connect(proxy_addr, &echo.to_string()).await;

        let mut buf = [0u8; 1];
        let idle = tokio::time::timeout(Duration::from_millis(300), client.read(&mut buf)).await;
        assert!(idle.is_err(), "tunnel closed without an idle timeout");
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_silent_tunnel() {
        let echo = echo_server().await;
        let proxy_addr = start(proxy("DIRECT").with_idle_timeout(Some(Duration::from_millis(100)))).await;
        let (mut client, _) = connect(proxy_addr, &echo.to_string()).await;

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("idle tunnel should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let pac_proxy = proxy("DIRECT");
        let server = tokio::spawn(async move { pac_proxy.serve(listener, Some(rx)).await });

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_default_max_connections() {
        let max = default_max_connections();
        assert!(max >= 500 && max <= 10000);
    }
}
