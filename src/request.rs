use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::ProxyError;

/// 请求头最大长度
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// 在 HTTP 分帧之前读取到的原始请求头
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    /// 请求行和所有头部，含结尾的空行，逐字节保留
    pub raw: Bytes,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// CONNECT 目标拆分为 (host, port)
    pub fn connect_target(&self) -> Result<(String, u16), ProxyError> {
        let (host, port) = self
            .target
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::BadRequest(format!("CONNECT 目标缺少端口: {}", self.target)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ProxyError::BadRequest(format!("CONNECT 目标端口无效: {}", self.target)))?;
        if host.is_empty() {
            return Err(ProxyError::BadRequest(format!("CONNECT 目标缺少主机: {}", self.target)));
        }
        Ok((host.to_string(), port))
    }

    /// 解析请求行
    pub fn parse(raw: Bytes) -> Result<Self, ProxyError> {
        let line_end = memchr::memchr(b'\n', &raw).unwrap_or(raw.len());
        let line = std::str::from_utf8(&raw[..line_end])
            .map_err(|_| ProxyError::BadRequest("请求行不是有效的 UTF-8".to_string()))?
            .trim_end_matches('\r');

        let mut parts = line.split(' ').filter(|p| !p.is_empty());
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(version), None) if version.starts_with("HTTP/") => {
                (method.to_string(), target.to_string(), version.to_string())
            }
            _ => return Err(ProxyError::BadRequest(format!("无效的请求行: {:?}", line))),
        };

        Ok(Self {
            method,
            target,
            version,
            raw,
        })
    }
}

/// 读取一个完整的请求头
///
/// 返回请求头和头部之后已经读入缓冲区的字节；连接在发送任何数据前关闭时返回 `None`。
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<(RequestHead, Bytes)>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = vec![0u8; 8192];
    let mut searched: usize = 0;

    loop {
        let n = reader
            .read(&mut tmp)
            .await
            .map_err(|e| ProxyError::BadRequest(format!("读取请求头失败: {}", e)))?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::BadRequest("客户端在请求头结束前关闭连接".to_string()));
        }
        buf.extend_from_slice(&tmp[..n]);

        // 从上次位置回退 3 字节继续查找，避免分隔符被拆在两次读取之间
        let from = searched.saturating_sub(3);
        if let Some(pos) = memchr::memmem::find(&buf[from..], b"\r\n\r\n") {
            let head_end = from + pos + 4;
            let mut raw = Bytes::from(buf);
            let rest = raw.split_off(head_end);
            return Ok(Some((RequestHead::parse(raw)?, rest)));
        }
        searched = buf.len();

        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::BadRequest(format!("请求头超过 {} 字节", MAX_HEAD_SIZE)));
        }
    }
}

/// 先吐出预读字节再读底层流的包装
///
/// 分帧层之前读入但未消费的数据通过它交还给后续处理，一个字节都不丢。
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.has_remaining() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
