use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::client::conn::http1::Builder;
use hyper::header::{HeaderValue, CONNECTION, HOST};
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::dialer::{BoxedStream, Dialer};
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::pac::PacDocument;
use crate::route::{ProxyAddr, ProxyScheme, RouteDecision, RouteResolver};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// 处理所有非 CONNECT 请求
///
/// `GET /pac`（无目标主机）直接返回已加载的 PAC 脚本；其他请求按 PAC 路由转发，
/// 响应状态和头部原样返回，响应体流式转发。
#[derive(Clone)]
pub struct HttpForwarder {
    resolver: RouteResolver,
    dialer: Dialer,
    pac: Arc<PacDocument>,
    metrics: Metrics,
    cancel: CancellationToken,
}

impl HttpForwarder {
    pub fn new(resolver: RouteResolver, dialer: Dialer, pac: Arc<PacDocument>, metrics: Metrics) -> Self {
        Self {
            resolver,
            dialer,
            pac,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    /// 关闭时取消进行中的拨号
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn serve<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, Infallible>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.metrics.inc_http_requests();

        if is_pac_request(&req) {
            debug!("返回 PAC 脚本 {}", self.pac.name());
            return Ok(Response::new(full(self.pac.served_body())));
        }

        let method = req.method().clone();
        let uri = req.uri().clone();
        match self.forward(req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                warn!("HTTP {} {} 失败: {}", method, uri, e);
                Ok(error_response(&e))
            }
        }
    }

    async fn forward<B>(&self, mut req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.method() == Method::CONNECT {
            return Err(ProxyError::HijackUnsupported);
        }

        let uri = req.uri().clone();
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::UpstreamProtocol(format!("请求缺少目标主机: {}", uri)))?;
        if uri.scheme_str() != Some("http") {
            return Err(ProxyError::UpstreamProtocol(format!("不支持的协议: {}", uri)));
        }
        let origin = ProxyAddr {
            host: host.to_string(),
            port: uri.port_u16().unwrap_or(80),
        };

        ensure_host(&mut req)?;

        let pac_host = host.trim_start_matches('[').trim_end_matches(']');
        let decision = self
            .resolver
            .resolve(&uri.to_string(), pac_host)
            .await
            .map_err(|e| {
                self.metrics.inc_route_errors();
                ProxyError::from(e)
            })?;
        self.metrics.record_route(&decision);

        let upstream = match &decision {
            RouteDecision::Direct => {
                to_origin_form(&mut req)?;
                self.dialer.dial(&origin.to_string(), &self.cancel).await
            }
            RouteDecision::Proxy {
                scheme: ProxyScheme::Http,
                addr,
            } => self.dialer.dial(&addr.to_string(), &self.cancel).await,
            RouteDecision::Proxy {
                scheme: ProxyScheme::Socks5,
                addr,
            } => {
                to_origin_form(&mut req)?;
                self.dialer
                    .dial_socks5(addr, &origin.host, origin.port, &self.cancel)
                    .await
            }
        }
        .map_err(|e| {
            self.metrics.inc_dial_errors();
            e
        })?;

        req.headers_mut().remove("proxy-connection");
        req.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));

        round_trip(upstream, req).await
    }
}

/// 只有无目标主机的 `GET /pac` 是控制端点
fn is_pac_request<B>(req: &Request<B>) -> bool {
    req.method() == Method::GET && req.uri().host().is_none() && req.uri().path() == "/pac"
}

/// 客户端没带 Host 时按请求 URI 的 authority 补上
fn ensure_host<B>(req: &mut Request<B>) -> Result<(), ProxyError> {
    if req.headers().contains_key(HOST) {
        return Ok(());
    }
    if let Some(authority) = req.uri().authority().map(|a| a.to_string()) {
        let value = HeaderValue::from_str(&authority)
            .map_err(|e| ProxyError::BadRequest(format!("无效的 Host {}: {}", authority, e)))?;
        req.headers_mut().insert(HOST, value);
    }
    Ok(())
}

/// 直连或经 SOCKS5 时改写为 origin-form
fn to_origin_form<B>(req: &mut Request<B>) -> Result<(), ProxyError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    *req.uri_mut() = path
        .parse::<Uri>()
        .map_err(|e| ProxyError::BadRequest(format!("无效的请求路径 {}: {}", path, e)))?;
    Ok(())
}

/// 在已建立的上游连接上完成一次 HTTP/1 请求
async fn round_trip<B>(upstream: BoxedStream, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = Builder::new().handshake(TokioIo::new(upstream)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("上游 HTTP 连接结束: {}", e);
        }
    });

    let resp = sender.send_request(req).await?;
    Ok(resp.map(|body| body.boxed()))
}

pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = err.status_code();
    resp
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}
