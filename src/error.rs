use hyper::StatusCode;
use std::io;
use thiserror::Error;

/// PAC 路由解析错误
#[derive(Debug, Error)]
pub enum RouteError {
    /// PAC 返回了空字符串
    #[error("PAC 返回了空的代理配置字符串")]
    EmptyDirective,

    /// 代理类型后缺少 host:port
    #[error("代理配置字符串 {directive:?} 格式错误: 期望 \"{kind} host:port\"")]
    MalformedDirective { directive: String, kind: String },

    /// 已知但不支持的代理类型（例如 SOCKS4）
    #[error("不支持的代理类型: {0}")]
    UnsupportedProxy(String),

    /// 无法识别的代理类型
    #[error("无法识别的代理配置: {0}")]
    UnknownProxy(String),

    /// PAC 求值器执行失败
    #[error("执行 PAC 文件 {pac} 失败: {message}")]
    Evaluator { pac: String, message: String },
}

/// 单个请求/隧道的终止性错误
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("路由解析失败: {0}")]
    Route(#[from] RouteError),

    #[error("连接 {addr} 失败: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("当前连接不支持接管（hijack）")]
    HijackUnsupported,

    #[error("上游协议错误: {0}")]
    UpstreamProtocol(String),

    #[error("HTTP 转发失败: {0}")]
    RoundTrip(#[from] hyper::Error),

    #[error("无效的客户端请求: {0}")]
    BadRequest(String),
}

impl ProxyError {
    /// 返回给客户端的状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Route(_) | ProxyError::HijackUnsupported => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Dial { .. } | ProxyError::UpstreamProtocol(_) | ProxyError::RoundTrip(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub(crate) fn dial(addr: impl Into<String>, source: io::Error) -> Self {
        ProxyError::Dial {
            addr: addr.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let route = ProxyError::from(RouteError::EmptyDirective);
        assert_eq!(route.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            ProxyError::HijackUnsupported.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let dial = ProxyError::dial(
            "127.0.0.1:1",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(dial.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::UpstreamProtocol("bad".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = RouteError::MalformedDirective {
            directive: "PROXY".into(),
            kind: "PROXY".into(),
        };
        assert!(err.to_string().contains("PROXY host:port"));

        let err = ProxyError::dial(
            "example.com:443",
            io::Error::new(io::ErrorKind::TimedOut, "timed out"),
        );
        assert!(err.to_string().contains("example.com:443"));
    }
}
