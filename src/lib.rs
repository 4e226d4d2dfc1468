//! 按 PAC 决策分流的本地转发代理
//!
//! 普通 HTTP 请求直连或经下一跳代理（HTTP / SOCKS5）转发；CONNECT 请求在接管的原始连接上
//! 建立隧道并双向中继。`GET /pac` 返回启动时加载的 PAC 脚本。

pub mod config;
pub mod dialer;
pub mod dns;
pub mod error;
pub mod forward;
pub mod logger;
pub mod metrics;
pub mod pac;
pub mod relay;
pub mod request;
pub mod route;
pub mod server;
pub mod socks5;
pub mod tunnel;

pub use config::Config;
pub use dialer::{BoxedStream, DialFn, Dialer};
pub use error::{ProxyError, RouteError};
pub use forward::HttpForwarder;
pub use metrics::Metrics;
pub use pac::{CommandEvaluator, PacDocument, PacEvaluator};
pub use route::{parse_directive, ProxyAddr, ProxyScheme, RouteDecision, RouteResolver};
pub use server::PacProxy;
pub use tunnel::{TunnelEstablisher, TunnelState};
