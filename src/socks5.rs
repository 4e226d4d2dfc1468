use log::debug;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// 目标地址的 SOCKS5 编码
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    /// IP 字面量按地址类型编码，其他一律作为域名交给代理服务器解析
    pub fn from_host(host: &str) -> Self {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<Ipv4Addr>() {
            TargetAddr::V4(ip)
        } else if let Ok(ip) = bare.parse::<Ipv6Addr>() {
            TargetAddr::V6(ip)
        } else {
            TargetAddr::Domain(host.to_string())
        }
    }
}

/// 构造 CONNECT 请求
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn build_connect_request(target: &TargetAddr, port: u16) -> Result<Vec<u8>, ProxyError> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];

    match target {
        TargetAddr::V4(ip) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        TargetAddr::V6(ip) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        TargetAddr::Domain(domain) => {
            if domain.is_empty() || domain.len() > 255 {
                return Err(ProxyError::UpstreamProtocol(format!(
                    "SOCKS5 域名长度无效: {}",
                    domain
                )));
            }
            request.push(ATYP_DOMAIN);
            request.push(domain.len() as u8);
            request.extend_from_slice(domain.as_bytes());
        }
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// 在已连接到 SOCKS5 代理的流上完成无认证 CONNECT 握手
///
/// 握手成功后流即为到目标的透明通道。
pub async fn connect_via_socks5<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let target = TargetAddr::from_host(target_host);
    let connect_request = build_connect_request(&target, target_port)?;

    // 步骤 1: 协商认证方法，只提供无认证
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await
        .map_err(|e| io_error("写入 SOCKS5 握手请求失败", e))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| io_error("读取 SOCKS5 握手响应失败", e))?;

    if response[0] != SOCKS_VERSION {
        return Err(protocol_error(format!("无效的 SOCKS5 响应版本: {}", response[0])));
    }
    match response[1] {
        METHOD_NO_AUTH => debug!("SOCKS5 握手成功，无认证"),
        METHOD_NONE_ACCEPTABLE => return Err(protocol_error("SOCKS5 服务器要求认证".to_string())),
        method => return Err(protocol_error(format!("不支持的认证方法: {}", method))),
    }

    // 步骤 2: 发送 CONNECT 请求
    stream
        .write_all(&connect_request)
        .await
        .map_err(|e| io_error("发送 SOCKS5 连接请求失败", e))?;

    // 步骤 3: 读取连接响应
    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| io_error("读取 SOCKS5 连接响应失败", e))?;

    if reply[0] != SOCKS_VERSION {
        return Err(protocol_error(format!("无效的 SOCKS5 响应版本: {}", reply[0])));
    }
    if reply[1] != 0 {
        return Err(protocol_error(reply_message(reply[1])));
    }

    // 步骤 4: 丢弃 BND.ADDR 与 BND.PORT
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| io_error("读取域名长度失败", e))?;
            len[0] as usize
        }
        atyp => return Err(protocol_error(format!("不支持的地址类型: {}", atyp))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| io_error("读取地址数据失败", e))?;

    debug!("SOCKS5 已连接到 {}:{}", target_host, target_port);
    Ok(())
}

fn reply_message(code: u8) -> String {
    let reason = match code {
        1 => "一般 SOCKS 服务器故障",
        2 => "连接规则集不允许的连接",
        3 => "网络无法访问",
        4 => "主机无法访问",
        5 => "连接被拒绝",
        6 => "TTL 过期",
        7 => "不支持的命令",
        8 => "不支持的地址类型",
        _ => "未知错误",
    };
    format!("SOCKS5: {} (代码 {})", reason, code)
}

fn protocol_error(message: String) -> ProxyError {
    ProxyError::UpstreamProtocol(message)
}

fn io_error(context: &str, e: std::io::Error) -> ProxyError {
    ProxyError::UpstreamProtocol(format!("{}: {}", context, e))
}
