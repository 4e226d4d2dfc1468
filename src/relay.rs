use log::debug;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::metrics::Metrics;

const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// 一条隧道两个方向的字节数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// 两个方向共享的最近活动时间
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_ms
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// 两个方向都空闲超过 `limit` 时返回，`None` 时永不返回
async fn idle_watchdog(activity: &Activity, limit: Option<Duration>) {
    let limit = match limit {
        Some(limit) => limit,
        None => return std::future::pending().await,
    };
    loop {
        let idle = activity.idle();
        if idle >= limit {
            return;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

/// 双向转发数据，任一方向结束即结束整条隧道
///
/// 返回前两端都会被关闭。空闲超时按整条隧道计算：任一方向有数据就不算空闲。
/// `idle_timeout` 为 `None` 时不设空闲超时，静默的对端会一直占着隧道。
pub async fn proxy_data<C, U>(
    client: C,
    upstream: U,
    metrics: Metrics,
    idle_timeout: Option<Duration>,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);
    let activity = Activity::new();

    let client_to_upstream = copy_loop(
        &mut client_read,
        &mut upstream_write,
        &up,
        &activity,
        &metrics,
        Direction::ClientToUpstream,
    );
    let upstream_to_client = copy_loop(
        &mut upstream_read,
        &mut client_write,
        &down,
        &activity,
        &metrics,
        Direction::UpstreamToClient,
    );

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                debug!("客户端到目标的数据传输结束: {}", e);
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                debug!("目标到客户端的数据传输结束: {}", e);
            }
        }
        _ = idle_watchdog(&activity, idle_timeout) => {
            debug!("隧道空闲超过 {:?}，关闭", idle_timeout.unwrap_or_default());
        }
    }

    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;
    drop(client_read.unsplit(client_write));
    drop(upstream_read.unsplit(upstream_write));

    RelayStats {
        client_to_upstream: up.load(Ordering::Relaxed),
        upstream_to_client: down.load(Ordering::Relaxed),
    }
}

async fn copy_loop<R, W>(
    reader: &mut ReadHalf<R>,
    writer: &mut WriteHalf<W>,
    counter: &AtomicU64,
    activity: &Activity,
    metrics: &Metrics,
    direction: Direction,
) -> io::Result<()>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();

        writer.write_all(&buf[..n]).await?;
        activity.touch();
        counter.fetch_add(n as u64, Ordering::Relaxed);
        match direction {
            Direction::ClientToUpstream => metrics.add_bytes_client_to_upstream(n as u64),
            Direction::UpstreamToClient => metrics.add_bytes_upstream_to_client(n as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);
        let metrics = Metrics::new();

        let relay = tokio::spawn(proxy_data(client_side, upstream_side, metrics.clone(), None));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // 客户端关闭后隧道结束，另一端也被关闭
        drop(client);
        let stats = relay.await.unwrap();
        assert_eq!(
            stats,
            RelayStats {
                client_to_upstream: 4,
                upstream_to_client: 5
            }
        );
        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_client_to_upstream, 4);
        assert_eq!(snapshot.bytes_upstream_to_client, 5);
    }

    #[tokio::test]
    async fn test_upstream_close_ends_tunnel() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, upstream) = duplex(1024);
        let relay = tokio::spawn(proxy_data(client_side, upstream_side, Metrics::new(), None));

        drop(upstream);
        relay.await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_silent_peers_hold_tunnel_without_idle_timeout() {
        let (_client, client_side) = duplex(1024);
        let (upstream_side, _upstream) = duplex(1024);
        let relay = tokio::spawn(proxy_data(client_side, upstream_side, Metrics::new(), None));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!relay.is_finished());
        relay.abort();
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_tunnel() {
        let (_client, client_side) = duplex(1024);
        let (upstream_side, _upstream) = duplex(1024);
        let relay = proxy_data(
            client_side,
            upstream_side,
            Metrics::new(),
            Some(Duration::from_millis(50)),
        );

        let stats = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("idle timeout should end the relay");
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn test_one_way_traffic_keeps_tunnel_alive() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);
        let relay = tokio::spawn(proxy_data(
            client_side,
            upstream_side,
            Metrics::new(),
            Some(Duration::from_millis(100)),
        ));

        // 只有下行数据，总时长远超空闲超时
        let writer = tokio::spawn(async move {
            for i in 0..30u8 {
                upstream.write_all(&[i]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            upstream
        });

        let mut received = [0u8; 30];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut received))
            .await
            .expect("download should not stall")
            .unwrap();
        let expected: Vec<u8> = (0..30u8).collect();
        assert_eq!(&received[..], &expected[..]);

        let _upstream = writer.await.unwrap();
        // 下行停止后整条隧道空闲，超时关闭
        let stats = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("idle tunnel should close")
            .unwrap();
        assert_eq!(
            stats,
            RelayStats {
                client_to_upstream: 0,
                upstream_to_client: 30
            }
        );
    }

    #[tokio::test]
    async fn test_large_payload() {
        let (mut client, client_side) = duplex(8 * 1024);
        let (upstream_side, mut upstream) = duplex(8 * 1024);
        let relay = tokio::spawn(proxy_data(client_side, upstream_side, Metrics::new(), None));

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let stats = relay.await.unwrap();
        assert_eq!(stats.client_to_upstream, expected.len() as u64);
    }
}
