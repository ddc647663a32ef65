//! TCP 监听器
//!
//! 接受循环与会话相互独立：每个入站连接交给处理函数后立即回到 accept。

use crate::error::Result;
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// accept 出错后的退避
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct TransportListener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TransportListener {
    /// 绑定并开始接受连接；绑定失败直接返回给调用方，不重试
    pub async fn bind<F, Fut>(addr: SocketAddr, handler: F) -> Result<Self>
    where
        F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        info!("Listening on {}", local_addr);

        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            debug!("Accepted connection from {}", remote);
                            tokio::spawn(handler(stream, remote));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    },
                }
            }
            info!("Listener on {} stopped", local_addr);
        });

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// 停止并等待接受循环退出
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for TransportListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 计算对外公布的地址
///
/// 优先使用配置的主机；否则用绑定地址；绑定在通配地址时探测出口网卡地址，
/// 都失败时退回回环地址。
pub fn advertised_address(bound: SocketAddr, advertise_host: Option<&str>) -> SocketAddr {
    if let Some(host) = advertise_host.map(str::trim).filter(|h| !h.is_empty()) {
        match host.parse::<IpAddr>() {
            Ok(ip) => return SocketAddr::new(ip, bound.port()),
            Err(_) => warn!("Ignoring invalid advertise_host {:?}", host),
        }
    }
    if !bound.ip().is_unspecified() {
        return bound;
    }
    let ip = outbound_interface_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    SocketAddr::new(ip, bound.port())
}

/// 对一个外部地址 connect 一个 UDP 套接字（不发送数据包），读取本端地址
fn outbound_interface_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}
