//! Core Service - 持有节点、配对桥接和后台任务

use anyhow::Result;
use flinch_core::{AppSettings, BridgeRequest, BridgedChannel, Node, PairingResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const BRIDGE_FANOUT: usize = 32;

pub struct Service {
    node: Arc<Node>,
    channel: Arc<BridgedChannel>,
    bridge_tx: broadcast::Sender<BridgeRequest>,
    stopped: CancellationToken,
}

impl Service {
    /// 构建节点并开始监听
    pub async fn start(settings: AppSettings) -> Result<Arc<Self>> {
        tracing::info!("核心服务初始化...");
        let (channel, bridge_rx) = BridgedChannel::new(settings.pairing_timeout());
        let channel = Arc::new(channel);
        let node = Arc::new(Node::new(settings, channel.clone()));

        let address = node.start_listening().await?;
        node.spawn_pruner();
        tracing::info!(
            "设备 {} ({}) 监听于 {}",
            node.settings().device_name,
            node.settings().device_id,
            address
        );

        let (bridge_tx, _) = broadcast::channel(BRIDGE_FANOUT);
        tokio::spawn(forward_bridge(bridge_rx, bridge_tx.clone()));

        Ok(Arc::new(Self {
            node,
            channel,
            bridge_tx,
            stopped: CancellationToken::new(),
        }))
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub async fn address(&self) -> Option<SocketAddr> {
        self.node.local_address().await
    }

    /// 桥接进程订阅待发的配对请求
    pub fn watch_bridge(&self) -> broadcast::Receiver<BridgeRequest> {
        self.bridge_tx.subscribe()
    }

    pub fn complete_bridge(&self, request_id: u64, response: PairingResponse) -> bool {
        self.channel.complete(request_id, response)
    }

    pub async fn stop(&self) {
        self.node.shutdown().await;
        self.stopped.cancel();
    }

    /// 等待直到 `stop` 被调用
    pub async fn run(&self) {
        self.stopped.cancelled().await;
        tracing::info!("核心服务已停止");
    }
}

/// 把通道产生的请求广播给所有桥接订阅者；没有订阅者时请求会超时
async fn forward_bridge(
    mut rx: mpsc::UnboundedReceiver<BridgeRequest>,
    tx: broadcast::Sender<BridgeRequest>,
) {
    while let Some(request) = rx.recv().await {
        tracing::debug!("配对请求 #{} -> {}", request.request_id, request.target);
        if tx.send(request).is_err() {
            tracing::warn!("没有桥接进程在监听，配对请求将超时");
        }
    }
}
