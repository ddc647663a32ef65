//! 配对带外通道
//!
//! 配对消息不走文件传输连接，而是经由发现层（BLE 等）传递。
//! 核心库只定义消息和 [`PairingChannel`] 接口；[`BridgedChannel`]
//! 把请求交给外部的无线桥接进程，并按请求 ID 关联它回传的应答。

use crate::error::{FlinchError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// 响应端 -> 发起端：携带用户输入的配对码
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub code: String,
    pub peer_id: String,
    pub name: String,
    /// 响应端的监听地址，发起端据此加入信任列表
    pub address: SocketAddr,
}

/// 发起端 -> 响应端：校验结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    /// 发起端的监听地址
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub address: Option<SocketAddr>,
}

impl PairingResponse {
    pub fn rejected() -> Self {
        Self {
            success: false,
            peer_id: None,
            name: None,
            address: None,
        }
    }
}

/// 带外通道接口
#[async_trait::async_trait]
pub trait PairingChannel: Send + Sync {
    /// 把请求送到 `target` 所在设备，等待其应答
    async fn request(&self, target: SocketAddr, request: PairingRequest)
    -> Result<PairingResponse>;
}

/// 交给桥接进程的待发请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    pub request_id: u64,
    pub target: SocketAddr,
    pub request: PairingRequest,
}

/// 经由外部桥接进程的通道实现
pub struct BridgedChannel {
    outgoing: mpsc::UnboundedSender<BridgeRequest>,
    pending: Mutex<HashMap<u64, oneshot::Sender<PairingResponse>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl BridgedChannel {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<BridgeRequest>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let channel = Self {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        };
        (channel, rx)
    }

    /// 桥接进程回传应答；请求 ID 未知或已超时返回 `false`
    pub fn complete(&self, request_id: u64, response: PairingResponse) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&request_id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                warn!("Pairing reply for unknown request {}", request_id);
                false
            }
        }
    }

    fn forget(&self, request_id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&request_id);
    }
}

#[async_trait::async_trait]
impl PairingChannel for BridgedChannel {
    async fn request(
        &self,
        target: SocketAddr,
        request: PairingRequest,
    ) -> Result<PairingResponse> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(request_id, tx);

        let outbound = BridgeRequest {
            request_id,
            target,
            request,
        };
        if self.outgoing.send(outbound).is_err() {
            self.forget(request_id);
            return Err(FlinchError::PairingChannel("bridge is not running".into()));
        }
        debug!("Pairing request {} handed to bridge for {}", request_id, target);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(FlinchError::PairingChannel("bridge dropped request".into())),
            Err(_) => {
                self.forget(request_id);
                Err(FlinchError::PairingChannel(format!(
                    "no reply from {target} within {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}
