//! 事件流
//!
//! 取代回调接口：任何消费者（CLI、守护进程、测试）都可以订阅同一条
//! 类型化事件流。每个会话的事件由会话自身的任务按顺序发布。

use crate::error::FailureKind;
use crate::transfer::session::{Direction, SessionId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

/// 等待用户确认的入站请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub session_id: SessionId,
    pub file_name: String,
    pub declared_size: u64,
    pub remote: SocketAddr,
    pub requested_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    Listening {
        address: SocketAddr,
    },
    ApprovalRequested {
        request: PendingApproval,
    },
    AutoAccepted {
        session_id: SessionId,
        file_name: String,
        remote: SocketAddr,
    },
    /// 发送端在确认前断开，请求被丢弃
    ApprovalDiscarded {
        session_id: SessionId,
        file_name: String,
    },
    SessionStarted {
        session_id: SessionId,
        direction: Direction,
        file_name: String,
        declared_size: u64,
        remote: SocketAddr,
    },
    Progress {
        session_id: SessionId,
        direction: Direction,
        transferred: u64,
        total: u64,
    },
    Completed {
        session_id: SessionId,
        direction: Direction,
        file_name: String,
        bytes: u64,
        saved_to: Option<PathBuf>,
    },
    /// 本端拒绝了入站请求
    Declined {
        session_id: SessionId,
        file_name: String,
    },
    Failed {
        session_id: SessionId,
        direction: Direction,
        file_name: String,
        kind: FailureKind,
        message: String,
    },
    PairingCodeGenerated {
        code: String,
    },
    Paired {
        peer_id: String,
        name: String,
        address: SocketAddr,
    },
    PairingFailed {
        reason: String,
    },
}

impl NodeEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            NodeEvent::ApprovalRequested { request } => Some(request.session_id),
            NodeEvent::AutoAccepted { session_id, .. }
            | NodeEvent::ApprovalDiscarded { session_id, .. }
            | NodeEvent::SessionStarted { session_id, .. }
            | NodeEvent::Progress { session_id, .. }
            | NodeEvent::Completed { session_id, .. }
            | NodeEvent::Declined { session_id, .. }
            | NodeEvent::Failed { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }

    /// 会话的最后一个事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeEvent::Completed { .. }
                | NodeEvent::Declined { .. }
                | NodeEvent::Failed { .. }
                | NodeEvent::ApprovalDiscarded { .. }
        )
    }

    /// 进度百分比 (0-100)
    pub fn percent(&self) -> Option<f64> {
        match self {
            NodeEvent::Progress {
                transferred, total, ..
            } => Some(percent(*transferred, *total)),
            _ => None,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
pub fn percent(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        transferred as f64 / total as f64 * 100.0
    }
}

/// 进程内事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// 没有订阅者时直接丢弃
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert!((percent(0, 0) - 100.0).abs() < f64::EPSILON);
        assert!((percent(512, 1024) - 50.0).abs() < f64::EPSILON);
        assert!((percent(1024, 1024) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = NodeEvent::PairingCodeGenerated {
            code: "0421".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"pairing_code_generated","code":"0421"}"#);

        let back: NodeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(!back.is_terminal());
        assert!(back.session_id().is_none());
    }

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(NodeEvent::PairingFailed {
            reason: "mismatch".to_string(),
        });
        assert!(matches!(a.recv().await.unwrap(), NodeEvent::PairingFailed { .. }));
        assert!(matches!(b.recv().await.unwrap(), NodeEvent::PairingFailed { .. }));
    }
}
