//! 文件传输模块
//!
//! 包含:
//! - 线路协议（头部、应答令牌）
//! - 会话登记表
//! - 分块传输引擎
//! - 入站 / 出站会话状态机
//! - TCP 监听器

pub mod chunked;
pub mod inbound;
pub mod listener;
pub mod outbound;
pub mod protocol;
pub mod session;

pub use chunked::{DEFAULT_CHUNK_SIZE, DestinationDir, ProgressThrottle};
pub use listener::TransportListener;
pub use protocol::{Header, HeaderParser, ProtocolError, Response};
pub use session::{Direction, SessionId, SessionInfo, SessionRegistry, SessionState};

use crate::approval::ApprovalGateway;
use crate::events::{EventBus, NodeEvent};
use std::sync::Arc;
use std::time::Duration;

/// 所有会话任务共享的环境
pub struct SessionContext {
    pub registry: SessionRegistry,
    pub gateway: Arc<ApprovalGateway>,
    pub bus: EventBus,
    pub destination: DestinationDir,
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub connect_timeout: Duration,
}

impl SessionContext {
    /// 发布非终态事件：全局总线 + 会话观察者
    pub fn emit(&self, session_id: SessionId, event: NodeEvent) {
        self.registry.notify(session_id, &event);
        self.bus.publish(event);
    }

    /// 结束会话并发布终态事件
    ///
    /// 同一会话只有第一次调用生效，返回是否由本次调用上报。
    pub fn finish(&self, session_id: SessionId, state: SessionState, event: Option<NodeEvent>) -> bool {
        let Some((_, watcher)) = self.registry.finish(session_id, state) else {
            return false;
        };
        if let Some(event) = event {
            if let Some(watcher) = watcher {
                let _ = watcher.send(event.clone());
            }
            self.bus.publish(event);
        }
        true
    }
}
