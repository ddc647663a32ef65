//! Flinch Core Library
//!
//! 近场设备间直连文件传输的核心实现库：无需服务器和账户，
//! 对端由无线发现层提供，文件经本地网络的 TCP 连接传输。
//!
//! # 模块
//!
//! - **discovery**: 对端目录与广播负载编解码
//! - **transfer**: 线路协议、会话状态机、分块传输、监听器
//! - **approval**: 入站请求确认（信任对端自动接受）
//! - **pairing**: 4 位数字码配对与信任列表
//! - **workflow**: [`Node`] 门面
//! - **events**: 类型化事件流
//! - **ipc**: 守护进程与命令行之间的消息
//!
//! # 使用示例
//!
//! ## 接收文件
//!
//! ```ignore
//! use flinch_core::{AppSettings, BridgedChannel, Node, NodeEvent};
//!
//! let (channel, bridge_rx) = BridgedChannel::new(Duration::from_secs(30));
//! let node = Node::new(AppSettings::load(), Arc::new(channel));
//! let mut events = node.subscribe();
//! let addr = node.start_listening().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let NodeEvent::ApprovalRequested { request } = event {
//!         node.resolve_pending_approval(request.session_id, true)?;
//!     }
//! }
//! ```
//!
//! ## 发送文件
//!
//! ```ignore
//! let mut transfer = node.send_file("photo.jpg", "192.168.1.20:40123".parse()?).await?;
//! while let Some(event) = transfer.next().await {
//!     if let Some(pct) = event.percent() {
//!         println!("{pct:.0}%");
//!     }
//! }
//! ```

pub mod approval;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod ipc;
pub mod logging;
pub mod pairing;
pub mod transfer;
pub mod workflow;

pub use approval::{Approval, ApprovalGateway, DiscardReason};
pub use config::{AppSettings, Platform};
pub use discovery::{Peer, PeerDirectory, Sighting};
pub use error::{FailureKind, FlinchError, Result};
pub use events::{EventBus, NodeEvent, PendingApproval};
pub use logging::LogLevel;
pub use pairing::{
    BridgeRequest, BridgedChannel, PairedPeer, PairingChannel, PairingCode, PairingRequest,
    PairingResponse, PairingStatus, TrustList,
};
pub use transfer::{Direction, SessionId, SessionInfo, SessionState, TransportListener};
pub use workflow::{Node, OutboundTransfer, SendReport};
