//! 工作流模块
//!
//! 提供高层 API 封装完整的发送/接收/配对流程

pub mod node;
pub mod sender;

pub use node::Node;
pub use sender::{OutboundTransfer, SendReport};
