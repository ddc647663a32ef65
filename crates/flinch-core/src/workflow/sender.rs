//! 发送端工作流
//!
//! 每次发送返回一个 [`OutboundTransfer`]：它是该会话专属的事件流，
//! 也可以直接等待最终结果。

use crate::error::{FlinchError, Result};
use crate::events::NodeEvent;
use crate::transfer::session::SessionId;
use futures_util::Stream;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// 一次出站发送
///
/// 事件流按顺序产出 `SessionStarted`、若干 `Progress`，最后是一个终态
/// 事件，之后结束。
pub struct OutboundTransfer {
    session_id: SessionId,
    events: UnboundedReceiverStream<NodeEvent>,
    task: JoinHandle<Result<u64>>,
}

impl OutboundTransfer {
    pub(crate) fn new(
        session_id: SessionId,
        events: UnboundedReceiverStream<NodeEvent>,
        task: JoinHandle<Result<u64>>,
    ) -> Self {
        Self {
            session_id,
            events,
            task,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// 等待发送结束，返回发送的字节数
    pub async fn wait(self) -> Result<u64> {
        self.task
            .await
            .map_err(|e| FlinchError::Transport(io::Error::other(e)))?
    }
}

impl Stream for OutboundTransfer {
    type Item = NodeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<NodeEvent>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// 队列中单个文件的结果
#[derive(Debug)]
pub struct SendReport {
    pub path: PathBuf,
    pub session_id: Option<SessionId>,
    pub result: Result<u64>,
}

impl SendReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}
