//! 会话模型与登记表
//!
//! 每个连接拥有自己的会话记录，通过生成的 [`SessionId`] 寻址。
//! 登记表只保存快照和取消令牌，会话状态机本身由会话任务独占。

use crate::error::{FlinchError, Result};
use crate::events::NodeEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    // 入站
    ReadingHeader,
    WaitingApproval,
    // 出站
    Connecting,
    AwaitingResponse,
    // 共用
    Streaming,
    Completed,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Closed
        )
    }
}

/// 会话快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub direction: Direction,
    pub file_name: String,
    pub declared_size: u64,
    pub bytes_transferred: u64,
    pub state: SessionState,
    pub remote: SocketAddr,
}

impl SessionInfo {
    pub fn incoming(session_id: SessionId, remote: SocketAddr) -> Self {
        Self {
            session_id,
            direction: Direction::Incoming,
            file_name: String::new(),
            declared_size: 0,
            bytes_transferred: 0,
            state: SessionState::ReadingHeader,
            remote,
        }
    }

    pub fn outgoing(
        session_id: SessionId,
        file_name: String,
        declared_size: u64,
        remote: SocketAddr,
    ) -> Self {
        Self {
            session_id,
            direction: Direction::Outgoing,
            file_name,
            declared_size,
            bytes_transferred: 0,
            state: SessionState::Connecting,
            remote,
        }
    }
}

struct SessionEntry {
    info: SessionInfo,
    cancel: CancellationToken,
    watcher: Option<mpsc::UnboundedSender<NodeEvent>>,
}

/// 活跃会话登记表
///
/// 锁只在内存操作期间持有，不跨越任何 I/O 等待。
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// 登记新会话，返回它的取消令牌
    pub fn register(
        &self,
        info: SessionInfo,
        watcher: Option<mpsc::UnboundedSender<NodeEvent>>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.lock().insert(
            info.session_id,
            SessionEntry {
                info,
                cancel: cancel.clone(),
                watcher,
            },
        );
        cancel
    }

    pub fn update(&self, id: SessionId, f: impl FnOnce(&mut SessionInfo)) {
        if let Some(entry) = self.lock().get_mut(&id) {
            f(&mut entry.info);
        }
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.lock().get(&id).map(|e| e.info.clone())
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut list: Vec<_> = self.lock().values().map(|e| e.info.clone()).collect();
        list.sort_by_key(|info| info.session_id);
        list
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 请求取消；真正的终态由会话任务自己上报
    pub fn cancel(&self, id: SessionId) -> Result<()> {
        let guard = self.lock();
        let entry = guard.get(&id).ok_or(FlinchError::UnknownSession(id))?;
        entry.cancel.cancel();
        Ok(())
    }

    pub fn cancel_all(&self) -> usize {
        let guard = self.lock();
        for entry in guard.values() {
            entry.cancel.cancel();
        }
        guard.len()
    }

    /// 把事件转发给该会话的专属观察者
    pub fn notify(&self, id: SessionId, event: &NodeEvent) {
        if let Some(watcher) = self.lock().get(&id).and_then(|e| e.watcher.as_ref()) {
            let _ = watcher.send(event.clone());
        }
    }

    /// 移除会话；只有第一次调用返回观察者和最终快照
    pub fn finish(
        &self,
        id: SessionId,
        state: SessionState,
    ) -> Option<(SessionInfo, Option<mpsc::UnboundedSender<NodeEvent>>)> {
        let mut entry = self.lock().remove(&id)?;
        entry.info.state = state;
        Some((entry.info, entry.watcher))
    }
}
