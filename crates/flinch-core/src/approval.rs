//! 入站请求确认
//!
//! 来自已信任地址的请求（或开启了 `auto_accept`）直接放行；其余请求
//! 挂起，只阻塞对应的会话，直到消费者调用 [`ApprovalGateway::resolve`]。

use crate::error::{FlinchError, Result};
use crate::events::{EventBus, NodeEvent, PendingApproval};
use crate::pairing::TrustList;
use crate::transfer::session::SessionId;
use log::info;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// 提交结果
#[derive(Debug)]
pub enum Approval {
    /// 自动接受
    Granted,
    /// 等待用户；`true` 为接受
    Pending(oneshot::Receiver<bool>),
}

/// 请求在确认前被撤下的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// 发送端断开
    SenderLeft,
    /// 本端取消了会话
    Cancelled,
    /// 会话因错误结束
    Failed,
}

pub struct ApprovalGateway {
    pending: Mutex<HashMap<SessionId, (PendingApproval, oneshot::Sender<bool>)>>,
    trust: TrustList,
    auto_accept: bool,
    bus: EventBus,
}

impl ApprovalGateway {
    pub fn new(trust: TrustList, auto_accept: bool, bus: EventBus) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            trust,
            auto_accept,
            bus,
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SessionId, (PendingApproval, oneshot::Sender<bool>)>>
    {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn submit(&self, request: PendingApproval) -> Approval {
        if self.auto_accept || self.trust.is_trusted(request.remote.ip()) {
            return Approval::Granted;
        }

        let (tx, rx) = oneshot::channel();
        self.lock().insert(request.session_id, (request.clone(), tx));
        self.bus.publish(NodeEvent::ApprovalRequested { request });
        Approval::Pending(rx)
    }

    pub fn resolve(&self, session_id: SessionId, accept: bool) -> Result<()> {
        let (request, tx) = self
            .lock()
            .remove(&session_id)
            .ok_or(FlinchError::UnknownSession(session_id))?;
        info!(
            "{} '{}' ({})",
            if accept { "Accepted" } else { "Declined" },
            request.file_name,
            session_id
        );
        // 会话在这之间断开时接收端已不存在
        if tx.send(accept).is_err() {
            return Err(FlinchError::UnknownSession(session_id));
        }
        Ok(())
    }

    /// 撤下未决请求，只记录日志
    pub fn discard(&self, session_id: SessionId, reason: DiscardReason) -> Option<PendingApproval> {
        let (request, _) = self.lock().remove(&session_id)?;
        match reason {
            DiscardReason::SenderLeft => info!(
                "Sender of '{}' disconnected before approval, request discarded",
                request.file_name
            ),
            DiscardReason::Cancelled => info!(
                "Session {} cancelled while '{}' awaited approval",
                session_id, request.file_name
            ),
            DiscardReason::Failed => info!(
                "Request for '{}' withdrawn after a session error",
                request.file_name
            ),
        }
        Some(request)
    }

    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut list: Vec<_> = self.lock().values().map(|(r, _)| r.clone()).collect();
        list.sort_by_key(|r| r.requested_at);
        list
    }
}
