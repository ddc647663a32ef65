//! 错误类型
//!
//! 所有会话、配对和监听器错误都汇总到 [`FlinchError`]。
//! 事件流中只携带可序列化的 [`FailureKind`] 和错误文本。

use crate::transfer::protocol::ProtocolError;
use crate::transfer::session::SessionId;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, FlinchError>;

#[derive(Debug, thiserror::Error)]
pub enum FlinchError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Transfer incomplete: received {received} of {expected} bytes")]
    IncompleteTransfer { received: u64, expected: u64 },

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Transfer declined by receiver")]
    Declined,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Peer {0} has no resolved address")]
    AddressUnresolved(String),

    #[error("Pairing code does not match")]
    PairingMismatch,

    #[error("Invalid pairing code: {0:?}")]
    InvalidPairingCode(String),

    #[error("No active pairing attempt")]
    NoPairingAttempt,

    #[error("Pairing attempt was superseded by a newer one")]
    PairingSuperseded,

    #[error("Pairing channel error: {0}")]
    PairingChannel(String),
}

impl FlinchError {
    /// 文件系统错误的便捷构造
    pub fn fs(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FlinchError::Protocol(_) => FailureKind::Protocol,
            FlinchError::Transport(_) => FailureKind::Transport,
            FlinchError::IncompleteTransfer { .. } => FailureKind::Incomplete,
            FlinchError::Filesystem { .. } => FailureKind::Filesystem,
            FlinchError::Declined => FailureKind::Declined,
            FlinchError::Cancelled => FailureKind::Cancelled,
            FlinchError::PairingMismatch
            | FlinchError::InvalidPairingCode(_)
            | FlinchError::NoPairingAttempt
            | FlinchError::PairingSuperseded
            | FlinchError::PairingChannel(_) => FailureKind::Pairing,
            FlinchError::UnknownSession(_)
            | FlinchError::UnknownPeer(_)
            | FlinchError::AddressUnresolved(_) => FailureKind::Usage,
        }
    }
}

/// 失败分类（随 `Failed` 事件发出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Protocol,
    Transport,
    Incomplete,
    Filesystem,
    Declined,
    Cancelled,
    Pairing,
    Usage,
}
