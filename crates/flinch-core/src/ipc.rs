//! 守护进程 IPC 消息
//!
//! Unix Socket 上的 JSON Lines：每行一个以 `type` 标记的请求或响应。
//! `send`、`subscribe` 和 `bridge_watch` 返回多行响应。

use crate::discovery::Peer;
use crate::events::{NodeEvent, PendingApproval};
use crate::pairing::{BridgeRequest, PairedPeer, PairingRequest, PairingResponse, PairingStatus};
use crate::transfer::session::SessionInfo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const SOCKET_NAME: &str = "flinch.sock";

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(SOCKET_NAME)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum IpcRequest {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "peers")]
    Peers,
    /// 发现层上报一次扫描结果
    #[serde(rename = "sighting")]
    Sighting {
        id: String,
        name: Option<String>,
        #[serde(default)]
        platform: Option<String>,
        /// `ip:port` 文本形式
        #[serde(default)]
        address: Option<String>,
        /// 6 字节服务数据
        #[serde(default)]
        service_data: Option<Vec<u8>>,
    },
    #[serde(rename = "send")]
    Send {
        file_paths: Vec<PathBuf>,
        #[serde(default)]
        target: Option<SocketAddr>,
        #[serde(default)]
        peer_id: Option<String>,
    },
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "resolve")]
    Resolve { session_id: String, accept: bool },
    #[serde(rename = "cancel")]
    Cancel { session_id: String },
    #[serde(rename = "pair_generate")]
    PairGenerate,
    #[serde(rename = "pair_submit")]
    PairSubmit { code: String, target: SocketAddr },
    /// 桥接进程转交对端发来的校验请求
    #[serde(rename = "pair_verify")]
    PairVerify { request: PairingRequest },
    /// 桥接进程回传本端请求的应答
    #[serde(rename = "pair_reply")]
    PairReply {
        request_id: u64,
        response: PairingResponse,
    },
    #[serde(rename = "subscribe")]
    Subscribe,
    #[serde(rename = "bridge_watch")]
    BridgeWatch,
    #[serde(rename = "stop")]
    Stop,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "status")]
    Status {
        device_id: String,
        device_name: String,
        address: Option<SocketAddr>,
        sessions: Vec<SessionInfo>,
        pending: usize,
        trusted: Vec<String>,
        pairing: Option<PairingStatus>,
    },
    #[serde(rename = "peers")]
    Peers { peers: Vec<Peer> },
    #[serde(rename = "pending")]
    Pending { requests: Vec<PendingApproval> },
    #[serde(rename = "event")]
    Event { event: NodeEvent },
    /// `send` 流的最后一行；之前的 `error` 行只针对单个文件
    #[serde(rename = "done")]
    Done { sent: usize, failed: usize },
    #[serde(rename = "code")]
    Code { code: String },
    #[serde(rename = "paired")]
    Paired { peer: PairedPeer },
    #[serde(rename = "pairing_response")]
    PairingResponse { response: PairingResponse },
    #[serde(rename = "bridge")]
    Bridge { request: BridgeRequest },
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        IpcResponse::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        IpcResponse::Error {
            message: message.to_string(),
        }
    }

    /// 流式请求是否在这一行结束
    pub fn ends_stream(&self) -> bool {
        matches!(self, IpcResponse::Done { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&IpcRequest::PairGenerate).unwrap();
        assert_eq!(json, r#"{"type":"pair_generate"}"#);

        let req: IpcRequest = serde_json::from_str(
            r#"{"type":"send","file_paths":["/tmp/a.txt"],"target":"10.0.0.2:4000"}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            IpcRequest::Send {
                file_paths: vec![PathBuf::from("/tmp/a.txt")],
                target: Some("10.0.0.2:4000".parse().unwrap()),
                peer_id: None,
            }
        );

        let req: IpcRequest =
            serde_json::from_str(r#"{"type":"sighting","id":"AA","name":"Pixel"}"#).unwrap();
        assert!(matches!(req, IpcRequest::Sighting { service_data: None, .. }));
    }

    #[test]
    fn test_response_stream_end() {
        assert!(IpcResponse::Done { sent: 1, failed: 0 }.ends_stream());
        assert!(!IpcResponse::error("boom").ends_stream());
        assert!(!IpcResponse::ok("fine").ends_stream());

        let json = serde_json::to_string(&IpcResponse::Code {
            code: "0042".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"code","code":"0042"}"#);
    }
}
