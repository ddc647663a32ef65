//! 节点
//!
//! 持有对端目录、监听器、会话登记表、配对管理器和确认网关各一份，
//! 对外提供消费者使用的全部操作。

use crate::approval::ApprovalGateway;
use crate::config::AppSettings;
use crate::discovery::{Peer, PeerDirectory, Sighting};
use crate::error::{FlinchError, Result};
use crate::events::{EventBus, NodeEvent, PendingApproval};
use crate::pairing::{
    LocalIdentity, PairedPeer, PairingChannel, PairingCode, PairingManager, PairingRequest,
    PairingResponse, PairingStatus, TrustList,
};
use crate::transfer::chunked::DestinationDir;
use crate::transfer::listener::{TransportListener, advertised_address};
use crate::transfer::outbound::{OutgoingFile, run_outgoing};
use crate::transfer::protocol::{Header, ProtocolError};
use crate::transfer::session::{SessionId, SessionInfo, SessionRegistry};
use crate::transfer::{SessionContext, inbound};
use crate::workflow::sender::{OutboundTransfer, SendReport};
use futures_util::StreamExt;
use log::{info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

struct Listening {
    listener: TransportListener,
    advertised: SocketAddr,
}

pub struct Node {
    settings: AppSettings,
    ctx: Arc<SessionContext>,
    peers: PeerDirectory,
    trust: TrustList,
    pairing: PairingManager,
    listening: Mutex<Option<Listening>>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(settings: AppSettings, channel: Arc<dyn PairingChannel>) -> Self {
        let bus = EventBus::new();
        let trust = TrustList::new();
        let peers = PeerDirectory::new(settings.peer_stale_after());
        let gateway = Arc::new(ApprovalGateway::new(
            trust.clone(),
            settings.auto_accept,
            bus.clone(),
        ));
        let ctx = Arc::new(SessionContext {
            registry: SessionRegistry::new(),
            gateway,
            bus: bus.clone(),
            destination: DestinationDir::new(settings.download_dir.clone()),
            chunk_size: settings.chunk_size.max(1),
            progress_interval: settings.progress_interval(),
            connect_timeout: settings.connect_timeout(),
        });
        let pairing = PairingManager::new(
            LocalIdentity {
                device_id: settings.device_id.clone(),
                name: settings.device_name.clone(),
            },
            trust.clone(),
            peers.clone(),
            bus,
            channel,
            settings.pairing_code_ttl(),
        );

        Self {
            settings,
            ctx,
            peers,
            trust,
            pairing,
            listening: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.ctx.bus.subscribe()
    }

    // ---- 监听 ----

    /// 启动监听，返回对外公布的地址；重复调用返回同一地址
    pub async fn start_listening(&self) -> Result<SocketAddr> {
        let mut listening = self.listening.lock().await;
        if let Some(l) = listening.as_ref() {
            return Ok(l.advertised);
        }

        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.settings.listen_port);
        let ctx = self.ctx.clone();
        let listener = TransportListener::bind(bind, move |stream, remote| {
            inbound::handle_incoming(ctx.clone(), stream, remote)
        })
        .await?;

        let advertised =
            advertised_address(listener.local_addr(), self.settings.advertise_host.as_deref());
        info!("Advertising {} as {}", advertised, self.settings.device_name);
        self.pairing.set_advertised(advertised);
        self.ctx.bus.publish(NodeEvent::Listening {
            address: advertised,
        });

        *listening = Some(Listening {
            listener,
            advertised,
        });
        Ok(advertised)
    }

    pub async fn local_address(&self) -> Option<SocketAddr> {
        self.listening.lock().await.as_ref().map(|l| l.advertised)
    }

    // ---- 发送 ----

    /// 向目标地址发送一个文件
    ///
    /// 文件名和文件本身在连接之前校验，校验失败直接返回错误，不产生会话。
    pub async fn send_file(&self, path: impl AsRef<Path>, target: SocketAddr) -> Result<OutboundTransfer> {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProtocolError::InvalidFileName(path.display().to_string()))?
            .to_string();

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| FlinchError::fs(&path, e))?;
        if !metadata.is_file() {
            return Err(FlinchError::fs(
                &path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let header = Header::new(file_name, metadata.len())?;
        let source = File::open(&path)
            .await
            .map_err(|e| FlinchError::fs(&path, e))?;

        let session_id = SessionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.ctx.registry.register(
            SessionInfo::outgoing(session_id, header.file_name.clone(), header.size, target),
            Some(tx),
        );
        info!("Sending '{}' ({} bytes) to {}", header.file_name, header.size, target);

        let task = tokio::spawn(run_outgoing(
            self.ctx.clone(),
            OutgoingFile {
                session_id,
                path,
                header,
                source,
                target,
            },
            cancel,
        ));
        Ok(OutboundTransfer::new(
            session_id,
            UnboundedReceiverStream::new(rx),
            task,
        ))
    }

    /// 按对端 ID 发送；对端必须已解析出地址
    pub async fn send_to_peer(&self, peer_id: &str, path: impl AsRef<Path>) -> Result<OutboundTransfer> {
        let target = self.peers.resolve_address(peer_id)?;
        self.send_file(path, target).await
    }

    /// 依次发送多个文件，每个文件是独立的会话；单个失败不影响后续文件
    pub async fn send_files(
        &self,
        paths: &[PathBuf],
        target: SocketAddr,
        mut on_event: impl FnMut(NodeEvent),
    ) -> Vec<SendReport> {
        let mut reports = Vec::with_capacity(paths.len());
        for path in paths {
            let report = match self.send_file(path, target).await {
                Ok(mut transfer) => {
                    let session_id = transfer.session_id();
                    while let Some(event) = transfer.next().await {
                        on_event(event);
                    }
                    SendReport {
                        path: path.clone(),
                        session_id: Some(session_id),
                        result: transfer.wait().await,
                    }
                }
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    SendReport {
                        path: path.clone(),
                        session_id: None,
                        result: Err(e),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    // ---- 会话 ----

    pub fn resolve_pending_approval(&self, session_id: SessionId, accept: bool) -> Result<()> {
        self.ctx.gateway.resolve(session_id, accept)
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.ctx.gateway.pending()
    }

    pub fn cancel_session(&self, session_id: SessionId) -> Result<()> {
        self.ctx.registry.cancel(session_id)?;
        info!("Cancellation requested for {}", session_id);
        Ok(())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.ctx.registry.snapshot()
    }

    // ---- 配对 ----

    pub fn generate_pairing_code(&self) -> PairingCode {
        self.pairing.generate_code()
    }

    /// 提交对方显示的配对码；本端会先开始监听，以便把地址告诉对方
    pub async fn submit_pairing_code(&self, code: &str, target: SocketAddr) -> Result<PairedPeer> {
        self.start_listening().await?;
        self.pairing.submit_code(code, target).await
    }

    pub fn handle_pairing_request(&self, request: &PairingRequest) -> PairingResponse {
        self.pairing.handle_request(request)
    }

    pub fn cancel_pairing(&self) {
        self.pairing.cancel();
    }

    pub fn pairing_status(&self) -> Option<PairingStatus> {
        self.pairing.status()
    }

    pub fn trusted(&self) -> Vec<IpAddr> {
        self.trust.list()
    }

    // ---- 对端 ----

    pub fn observe_sighting(&self, sighting: Sighting) -> bool {
        self.peers.observe(sighting)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.list()
    }

    pub fn peer_directory(&self) -> &PeerDirectory {
        &self.peers
    }

    /// 后台清理超时对端，随节点关闭而停止
    pub fn spawn_pruner(&self) -> JoinHandle<()> {
        self.peers
            .spawn_pruner(self.settings.prune_interval(), self.shutdown.child_token())
    }

    /// 停止监听、取消所有会话和配对尝试
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(l) = self.listening.lock().await.take() {
            l.listener.stop().await;
        }
        let cancelled = self.ctx.registry.cancel_all();
        self.pairing.cancel();
        info!("Node stopped ({} sessions cancelled)", cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::BridgedChannel;
    use std::time::Duration;
    use tempfile::TempDir;

    fn node(dir: &TempDir) -> Node {
        let settings = AppSettings {
            download_dir: dir.path().join("inbox"),
            advertise_host: Some("127.0.0.1".into()),
            ..Default::default()
        };
        let (channel, _rx) = BridgedChannel::new(Duration::from_millis(50));
        Node::new(settings, Arc::new(channel))
    }

    #[tokio::test]
    async fn test_rejects_unrepresentable_name_before_connect() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir);
        let path = dir.path().join("a::b.txt");
        std::fs::write(&path, b"x").unwrap();

        let err = node
            .send_file(&path, "127.0.0.1:9".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FlinchError::Protocol(ProtocolError::InvalidFileName(_))));
        assert!(node.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_filesystem_error() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir);
        let err = node
            .send_file(dir.path().join("nope"), "127.0.0.1:9".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FlinchError::Filesystem { .. }));
    }

    #[tokio::test]
    async fn test_unknown_peer_and_session() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir);
        assert!(matches!(
            node.send_to_peer("ghost", dir.path()).await.err().unwrap(),
            FlinchError::UnknownPeer(_)
        ));
        assert!(node.resolve_pending_approval(SessionId::new(), true).is_err());
        assert!(node.cancel_session(SessionId::new()).is_err());
    }

    #[tokio::test]
    async fn test_start_listening_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir);
        let mut events = node.subscribe();

        let first = node.start_listening().await.unwrap();
        let second = node.start_listening().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(matches!(
            events.recv().await.unwrap(),
            NodeEvent::Listening { .. }
        ));

        node.shutdown().await;
        assert!(node.local_address().await.is_none());
    }
}
