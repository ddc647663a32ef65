//! 配对与信任
//!
//! 发起端生成 4 位数字码并显示；响应端输入看到的码，经带外通道提交给
//! 发起端校验。校验成功后双方把对方地址加入信任列表，之后来自该地址的
//! 传输请求自动接受。
//!
//! 同一时间只有一个配对尝试；新的尝试会使旧的失效。

pub mod channel;

pub use channel::{BridgeRequest, BridgedChannel, PairingChannel, PairingRequest, PairingResponse};

use crate::discovery::PeerDirectory;
use crate::error::{FlinchError, Result};
use crate::events::{EventBus, NodeEvent};
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// 4 位数字配对码
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingCode(String);

impl PairingCode {
    pub const LEN: usize = 4;

    /// 均匀随机生成 0000-9999
    pub fn generate() -> Self {
        let n: u16 = rand::thread_rng().gen_range(0..10_000);
        Self(format!("{n:04}"))
    }

    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.len() == Self::LEN && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(FlinchError::InvalidPairingCode(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 信任列表（按 IP 地址；入站连接的端口是临时端口）
#[derive(Debug, Clone, Default)]
pub struct TrustList {
    inner: Arc<RwLock<HashSet<IpAddr>>>,
}

impl TrustList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回是否为新加入
    pub fn trust(&self, ip: IpAddr) -> bool {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(ip)
    }

    pub fn revoke(&self, ip: IpAddr) -> bool {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&ip)
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&ip)
    }

    pub fn list(&self) -> Vec<IpAddr> {
        let mut list: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        list.sort();
        list
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingRole {
    Initiator,
    Responder,
}

/// 当前配对尝试
#[derive(Debug, Clone)]
struct PairingAttempt {
    role: PairingRole,
    code: PairingCode,
    target: Option<SocketAddr>,
    authenticated: bool,
    created_at: Instant,
    generation: u64,
}

/// 配对尝试的对外快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingStatus {
    pub role: PairingRole,
    pub code: String,
    pub target: Option<SocketAddr>,
    pub authenticated: bool,
}

/// 配对成功后的对端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedPeer {
    pub peer_id: String,
    pub name: String,
    pub address: SocketAddr,
}

/// 本机身份，随配对消息发给对端
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub device_id: String,
    pub name: String,
}

pub struct PairingManager {
    attempt: Mutex<Option<PairingAttempt>>,
    generation: Mutex<u64>,
    advertised: Mutex<Option<SocketAddr>>,
    identity: LocalIdentity,
    trust: TrustList,
    peers: PeerDirectory,
    bus: EventBus,
    channel: Arc<dyn PairingChannel>,
    ttl: Duration,
}

impl PairingManager {
    pub fn new(
        identity: LocalIdentity,
        trust: TrustList,
        peers: PeerDirectory,
        bus: EventBus,
        channel: Arc<dyn PairingChannel>,
        ttl: Duration,
    ) -> Self {
        Self {
            attempt: Mutex::new(None),
            generation: Mutex::new(0),
            advertised: Mutex::new(None),
            identity,
            trust,
            peers,
            bus,
            channel,
            ttl,
        }
    }

    fn attempt(&self) -> std::sync::MutexGuard<'_, Option<PairingAttempt>> {
        self.attempt
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *generation += 1;
        *generation
    }

    /// 设置本机对外公布的监听地址
    pub fn set_advertised(&self, address: SocketAddr) {
        *self
            .advertised
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(address);
    }

    fn advertised(&self) -> Option<SocketAddr> {
        *self
            .advertised
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn trust_list(&self) -> &TrustList {
        &self.trust
    }

    pub fn status(&self) -> Option<PairingStatus> {
        self.attempt().as_ref().map(|a| PairingStatus {
            role: a.role,
            code: a.code.to_string(),
            target: a.target,
            authenticated: a.authenticated,
        })
    }

    pub fn cancel(&self) {
        if self.attempt().take().is_some() {
            info!("Pairing attempt cancelled");
        }
    }

    /// 发起端：生成新码，取代之前的任何尝试
    pub fn generate_code(&self) -> PairingCode {
        let code = PairingCode::generate();
        let generation = self.next_generation();
        *self.attempt() = Some(PairingAttempt {
            role: PairingRole::Initiator,
            code: code.clone(),
            target: None,
            authenticated: false,
            created_at: Instant::now(),
            generation,
        });
        info!("Generated pairing code (attempt #{})", generation);
        self.bus.publish(NodeEvent::PairingCodeGenerated {
            code: code.to_string(),
        });
        code
    }

    /// 发起端：处理经带外通道到达的校验请求
    pub fn handle_request(&self, request: &PairingRequest) -> PairingResponse {
        let verdict = {
            let mut guard = self.attempt();
            match guard.as_mut() {
                None => Err(FlinchError::NoPairingAttempt),
                Some(a) if a.role != PairingRole::Initiator || a.authenticated => {
                    Err(FlinchError::NoPairingAttempt)
                }
                Some(a) if a.created_at.elapsed() > self.ttl => {
                    *guard = None;
                    Err(FlinchError::NoPairingAttempt)
                }
                Some(a) => {
                    let matches = PairingCode::parse(&request.code)
                        .map(|code| code == a.code)
                        .unwrap_or(false);
                    if matches {
                        a.authenticated = true;
                        a.target = Some(request.address);
                        Ok(())
                    } else {
                        Err(FlinchError::PairingMismatch)
                    }
                }
            }
        };

        if let Err(e) = verdict {
            warn!("Rejected pairing request from {}: {}", request.address, e);
            self.bus.publish(NodeEvent::PairingFailed {
                reason: e.to_string(),
            });
            return PairingResponse::rejected();
        }

        self.record_paired(&PairedPeer {
            peer_id: request.peer_id.clone(),
            name: request.name.clone(),
            address: request.address,
        });

        PairingResponse {
            success: true,
            peer_id: Some(self.identity.device_id.clone()),
            name: Some(self.identity.name.clone()),
            address: self.advertised(),
        }
    }

    /// 响应端：提交用户输入的码，等待发起端的明确成功信号
    pub async fn submit_code(&self, input: &str, target: SocketAddr) -> Result<PairedPeer> {
        let code = PairingCode::parse(input)?;
        let local = self.advertised().ok_or_else(|| {
            FlinchError::PairingChannel("local listener is not running".into())
        })?;

        let generation = self.next_generation();
        *self.attempt() = Some(PairingAttempt {
            role: PairingRole::Responder,
            code: code.clone(),
            target: Some(target),
            authenticated: false,
            created_at: Instant::now(),
            generation,
        });

        let request = PairingRequest {
            code: code.to_string(),
            peer_id: self.identity.device_id.clone(),
            name: self.identity.name.clone(),
            address: local,
        };

        let outcome = self.channel.request(target, request).await;

        let result = {
            let mut guard = self.attempt();
            match guard.as_mut() {
                Some(a) if a.generation == generation => match outcome {
                    Ok(response) if response.success => {
                        a.authenticated = true;
                        let address = response.address.unwrap_or(target);
                        a.target = Some(address);
                        Ok(PairedPeer {
                            peer_id: response
                                .peer_id
                                .unwrap_or_else(|| format!("paired-{address}")),
                            name: response.name.unwrap_or_else(|| address.ip().to_string()),
                            address,
                        })
                    }
                    Ok(_) => Err(FlinchError::PairingMismatch),
                    Err(e) => Err(e),
                },
                _ => Err(FlinchError::PairingSuperseded),
            }
        };

        match result {
            Ok(peer) => {
                self.record_paired(&peer);
                Ok(peer)
            }
            Err(e) => {
                warn!("Pairing with {} failed: {}", target, e);
                self.bus.publish(NodeEvent::PairingFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn record_paired(&self, peer: &PairedPeer) {
        if self.trust.trust(peer.address.ip()) {
            info!("Trusted {} ({})", peer.name, peer.address.ip());
        }
        self.peers
            .upsert_paired(&peer.peer_id, &peer.name, peer.address);
        self.bus.publish(NodeEvent::Paired {
            peer_id: peer.peer_id.clone(),
            name: peer.name.clone(),
            address: peer.address,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NeverChannel;

    #[async_trait::async_trait]
    impl PairingChannel for NeverChannel {
        async fn request(&self, _: SocketAddr, _: PairingRequest) -> Result<PairingResponse> {
            Err(FlinchError::PairingChannel("offline".into()))
        }
    }

    fn manager(ttl: Duration) -> PairingManager {
        PairingManager::new(
            LocalIdentity {
                device_id: "dev-a".into(),
                name: "Desk".into(),
            },
            TrustList::new(),
            PeerDirectory::new(Duration::from_secs(10)),
            EventBus::new(),
            Arc::new(NeverChannel),
            ttl,
        )
    }

    fn request(code: &str) -> PairingRequest {
        PairingRequest {
            code: code.into(),
            peer_id: "dev-b".into(),
            name: "Phone".into(),
            address: "10.0.0.7:4100".parse().unwrap(),
        }
    }

    #[test]
    fn test_code_format() {
        for _ in 0..200 {
            let code = PairingCode::generate();
            assert_eq!(code.as_str().len(), 4);
            assert!(code.as_str().bytes().all(|b| b.is_ascii_digit()));
        }
        assert!(PairingCode::parse(" 0042 ").is_ok());
        assert!(PairingCode::parse("42").is_err());
        assert!(PairingCode::parse("12a4").is_err());
        assert!(PairingCode::parse("12345").is_err());
    }

    #[test]
    fn test_verify_match_trusts_peer() {
        let m = manager(Duration::from_secs(300));
        m.set_advertised("10.0.0.2:4000".parse().unwrap());
        let code = m.generate_code();

        let response = m.handle_request(&request(code.as_str()));
        assert!(response.success);
        assert_eq!(response.peer_id.as_deref(), Some("dev-a"));
        assert_eq!(response.address, Some("10.0.0.2:4000".parse().unwrap()));

        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        assert!(m.trust_list().is_trusted(ip));
        let peer = m.peers.get("dev-b").unwrap();
        assert!(peer.paired);
        assert!(m.status().unwrap().authenticated);

        // 码只能使用一次
        assert!(!m.handle_request(&request(code.as_str())).success);
    }

    #[test]
    fn test_verify_mismatch_allows_retry() {
        let m = manager(Duration::from_secs(300));
        let code = m.generate_code();
        let wrong = if code.as_str() == "0000" { "1111" } else { "0000" };

        assert!(!m.handle_request(&request(wrong)).success);
        assert!(m.trust_list().list().is_empty());
        assert!(m.handle_request(&request(code.as_str())).success);
    }

    #[test]
    fn test_new_code_supersedes_old() {
        let m = manager(Duration::from_secs(300));
        let first = m.generate_code();
        let mut second = m.generate_code();
        while second == first {
            second = m.generate_code();
        }
        assert!(!m.handle_request(&request(first.as_str())).success);
        assert!(m.handle_request(&request(second.as_str())).success);
    }

    #[test]
    fn test_expired_attempt_rejected() {
        let m = manager(Duration::ZERO);
        let code = m.generate_code();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!m.handle_request(&request(code.as_str())).success);
        assert!(m.status().is_none());
    }

    #[test]
    fn test_no_attempt_rejected() {
        let m = manager(Duration::from_secs(300));
        assert!(!m.handle_request(&request("1234")).success);
    }

    #[tokio::test]
    async fn test_submit_requires_listener_and_valid_code() {
        let m = manager(Duration::from_secs(300));
        let target: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        assert!(matches!(
            m.submit_code("12", target).await,
            Err(FlinchError::InvalidPairingCode(_))
        ));
        assert!(matches!(
            m.submit_code("1234", target).await,
            Err(FlinchError::PairingChannel(_))
        ));

        m.set_advertised("10.0.0.2:4000".parse().unwrap());
        assert!(matches!(
            m.submit_code("1234", target).await,
            Err(FlinchError::PairingChannel(_))
        ));
        assert!(!m.trust_list().is_trusted(target.ip()));
    }
}
