//! 对端目录
//!
//! 无线发现层只是 [`Sighting`] 的生产者；目录合并这些记录、按地址解析
//! 传输目标，并定期清理超时未再出现的对端。

pub mod advert;

use crate::config::Platform;
use crate::error::{FlinchError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 已知对端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    /// 解析出的监听地址；没有地址的对端不能作为传输目标
    pub address: Option<SocketAddr>,
    pub last_seen: SystemTime,
    /// 通过配对加入，不参与超时清理
    #[serde(default)]
    pub paired: bool,
}

/// 一次发现记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub address: Option<SocketAddr>,
    pub seen_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct PeerDirectory {
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    stale_after: Duration,
}

impl PeerDirectory {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            stale_after,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Peer>> {
        self.peers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Peer>> {
        self.peers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// 合并一次发现记录，按时间戳后写者胜；返回是否被采纳
    pub fn observe(&self, sighting: Sighting) -> bool {
        let mut peers = self.write();
        match peers.get_mut(&sighting.id) {
            Some(peer) if sighting.seen_at < peer.last_seen => false,
            Some(peer) => {
                peer.name = sighting.name;
                peer.platform = sighting.platform;
                peer.last_seen = sighting.seen_at;
                // 没带服务数据的记录不覆盖已解析的地址
                if sighting.address.is_some() {
                    peer.address = sighting.address;
                }
                true
            }
            None => {
                debug!("Discovered peer {} ({})", sighting.name, sighting.id);
                peers.insert(
                    sighting.id.clone(),
                    Peer {
                        id: sighting.id,
                        name: sighting.name,
                        platform: sighting.platform,
                        address: sighting.address,
                        last_seen: sighting.seen_at,
                        paired: false,
                    },
                );
                true
            }
        }
    }

    /// 配对成功后的显式写入
    pub fn upsert_paired(&self, id: &str, name: &str, address: SocketAddr) {
        let now = SystemTime::now();
        let mut peers = self.write();
        let peer = peers.entry(id.to_string()).or_insert_with(|| Peer {
            id: id.to_string(),
            name: name.to_string(),
            platform: Platform::Unknown,
            address: None,
            last_seen: now,
            paired: true,
        });
        peer.name = name.to_string();
        peer.address = Some(address);
        peer.last_seen = peer.last_seen.max(now);
        peer.paired = true;
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.read().get(id).cloned()
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Option<Peer> {
        self.read()
            .values()
            .find(|p| p.address.is_some_and(|a| a.ip() == ip))
            .cloned()
    }

    pub fn list(&self) -> Vec<Peer> {
        let mut list: Vec<_> = self.read().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 传输目标地址
    pub fn resolve_address(&self, id: &str) -> Result<SocketAddr> {
        let peer = self
            .get(id)
            .ok_or_else(|| FlinchError::UnknownPeer(id.to_string()))?;
        peer.address
            .ok_or_else(|| FlinchError::AddressUnresolved(id.to_string()))
    }

    /// 移除超时的对端，返回被移除的列表
    pub fn prune(&self, now: SystemTime) -> Vec<Peer> {
        let mut removed = Vec::new();
        self.write().retain(|_, peer| {
            let stale = !peer.paired
                && now
                    .duration_since(peer.last_seen)
                    .is_ok_and(|age| age > self.stale_after);
            if stale {
                removed.push(peer.clone());
            }
            !stale
        });
        removed
    }

    /// 后台定期清理，直到 `cancel` 触发
    pub fn spawn_pruner(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let directory = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for peer in directory.prune(SystemTime::now()) {
                            info!("Peer {} ({}) went stale", peer.name, peer.id);
                        }
                    }
                }
            }
            debug!("Peer pruner stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(id: &str, at: SystemTime, address: Option<&str>) -> Sighting {
        Sighting {
            id: id.into(),
            name: format!("dev-{id}"),
            platform: Platform::Android,
            address: address.map(|a| a.parse().unwrap()),
            seen_at: at,
        }
    }

    #[test]
    fn test_observe_last_write_wins() {
        let dir = PeerDirectory::new(Duration::from_secs(10));
        let t0 = SystemTime::now();
        let t1 = t0 + Duration::from_secs(1);

        assert!(dir.observe(sighting("a", t1, Some("10.0.0.2:4000"))));
        // 更旧的记录被忽略
        assert!(!dir.observe(sighting("a", t0, Some("10.0.0.3:4000"))));
        assert_eq!(
            dir.resolve_address("a").unwrap(),
            "10.0.0.2:4000".parse().unwrap()
        );

        // 没有地址的新记录保留已有地址
        assert!(dir.observe(sighting("a", t1 + Duration::from_secs(1), None)));
        assert!(dir.get("a").unwrap().address.is_some());
    }

    #[test]
    fn test_resolve_errors() {
        let dir = PeerDirectory::new(Duration::from_secs(10));
        dir.observe(sighting("b", SystemTime::now(), None));
        assert!(matches!(
            dir.resolve_address("b"),
            Err(FlinchError::AddressUnresolved(_))
        ));
        assert!(matches!(
            dir.resolve_address("zzz"),
            Err(FlinchError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_prune_spares_paired() {
        let dir = PeerDirectory::new(Duration::from_secs(10));
        let old = SystemTime::now() - Duration::from_secs(30);
        dir.observe(sighting("stale", old, None));
        dir.observe(sighting("fresh", SystemTime::now(), None));
        dir.upsert_paired("friend", "Friend", "10.0.0.9:4000".parse().unwrap());

        let later = SystemTime::now() + Duration::from_secs(5);
        let removed = dir.prune(later);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "stale");
        assert!(dir.get("fresh").is_some());

        let much_later = SystemTime::now() + Duration::from_secs(3600);
        dir.prune(much_later);
        assert_eq!(dir.list().len(), 1);
        assert!(dir.get("friend").unwrap().paired);
        assert!(dir.find_by_ip("10.0.0.9".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_pruner_stops_on_cancel() {
        let dir = PeerDirectory::new(Duration::from_millis(1));
        dir.observe(sighting("x", SystemTime::now() - Duration::from_secs(1), None));
        let cancel = CancellationToken::new();
        let handle = dir.spawn_pruner(Duration::from_millis(5), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(dir.is_empty());
        cancel.cancel();
        handle.await.unwrap();
    }
}
