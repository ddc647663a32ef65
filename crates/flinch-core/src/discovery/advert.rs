//! 广播负载编解码
//!
//! 监听地址以 6 字节服务数据广播：IPv4 四个字节，然后是大端端口号。
//! 同时也有 `ip:port` 文本形式（例如设备名称字段）。

use super::Sighting;
use crate::config::Platform;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::SystemTime;

pub const SERVICE_DATA_LEN: usize = 6;

pub fn encode(addr: SocketAddrV4) -> [u8; SERVICE_DATA_LEN] {
    let mut out = [0u8; SERVICE_DATA_LEN];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

/// 长度不足时返回 `None`；多余的尾部字节忽略
pub fn decode(data: &[u8]) -> Option<SocketAddrV4> {
    if data.len() < SERVICE_DATA_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddrV4::new(ip, port))
}

pub fn format_text(addr: SocketAddr) -> String {
    addr.to_string()
}

pub fn parse_text(text: &str) -> Option<SocketAddr> {
    text.trim().parse().ok()
}

/// 从一次无线扫描结果构造发现记录
///
/// 既没有名字也没有可解析地址的广播不是本协议的设备，返回 `None`。
pub fn sighting_from_advert(
    id: &str,
    local_name: Option<&str>,
    platform: Platform,
    service_data: Option<&[u8]>,
    seen_at: SystemTime,
) -> Option<Sighting> {
    let address = service_data
        .and_then(decode)
        .map(SocketAddr::V4)
        .or_else(|| local_name.and_then(parse_text));
    let name = local_name.map(str::trim).filter(|n| !n.is_empty());

    if name.is_none() && address.is_none() {
        return None;
    }

    Some(Sighting {
        id: id.to_string(),
        name: name.map_or_else(|| id.to_string(), str::to_string),
        platform,
        address,
        seen_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_data_layout() {
        let addr: SocketAddrV4 = "192.168.1.42:8080".parse().unwrap();
        let bytes = encode(addr);
        assert_eq!(bytes, [192, 168, 1, 42, 0x1F, 0x90]);
        assert_eq!(decode(&bytes), Some(addr));
        assert_eq!(decode(&bytes[..5]), None);
    }

    #[test]
    fn test_text_form() {
        let addr: SocketAddr = "10.1.2.3:4000".parse().unwrap();
        assert_eq!(format_text(addr), "10.1.2.3:4000");
        assert_eq!(parse_text(" 10.1.2.3:4000 "), Some(addr));
        assert_eq!(parse_text("Pixel 8"), None);
    }

    #[test]
    fn test_sighting_from_advert() {
        let now = SystemTime::now();
        let data = encode("10.0.0.4:5000".parse().unwrap());

        let s = sighting_from_advert("AA:BB", Some("Pixel"), Platform::Android, Some(&data), now)
            .unwrap();
        assert_eq!(s.name, "Pixel");
        assert_eq!(s.address, Some("10.0.0.4:5000".parse().unwrap()));

        let s = sighting_from_advert("AA:CC", Some("10.0.0.5:6000"), Platform::Mac, None, now)
            .unwrap();
        assert_eq!(s.address, Some("10.0.0.5:6000".parse().unwrap()));

        assert!(sighting_from_advert("AA:DD", None, Platform::Unknown, None, now).is_none());
    }
}
