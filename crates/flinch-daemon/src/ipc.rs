//! IPC Server - Unix Domain Socket 通信

use crate::service::Service;
use anyhow::Result;
use flinch_core::discovery::advert;
use flinch_core::ipc::{IpcRequest, IpcResponse, socket_path};
use flinch_core::{NodeEvent, Platform, SessionId};
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

pub async fn run_ipc_server(service: Arc<Service>) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC 服务器已启动: {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(service, stream).await {
                        tracing::debug!("客户端连接结束: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("接受连接失败: {}", e);
            }
        }
    }
}

async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer
        .write_all(serde_json::to_string(message)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

async fn handle_client(service: Arc<Service>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let request: IpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                write_line(&mut writer, &IpcResponse::error(format!("Invalid request: {e}")))
                    .await?;
                line.clear();
                continue;
            }
        };
        line.clear();

        tracing::debug!("收到请求: {:?}", request);

        match request {
            // 流式请求占用连接直到结束
            IpcRequest::Send {
                file_paths,
                target,
                peer_id,
            } => {
                stream_send(&service, &mut writer, file_paths, target, peer_id).await?;
            }
            IpcRequest::Subscribe => {
                let mut events = service.node().subscribe();
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(event) => {
                                write_line(&mut writer, &IpcResponse::Event { event }).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!("事件订阅者落后，丢弃 {} 条事件", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        // 订阅期间客户端不再发送请求，读到 EOF 即已断开
                        read = reader.read_line(&mut line) => {
                            if read? == 0 {
                                tracing::debug!("事件订阅者已断开");
                                return Ok(());
                            }
                            line.clear();
                        }
                    }
                }
            }
            IpcRequest::BridgeWatch => {
                let mut requests = service.watch_bridge();
                tracing::info!("桥接进程已连接");
                loop {
                    tokio::select! {
                        request = requests.recv() => match request {
                            Ok(request) => {
                                write_line(&mut writer, &IpcResponse::Bridge { request }).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!("桥接进程落后，丢弃 {} 个配对请求", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        read = reader.read_line(&mut line) => {
                            if read? == 0 {
                                tracing::info!("桥接进程已断开");
                                return Ok(());
                            }
                            line.clear();
                        }
                    }
                }
            }
            IpcRequest::Stop => {
                tracing::info!("收到停止请求");
                write_line(&mut writer, &IpcResponse::ok("守护进程正在停止")).await?;
                service.stop().await;
                return Ok(());
            }
            other => {
                let response = handle_request(&service, other).await;
                write_line(&mut writer, &response).await?;
            }
        }
    }

    Ok(())
}

/// 一问一答的请求
async fn handle_request(service: &Service, request: IpcRequest) -> IpcResponse {
    let node = service.node();
    match request {
        IpcRequest::Status => IpcResponse::Status {
            device_id: node.settings().device_id.clone(),
            device_name: node.settings().device_name.clone(),
            address: service.address().await,
            sessions: node.sessions(),
            pending: node.pending_approvals().len(),
            trusted: node.trusted().iter().map(ToString::to_string).collect(),
            pairing: node.pairing_status(),
        },
        IpcRequest::Peers => IpcResponse::Peers {
            peers: node.peers(),
        },
        IpcRequest::Sighting {
            id,
            name,
            platform,
            address,
            service_data,
        } => {
            let platform = platform.as_deref().map_or(Platform::Unknown, Platform::from_tag);
            let mut sighting = advert::sighting_from_advert(
                &id,
                name.as_deref(),
                platform,
                service_data.as_deref(),
                SystemTime::now(),
            );
            // 显式给出的地址优先
            if let (Some(s), Some(addr)) = (sighting.as_mut(), address.as_deref()) {
                if let Some(addr) = advert::parse_text(addr) {
                    s.address = Some(addr);
                }
            }
            match sighting {
                Some(s) => {
                    if node.observe_sighting(s) {
                        IpcResponse::ok("已更新")
                    } else {
                        IpcResponse::ok("过期的记录已忽略")
                    }
                }
                None => IpcResponse::error("广播中既没有名称也没有地址"),
            }
        }
        IpcRequest::Pending => IpcResponse::Pending {
            requests: node.pending_approvals(),
        },
        IpcRequest::Resolve { session_id, accept } => match session_id.parse::<SessionId>() {
            Ok(id) => match node.resolve_pending_approval(id, accept) {
                Ok(()) => IpcResponse::ok(if accept { "已接受" } else { "已拒绝" }),
                Err(e) => IpcResponse::error(e),
            },
            Err(e) => IpcResponse::error(format!("无效的会话 ID: {e}")),
        },
        IpcRequest::Cancel { session_id } => match session_id.parse::<SessionId>() {
            Ok(id) => match node.cancel_session(id) {
                Ok(()) => IpcResponse::ok("已请求取消"),
                Err(e) => IpcResponse::error(e),
            },
            Err(e) => IpcResponse::error(format!("无效的会话 ID: {e}")),
        },
        IpcRequest::PairGenerate => IpcResponse::Code {
            code: node.generate_pairing_code().to_string(),
        },
        IpcRequest::PairSubmit { code, target } => {
            match node.submit_pairing_code(&code, target).await {
                Ok(peer) => IpcResponse::Paired { peer },
                Err(e) => IpcResponse::error(e),
            }
        }
        IpcRequest::PairVerify { request } => IpcResponse::PairingResponse {
            response: node.handle_pairing_request(&request),
        },
        IpcRequest::PairReply {
            request_id,
            response,
        } => {
            if service.complete_bridge(request_id, response) {
                IpcResponse::ok("应答已送达")
            } else {
                IpcResponse::error(format!("未知或已超时的配对请求 #{request_id}"))
            }
        }
        IpcRequest::Send { .. }
        | IpcRequest::Subscribe
        | IpcRequest::BridgeWatch
        | IpcRequest::Stop => IpcResponse::error("流式请求不能在此处理"),
    }
}

/// 依次发送文件，把每个会话的事件逐行写回客户端
async fn stream_send<W>(
    service: &Service,
    writer: &mut W,
    file_paths: Vec<std::path::PathBuf>,
    target: Option<std::net::SocketAddr>,
    peer_id: Option<String>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let node = service.node().clone();
    let resolved = match (target, peer_id) {
        (Some(addr), _) => Ok(addr),
        (None, Some(id)) => node
            .peer_directory()
            .resolve_address(&id)
            .map_err(|e| e.to_string()),
        (None, None) => Err("需要 --to 或 --peer".to_string()),
    };
    let target = match resolved {
        Ok(addr) => addr,
        Err(message) => {
            write_line(writer, &IpcResponse::Error { message }).await?;
            let failed = file_paths.len();
            return write_line(writer, &IpcResponse::Done { sent: 0, failed }).await;
        }
    };

    // 发送在独立任务中进行，事件经通道写回；客户端断开不会中断发送
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let forward = tx.clone();
        let reports = node
            .send_files(&file_paths, target, move |event: NodeEvent| {
                let _ = forward.send(IpcResponse::Event { event });
            })
            .await;
        for report in reports.iter().filter(|r| r.session_id.is_none()) {
            if let Err(e) = &report.result {
                let _ = tx.send(IpcResponse::error(format!(
                    "{}: {}",
                    report.path.display(),
                    e
                )));
            }
        }
        let sent = reports.iter().filter(|r| r.is_success()).count();
        let _ = tx.send(IpcResponse::Done {
            sent,
            failed: reports.len() - sent,
        });
    });

    while let Some(response) = rx.recv().await {
        write_line(writer, &response).await?;
    }
    let _ = task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flinch_core::AppSettings;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_stream_client_disconnect_ends_handler() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = AppSettings {
            download_dir: dir.path().join("inbox"),
            advertise_host: Some("127.0.0.1".to_string()),
            ..Default::default()
        };
        let service = Service::start(settings).await.unwrap();

        for request in [r#"{"type":"subscribe"}"#, r#"{"type":"bridge_watch"}"#] {
            let (mut client, server) = UnixStream::pair().unwrap();
            let handler = tokio::spawn(handle_client(service.clone(), server));

            client.write_all(request.as_bytes()).await.unwrap();
            client.write_all(b"\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!handler.is_finished());

            // 没有任何事件发生，处理任务也应在客户端离开后结束
            drop(client);
            let finished = tokio::time::timeout(Duration::from_secs(5), handler).await;
            assert!(matches!(finished, Ok(Ok(Ok(())))), "{request}");
        }

        service.stop().await;
    }
}
