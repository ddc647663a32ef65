//! 入站会话状态机
//!
//! `ReadingHeader -> WaitingApproval -> Streaming -> Completed`，
//! 任何一步都可能进入 `Failed`；拒绝或发送端提前断开进入 `Closed`。

use crate::approval::{Approval, DiscardReason};
use crate::error::{FlinchError, Result};
use crate::events::{NodeEvent, PendingApproval};
use crate::transfer::SessionContext;
use crate::transfer::chunked::{ProgressThrottle, receive_body};
use crate::transfer::protocol::{Header, HeaderParser, ProtocolError, Response};
use crate::transfer::session::{Direction, SessionId, SessionInfo, SessionState};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const HEADER_READ_SIZE: usize = 1024;

/// 等待确认期间最多缓存的正文字节数；达到后不再读取，发送端由 TCP 流控挂起
const MAX_EARLY_BODY: usize = 64 * 1024;

/// 会话结局（非错误）
enum Outcome {
    Completed { bytes: u64, saved_to: PathBuf },
    Declined,
    /// 发送端在确认前断开
    Discarded,
    /// 连接没有发送任何字节就关闭
    Empty,
}

/// 处理一个入站连接直到终态
pub async fn handle_incoming<S>(ctx: Arc<SessionContext>, mut stream: S, remote: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session_id = SessionId::new();
    let cancel = ctx
        .registry
        .register(SessionInfo::incoming(session_id, remote), None);
    debug!("Incoming connection from {} ({})", remote, session_id);

    let mut file_name = String::new();
    let result = run(&ctx, session_id, &mut stream, remote, &cancel, &mut file_name).await;
    let _ = stream.shutdown().await;

    match result {
        Ok(Outcome::Completed { bytes, saved_to }) => {
            info!("Received '{}' ({} bytes) -> {}", file_name, bytes, saved_to.display());
            ctx.finish(
                session_id,
                SessionState::Completed,
                Some(NodeEvent::Completed {
                    session_id,
                    direction: Direction::Incoming,
                    file_name,
                    bytes,
                    saved_to: Some(saved_to),
                }),
            );
        }
        Ok(Outcome::Declined) => {
            ctx.finish(
                session_id,
                SessionState::Closed,
                Some(NodeEvent::Declined {
                    session_id,
                    file_name,
                }),
            );
        }
        Ok(Outcome::Discarded) => {
            ctx.finish(
                session_id,
                SessionState::Closed,
                Some(NodeEvent::ApprovalDiscarded {
                    session_id,
                    file_name,
                }),
            );
        }
        Ok(Outcome::Empty) => {
            debug!("Connection from {} closed before sending a header", remote);
            ctx.finish(session_id, SessionState::Closed, None);
        }
        Err(e) => {
            warn!("Incoming '{}' from {} failed: {}", file_name, remote, e);
            ctx.finish(
                session_id,
                SessionState::Failed,
                Some(NodeEvent::Failed {
                    session_id,
                    direction: Direction::Incoming,
                    file_name,
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            );
        }
    }
}

async fn run<S>(
    ctx: &SessionContext,
    session_id: SessionId,
    stream: &mut S,
    remote: SocketAddr,
    cancel: &CancellationToken,
    file_name: &mut String,
) -> Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ReadingHeader
    let Some((header, mut buffered)) = read_header(stream, cancel).await? else {
        return Ok(Outcome::Empty);
    };
    file_name.clone_from(&header.file_name);
    let declared = header.size;
    check_overflow(buffered.len(), declared)?;

    ctx.registry.update(session_id, |info| {
        info.file_name.clone_from(&header.file_name);
        info.declared_size = declared;
        info.state = SessionState::WaitingApproval;
    });
    ctx.emit(
        session_id,
        NodeEvent::SessionStarted {
            session_id,
            direction: Direction::Incoming,
            file_name: header.file_name.clone(),
            declared_size: declared,
            remote,
        },
    );

    // WaitingApproval
    let request = PendingApproval {
        session_id,
        file_name: header.file_name.clone(),
        declared_size: declared,
        remote,
        requested_at: SystemTime::now(),
    };
    let accepted = match ctx.gateway.submit(request) {
        Approval::Granted => {
            info!("Auto-accepting '{}' from {}", header.file_name, remote);
            ctx.emit(
                session_id,
                NodeEvent::AutoAccepted {
                    session_id,
                    file_name: header.file_name.clone(),
                    remote,
                },
            );
            true
        }
        Approval::Pending(decision) => {
            match wait_for_decision(stream, decision, &mut buffered, declared, cancel).await {
                Ok(Some(accept)) => accept,
                Ok(None) => {
                    ctx.gateway.discard(session_id, DiscardReason::SenderLeft);
                    return Ok(Outcome::Discarded);
                }
                Err(e) => {
                    let reason = if matches!(e, FlinchError::Cancelled) {
                        DiscardReason::Cancelled
                    } else {
                        DiscardReason::Failed
                    };
                    ctx.gateway.discard(session_id, reason);
                    return Err(e);
                }
            }
        }
    };

    if !accepted {
        write_response(stream, Response::Decline).await?;
        return Ok(Outcome::Declined);
    }

    // 先准备好落盘位置再应答，无法写入时直接拒绝
    let mut partial = match ctx.destination.create_partial(session_id).await {
        Ok(partial) => partial,
        Err(e) => {
            let _ = write_response(stream, Response::Decline).await;
            return Err(e);
        }
    };
    if let Err(e) = write_response(stream, Response::Accept).await {
        partial.discard().await;
        return Err(e);
    }

    // Streaming
    ctx.registry
        .update(session_id, |info| info.state = SessionState::Streaming);
    let mut throttle = ProgressThrottle::new(ctx.progress_interval);
    let body = receive_body(
        stream,
        &mut partial,
        &buffered,
        declared,
        ctx.chunk_size,
        cancel,
        |transferred| {
            ctx.registry
                .update(session_id, |info| info.bytes_transferred = transferred);
            if throttle.should_report(transferred, declared) {
                ctx.emit(
                    session_id,
                    NodeEvent::Progress {
                        session_id,
                        direction: Direction::Incoming,
                        transferred,
                        total: declared,
                    },
                );
            }
        },
    )
    .await;
    let received = match body {
        Ok(received) => received,
        Err(e) => {
            partial.discard().await;
            return Err(e);
        }
    };

    let saved_to = ctx.destination.commit(partial, &header.file_name).await?;
    ctx.emit(
        session_id,
        NodeEvent::Progress {
            session_id,
            direction: Direction::Incoming,
            transferred: received,
            total: declared,
        },
    );

    Ok(Outcome::Completed {
        bytes: received,
        saved_to,
    })
}

/// 读取头部；连接在发送任何字节前关闭时返回 `None`
async fn read_header<S>(
    stream: &mut S,
    cancel: &CancellationToken,
) -> Result<Option<(Header, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut parser = HeaderParser::new();
    let mut buf = [0u8; HEADER_READ_SIZE];
    loop {
        let n = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FlinchError::Cancelled),
            read = stream.read(&mut buf) => read?,
        };
        if n == 0 {
            if parser.is_empty() {
                return Ok(None);
            }
            return Err(ProtocolError::TruncatedHeader.into());
        }
        if let Some(parsed) = parser.push(&buf[..n])? {
            return Ok(Some((parsed.header, parsed.body_prefix)));
        }
    }
}

/// 等待用户决定，同时缓存发送端提前发来的正文
///
/// 缓存至多 [`MAX_EARLY_BODY`] 字节，之后只等待决定和取消。
/// 返回 `Ok(None)` 表示发送端在决定之前断开（仅在缓存未满时能发现）。
async fn wait_for_decision<S>(
    stream: &mut S,
    mut decision: tokio::sync::oneshot::Receiver<bool>,
    buffered: &mut Vec<u8>,
    declared: u64,
    cancel: &CancellationToken,
) -> Result<Option<bool>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_READ_SIZE];
    loop {
        let want = MAX_EARLY_BODY.saturating_sub(buffered.len()).min(buf.len());
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FlinchError::Cancelled),
            resolved = &mut decision => {
                // 网关被丢弃视为拒绝
                return Ok(Some(resolved.unwrap_or(false)));
            }
            read = stream.read(&mut buf[..want]), if want > 0 => {
                let n = read?;
                if n == 0 {
                    return Ok(None);
                }
                buffered.extend_from_slice(&buf[..n]);
                check_overflow(buffered.len(), declared)?;
            }
        }
    }
}

fn check_overflow(buffered: usize, declared: u64) -> Result<()> {
    let received = buffered as u64;
    if received > declared {
        return Err(ProtocolError::BodyOverflow { received, declared }.into());
    }
    Ok(())
}

async fn write_response<S>(stream: &mut S, response: Response) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(response.token()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalGateway;
    use crate::events::EventBus;
    use crate::pairing::TrustList;
    use crate::transfer::chunked::DestinationDir;
    use crate::transfer::session::SessionRegistry;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::duplex;

    fn context(dir: &TempDir, auto_accept: bool) -> (Arc<SessionContext>, EventBus) {
        let bus = EventBus::new();
        let ctx = SessionContext {
            registry: SessionRegistry::new(),
            gateway: Arc::new(ApprovalGateway::new(TrustList::new(), auto_accept, bus.clone())),
            bus: bus.clone(),
            destination: DestinationDir::new(dir.path()),
            chunk_size: 4,
            progress_interval: Duration::ZERO,
            connect_timeout: Duration::from_secs(1),
        };
        (Arc::new(ctx), bus)
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn terminal(events: &mut tokio::sync::broadcast::Receiver<NodeEvent>) -> NodeEvent {
        loop {
            let event = events.recv().await.unwrap();
            if event.is_terminal() {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_header_and_early_body_in_one_segment() {
        let dir = TempDir::new().unwrap();
        let (ctx, bus) = context(&dir, true);
        let mut events = bus.subscribe();
        let (mut client, server) = duplex(1024);

        let task = tokio::spawn(handle_incoming(ctx, server, remote()));
        client.write_all(b"hello.txt::11::hello").await.unwrap();

        let mut token = [0u8; 8];
        client.read_exact(&mut token).await.unwrap();
        assert_eq!(&token, b"ACCEPT::");
        client.write_all(b" world").await.unwrap();

        match terminal(&mut events).await {
            NodeEvent::Completed {
                bytes, saved_to, ..
            } => {
                assert_eq!(bytes, 11);
                assert_eq!(std::fs::read(saved_to.unwrap()).unwrap(), b"hello world");
            }
            other => panic!("unexpected {other:?}"),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_size_fails() {
        let dir = TempDir::new().unwrap();
        let (ctx, bus) = context(&dir, true);
        let mut events = bus.subscribe();
        let (mut client, server) = duplex(1024);

        let task = tokio::spawn(handle_incoming(ctx.clone(), server, remote()));
        client.write_all(b"a.txt::-5::").await.unwrap();

        match terminal(&mut events).await {
            NodeEvent::Failed { kind, .. } => {
                assert_eq!(kind, crate::error::FailureKind::Protocol);
            }
            other => panic!("unexpected {other:?}"),
        }
        task.await.unwrap();
        assert!(ctx.registry.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sender_leaves_before_approval() {
        let dir = TempDir::new().unwrap();
        let (ctx, bus) = context(&dir, false);
        let mut events = bus.subscribe();
        let (mut client, server) = duplex(1024);

        let task = tokio::spawn(handle_incoming(ctx.clone(), server, remote()));
        client.write_all(b"a.txt::3::").await.unwrap();
        loop {
            if let NodeEvent::ApprovalRequested { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        drop(client);

        assert!(matches!(
            terminal(&mut events).await,
            NodeEvent::ApprovalDiscarded { .. }
        ));
        task.await.unwrap();
        assert!(ctx.gateway.pending().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_overflow_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let (ctx, bus) = context(&dir, false);
        let mut events = bus.subscribe();
        let (mut client, server) = duplex(1024);

        let task = tokio::spawn(handle_incoming(ctx.clone(), server, remote()));
        client.write_all(b"a.txt::2::abc").await.unwrap();

        assert!(matches!(
            terminal(&mut events).await,
            NodeEvent::Failed {
                kind: crate::error::FailureKind::Protocol,
                ..
            }
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_connection_is_silent() {
        let dir = TempDir::new().unwrap();
        let (ctx, bus) = context(&dir, true);
        let mut events = bus.subscribe();
        let (client, server) = duplex(64);
        drop(client);

        handle_incoming(ctx.clone(), server, remote()).await;
        assert!(ctx.registry.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_early_body_buffer_is_bounded() {
        let (mut client, mut server) = duplex(16 * 1024);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let cancel = CancellationToken::new();

        // 远超上限的正文，发送端会被挂起
        let writer = tokio::spawn(async move {
            let _ = client.write_all(&vec![9u8; 1024 * 1024]).await;
            client
        });

        let mut buffered = Vec::new();
        let decided = {
            let wait = wait_for_decision(&mut server, rx, &mut buffered, u64::MAX, &cancel);
            tokio::pin!(wait);
            assert!(
                tokio::time::timeout(Duration::from_millis(200), &mut wait)
                    .await
                    .is_err()
            );
            tx.send(true).unwrap();
            wait.await.unwrap()
        };

        assert_eq!(decided, Some(true));
        assert_eq!(buffered.len(), MAX_EARLY_BODY);
        assert!(!writer.is_finished());
        writer.abort();
    }

    #[tokio::test]
    async fn test_cancel_while_pending() {
        let dir = TempDir::new().unwrap();
        let (ctx, bus) = context(&dir, false);
        let mut events = bus.subscribe();
        let (mut client, server) = duplex(1024);

        let task = tokio::spawn(handle_incoming(ctx.clone(), server, remote()));
        client.write_all(b"a.txt::3::").await.unwrap();
        let id = loop {
            if let NodeEvent::ApprovalRequested { request } = events.recv().await.unwrap() {
                break request.session_id;
            }
        };
        ctx.registry.cancel(id).unwrap();

        assert!(matches!(
            terminal(&mut events).await,
            NodeEvent::Failed {
                kind: crate::error::FailureKind::Cancelled,
                ..
            }
        ));
        task.await.unwrap();
        assert!(ctx.gateway.pending().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
