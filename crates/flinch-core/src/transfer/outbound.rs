//! 出站会话状态机
//!
//! `Connecting -> AwaitingResponse -> Streaming -> Completed`；
//! 收到 `DECLINE::` 或连接出错时不发送正文，直接失败。

use crate::error::{FlinchError, Result};
use crate::events::NodeEvent;
use crate::transfer::SessionContext;
use crate::transfer::chunked::send_body;
use crate::transfer::protocol::{Header, ProtocolError, Response};
use crate::transfer::session::{Direction, SessionId, SessionState};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// 应答令牌最长 `DECLINE::`，一次读一小段即可
const RESPONSE_READ_SIZE: usize = 16;

/// 已经准备好的出站任务（文件已打开，头部已校验）
pub struct OutgoingFile {
    pub session_id: SessionId,
    pub path: PathBuf,
    pub header: Header,
    pub source: File,
    pub target: SocketAddr,
}

/// 驱动一个出站会话直到终态，返回发送的字节数
pub async fn run_outgoing(
    ctx: Arc<SessionContext>,
    file: OutgoingFile,
    cancel: CancellationToken,
) -> Result<u64> {
    let session_id = file.session_id;
    let file_name = file.header.file_name.clone();
    let target = file.target;

    ctx.emit(
        session_id,
        NodeEvent::SessionStarted {
            session_id,
            direction: Direction::Outgoing,
            file_name: file_name.clone(),
            declared_size: file.header.size,
            remote: target,
        },
    );

    let result = match connect(target, &ctx, &cancel).await {
        Ok(mut stream) => {
            let result = transfer(&ctx, file, &mut stream, &cancel).await;
            let _ = stream.shutdown().await;
            result
        }
        Err(e) => Err(e),
    };

    match &result {
        Ok(bytes) => {
            info!("Sent '{}' ({} bytes) to {}", file_name, bytes, target);
            ctx.finish(
                session_id,
                SessionState::Completed,
                Some(NodeEvent::Completed {
                    session_id,
                    direction: Direction::Outgoing,
                    file_name,
                    bytes: *bytes,
                    saved_to: None,
                }),
            );
        }
        Err(e) => {
            warn!("Sending '{}' to {} failed: {}", file_name, target, e);
            ctx.finish(
                session_id,
                SessionState::Failed,
                Some(NodeEvent::Failed {
                    session_id,
                    direction: Direction::Outgoing,
                    file_name,
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            );
        }
    }
    result
}

async fn connect(
    target: SocketAddr,
    ctx: &SessionContext,
    cancel: &CancellationToken,
) -> Result<TcpStream> {
    debug!("Connecting to {}", target);
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(FlinchError::Cancelled),
        connected = tokio::time::timeout(ctx.connect_timeout, TcpStream::connect(target)) => {
            match connected {
                Ok(stream) => Ok(stream?),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {target} timed out"),
                )
                .into()),
            }
        }
    }
}

/// 头部、应答、正文
pub(crate) async fn transfer<S>(
    ctx: &SessionContext,
    mut file: OutgoingFile,
    stream: &mut S,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session_id = file.session_id;
    let total = file.header.size;

    ctx.registry
        .update(session_id, |info| info.state = SessionState::AwaitingResponse);
    stream.write_all(&file.header.encode()).await?;
    stream.flush().await?;

    match read_response(stream, cancel).await? {
        Response::Accept => {}
        Response::Decline => return Err(FlinchError::Declined),
    }

    ctx.registry
        .update(session_id, |info| info.state = SessionState::Streaming);
    send_body(
        &mut file.source,
        &file.path,
        stream,
        total,
        ctx.chunk_size,
        cancel,
        |sent| {
            ctx.registry
                .update(session_id, |info| info.bytes_transferred = sent);
            ctx.emit(
                session_id,
                NodeEvent::Progress {
                    session_id,
                    direction: Direction::Outgoing,
                    transferred: sent,
                    total,
                },
            );
        },
    )
    .await?;
    stream.shutdown().await?;

    ctx.registry
        .update(session_id, |info| info.bytes_transferred = total);
    ctx.emit(
        session_id,
        NodeEvent::Progress {
            session_id,
            direction: Direction::Outgoing,
            transferred: total,
            total,
        },
    );
    Ok(total)
}

async fn read_response<S>(stream: &mut S, cancel: &CancellationToken) -> Result<Response>
where
    S: AsyncRead + Unpin,
{
    let mut received = Vec::with_capacity(RESPONSE_READ_SIZE);
    let mut buf = [0u8; RESPONSE_READ_SIZE];
    loop {
        let n = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FlinchError::Cancelled),
            read = stream.read(&mut buf) => read?,
        };
        if n == 0 {
            return Err(ProtocolError::MissingResponse.into());
        }
        received.extend_from_slice(&buf[..n]);
        if let Some(response) = Response::parse(&received)? {
            return Ok(response);
        }
    }
}
