//! IPC Client - 与守护进程通信

use anyhow::{Result, bail};
use flinch_core::ipc::{IpcRequest, IpcResponse, socket_path};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;

async fn connect(request: &IpcRequest) -> Result<Lines<BufReader<OwnedReadHalf>>> {
    let path = socket_path();

    let stream = match UnixStream::connect(&path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ 无法连接到守护进程: {e}");
            eprintln!("   请确保 flinch-daemon 正在运行");
            eprintln!("   运行: cargo xtask dev");
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();

    // 发送请求
    let json = serde_json::to_string(request)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    Ok(BufReader::new(reader).lines())
}

/// 一问一答
pub async fn send_request(request: IpcRequest) -> Result<IpcResponse> {
    let mut lines = connect(&request).await?;

    // 读取响应
    let Some(line) = lines.next_line().await? else {
        bail!("守护进程未返回响应");
    };
    let response: IpcResponse = serde_json::from_str(&line)?;

    match &response {
        IpcResponse::Ok { message } => println!("✅ {message}"),
        IpcResponse::Error { message } => eprintln!("❌ {message}"),
        _ => {}
    }

    Ok(response)
}

/// 流式请求：逐行交给 `on_line`，直到 `done` 或连接关闭
pub async fn stream_request(
    request: IpcRequest,
    mut on_line: impl FnMut(&IpcResponse),
) -> Result<Option<IpcResponse>> {
    let mut lines = connect(&request).await?;

    while let Some(line) = lines.next_line().await? {
        let response: IpcResponse = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("⚠️  无法解析的响应: {e}");
                continue;
            }
        };
        on_line(&response);
        if response.ends_stream() {
            return Ok(Some(response));
        }
    }

    Ok(None)
}
