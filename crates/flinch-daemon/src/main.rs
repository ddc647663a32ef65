//! Flinch Daemon
//!
//! 后台守护进程，负责：
//! - 监听入站传输、执行出站发送
//! - 配对与信任列表
//! - 把配对请求交给外部无线桥接进程
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use anyhow::Result;
use flinch_core::AppSettings;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = AppSettings::load();

    // 桥接 log crate（flinch-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.filter_directive())),
        )
        .try_init();

    tracing::info!("Flinch Daemon starting...");
    tracing::info!("接收目录: {}", settings.download_dir.display());

    let service = service::Service::start(settings).await?;

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(service.clone()));

    // 等待任一任务完成
    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
            service.stop().await;
        }
        () = service.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("收到中断信号");
            service.stop().await;
        }
    }

    let _ = std::fs::remove_file(flinch_core::ipc::socket_path());
    Ok(())
}
