//! Flinch CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信

mod client;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use flinch_core::NodeEvent;
use flinch_core::ipc::{IpcRequest, IpcResponse};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flinch", version, about = "Flinch - 局域网文件互传")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 发送文件（按顺序逐个发送）
    Send {
        /// 要发送的文件路径
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// 目标地址 (ip:port)
        #[arg(short, long, conflicts_with = "peer")]
        to: Option<SocketAddr>,
        /// 已发现设备的 ID
        #[arg(short, long)]
        peer: Option<String>,
    },
    /// 持续打印事件
    Watch,
    /// 列出等待确认的接收请求
    Pending,
    /// 接受接收请求
    Accept { session_id: String },
    /// 拒绝接收请求
    Decline { session_id: String },
    /// 取消会话
    Cancel { session_id: String },
    /// 配对
    #[command(subcommand)]
    Pair(PairCommands),
    /// 列出附近设备
    Peers,
    /// 手动登记一个设备（没有无线发现时使用）
    Announce {
        id: String,
        /// 设备名称
        #[arg(short, long)]
        name: Option<String>,
        /// 设备地址 (ip:port)
        #[arg(short, long)]
        address: Option<String>,
    },
    /// 查看当前状态
    Status,
    /// 停止守护进程
    Stop,
}

#[derive(Subcommand)]
enum PairCommands {
    /// 生成配对码，在对端输入
    Code,
    /// 输入对端显示的配对码
    Enter {
        code: String,
        /// 对端地址 (ip:port)
        target: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Send { files, to, peer } => {
            if to.is_none() && peer.is_none() {
                bail!("需要 --to <ip:port> 或 --peer <id>");
            }
            println!("📤 发送 {} 个文件", files.len());
            let done = client::stream_request(
                IpcRequest::Send {
                    file_paths: files,
                    target: to,
                    peer_id: peer,
                },
                print_line,
            )
            .await?;
            match done {
                Some(IpcResponse::Done { failed, .. }) if failed > 0 => std::process::exit(1),
                Some(_) => {}
                None => bail!("守护进程提前断开"),
            }
        }
        Commands::Watch => {
            println!("👀 等待事件 (Ctrl+C 退出)...");
            client::stream_request(IpcRequest::Subscribe, print_line).await?;
        }
        Commands::Pending => {
            let resp = client::send_request(IpcRequest::Pending).await?;
            if let IpcResponse::Pending { requests } = resp {
                if requests.is_empty() {
                    println!("   没有等待确认的请求");
                }
                for r in requests {
                    println!(
                        "   {}  {} ({} 字节) 来自 {}",
                        r.session_id, r.file_name, r.declared_size, r.remote
                    );
                }
            }
        }
        Commands::Accept { session_id } => {
            client::send_request(IpcRequest::Resolve {
                session_id,
                accept: true,
            })
            .await?;
        }
        Commands::Decline { session_id } => {
            client::send_request(IpcRequest::Resolve {
                session_id,
                accept: false,
            })
            .await?;
        }
        Commands::Cancel { session_id } => {
            client::send_request(IpcRequest::Cancel { session_id }).await?;
        }
        Commands::Pair(PairCommands::Code) => {
            let resp = client::send_request(IpcRequest::PairGenerate).await?;
            if let IpcResponse::Code { code } = resp {
                println!("🔑 配对码: {code}");
                println!("   请在对端输入此配对码");
            }
        }
        Commands::Pair(PairCommands::Enter { code, target }) => {
            println!("🔗 正在与 {target} 配对...");
            let resp = client::send_request(IpcRequest::PairSubmit { code, target }).await?;
            if let IpcResponse::Paired { peer } = resp {
                println!("✅ 已与 {} ({}) 配对", peer.name, peer.address);
            }
        }
        Commands::Peers => {
            let resp = client::send_request(IpcRequest::Peers).await?;
            if let IpcResponse::Peers { peers } = resp {
                if peers.is_empty() {
                    println!("   未发现设备");
                }
                for (i, p) in peers.iter().enumerate() {
                    let addr = p
                        .address
                        .map_or_else(|| "地址未知".to_string(), |a| a.to_string());
                    let mark = if p.paired { " 🔒" } else { "" };
                    println!("   [{i}] {} ({}) {} {addr}{mark}", p.name, p.id, p.platform.name());
                }
            }
        }
        Commands::Announce { id, name, address } => {
            client::send_request(IpcRequest::Sighting {
                id,
                name,
                platform: None,
                address,
                service_data: None,
            })
            .await?;
        }
        Commands::Status => {
            let resp = client::send_request(IpcRequest::Status).await?;
            if let IpcResponse::Status {
                device_id,
                device_name,
                address,
                sessions,
                pending,
                trusted,
                pairing,
            } = resp
            {
                println!("设备: {device_name} ({device_id})");
                match address {
                    Some(a) => println!("监听: {a}"),
                    None => println!("监听: 未启动"),
                }
                println!("待确认: {pending}");
                println!("已信任: {}", trusted.join(", "));
                if let Some(p) = pairing {
                    println!("配对中: {:?} 码 {}", p.role, p.code);
                }
                for s in sessions {
                    println!(
                        "   {} {:?} {} {:?} {}/{}",
                        s.session_id,
                        s.direction,
                        s.file_name,
                        s.state,
                        s.bytes_transferred,
                        s.declared_size
                    );
                }
            }
        }
        Commands::Stop => {
            println!("⏹️  停止守护进程");
            client::send_request(IpcRequest::Stop).await?;
        }
    }

    Ok(())
}

fn print_line(response: &IpcResponse) {
    match response {
        IpcResponse::Event { event } => print_event(event),
        IpcResponse::Error { message } => eprintln!("❌ {message}"),
        IpcResponse::Done { sent, failed } => println!("🏁 完成: 成功 {sent}，失败 {failed}"),
        other => println!("{other:?}"),
    }
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::Listening { address } => println!("📡 监听于 {address}"),
        NodeEvent::ApprovalRequested { request } => println!(
            "📥 {} 想发送 {} ({} 字节)\n   flinch accept {}",
            request.remote, request.file_name, request.declared_size, request.session_id
        ),
        NodeEvent::AutoAccepted {
            file_name, remote, ..
        } => println!("📥 自动接收 {file_name} 来自 {remote}"),
        NodeEvent::ApprovalDiscarded { file_name, .. } => {
            println!("⚠️  发送端已放弃 {file_name}");
        }
        NodeEvent::SessionStarted {
            direction,
            file_name,
            remote,
            ..
        } => println!("▶️  {direction:?} {file_name} ({remote})"),
        NodeEvent::Progress { .. } => {
            if let Some(p) = event.percent() {
                println!("   进度: {p:.1}%");
            }
        }
        NodeEvent::Completed {
            file_name,
            bytes,
            saved_to,
            ..
        } => match saved_to {
            Some(path) => println!("✅ {file_name} ({bytes} 字节) 已保存到 {}", path.display()),
            None => println!("✅ {file_name} ({bytes} 字节) 已发送"),
        },
        NodeEvent::Declined { file_name, .. } => println!("🚫 已拒绝 {file_name}"),
        NodeEvent::Failed {
            file_name,
            kind,
            message,
            ..
        } => eprintln!("❌ {file_name}: {kind:?} {message}"),
        NodeEvent::PairingCodeGenerated { code } => println!("🔑 配对码: {code}"),
        NodeEvent::Paired { name, address, .. } => println!("🔗 已与 {name} ({address}) 配对"),
        NodeEvent::PairingFailed { reason } => eprintln!("❌ 配对失败: {reason}"),
    }
}
