//! 分块传输引擎
//!
//! - 按固定大小的块读写正文
//! - 节流的进度上报
//! - 协作式取消（每次块读写都是一个取消点）
//! - 未完成的输出写在临时文件里，完成后才提升为正式文件

use crate::error::{FlinchError, Result};
use crate::transfer::session::SessionId;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const PARTIAL_SUFFIX: &str = ".flinchpart";

/// 进度节流器
///
/// 第一次有数据时立即上报，之后至多每个 `interval` 上报一次。
/// 达到总量时不上报，由调用方在确认完成后统一上报 100%。
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
    last_reported: u64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            last_reported: 0,
        }
    }

    pub fn should_report(&mut self, transferred: u64, total: u64) -> bool {
        if transferred >= total || transferred <= self.last_reported {
            return false;
        }
        let now = Instant::now();
        let due = self
            .last
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
            self.last_reported = transferred;
        }
        due
    }
}

/// 第 `counter` 个候选名：`name.ext`, `name_1.ext`, `name_2.ext` ...
fn candidate_name(file_name: &str, counter: u32) -> String {
    if counter == 0 {
        return file_name.to_string();
    }
    let original = Path::new(file_name);
    let stem = original
        .file_stem()
        .map_or_else(|| file_name.to_string(), |s| s.to_string_lossy().into_owned());
    match original.extension() {
        Some(ext) => format!("{stem}_{counter}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{counter}"),
    }
}

/// 在目录中占下一个不冲突的名字
///
/// 以 `create_new` 创建空文件占位，已存在的文件（包括其他进程刚创建的）
/// 永远不会被选中。
pub async fn claim_destination(dir: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    let mut counter: u32 = 0;
    loop {
        let candidate = dir.join(candidate_name(file_name, counter));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e),
        }
    }
}

/// 接收目录
///
/// 提交时先原子地占下目标名，再把临时文件重命名到占位文件上。
#[derive(Debug)]
pub struct DestinationDir {
    root: PathBuf,
}

impl DestinationDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 在接收目录中创建临时文件
    pub async fn create_partial(&self, session_id: SessionId) -> Result<PartialFile> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| FlinchError::fs(&self.root, e))?;

        let path = self.root.join(format!(".{session_id}{PARTIAL_SUFFIX}"));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| FlinchError::fs(&path, e))?;

        debug!("Created partial file {}", path.display());
        Ok(PartialFile {
            path,
            file: Some(file),
            written: 0,
            settled: false,
        })
    }

    /// 把完整的临时文件提升为正式文件，返回最终路径
    pub async fn commit(&self, mut partial: PartialFile, file_name: &str) -> Result<PathBuf> {
        if let Err(e) = partial.flush().await {
            partial.discard().await;
            return Err(e);
        }

        let target = match claim_destination(&self.root, file_name).await {
            Ok(target) => target,
            Err(e) => {
                partial.discard().await;
                return Err(FlinchError::fs(&self.root, e));
            }
        };
        // 覆盖的只是自己刚创建的占位文件
        if let Err(e) = fs::rename(&partial.path, &target).await {
            let _ = fs::remove_file(&target).await;
            partial.discard().await;
            return Err(FlinchError::fs(&target, e));
        }
        partial.settled = true;
        Ok(target)
    }
}

/// 正在写入的临时文件
///
/// 没有被提交的临时文件会被删除，不会留下截断的文件。
#[derive(Debug)]
pub struct PartialFile {
    path: PathBuf,
    file: Option<File>,
    written: u64,
    settled: bool,
}

impl PartialFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| FlinchError::fs(&self.path, std::io::Error::other("file closed")))?;
        file.write_all(data)
            .await
            .map_err(|e| FlinchError::fs(&self.path, e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| FlinchError::fs(&self.path, e))?;
            file.sync_all()
                .await
                .map_err(|e| FlinchError::fs(&self.path, e))?;
        }
        Ok(())
    }

    /// 删除临时文件
    pub async fn discard(mut self) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.path).await {
            warn!("Failed to remove partial file {}: {}", self.path.display(), e);
        }
        self.settled = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        // 正常路径都经过 commit 或 discard；这里只在任务被中止时兜底
        if !self.settled {
            self.file.take();
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// 接收正文直到声明的字节数
///
/// `prefix` 是头部之后已经读到的字节。读取时从不越过声明的大小。
pub async fn receive_body<R>(
    reader: &mut R,
    sink: &mut PartialFile,
    prefix: &[u8],
    declared: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u64),
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut received = prefix.len() as u64;
    if received > 0 {
        sink.write(prefix).await?;
        on_progress(received);
    }

    let mut buf = vec![0u8; chunk_size.max(1)];
    while received < declared {
        let remaining = usize::try_from(declared - received).unwrap_or(usize::MAX);
        let want = remaining.min(buf.len());

        let n = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FlinchError::Cancelled),
            read = reader.read(&mut buf[..want]) => read?,
        };
        if n == 0 {
            return Err(FlinchError::IncompleteTransfer {
                received,
                expected: declared,
            });
        }

        sink.write(&buf[..n]).await?;
        received += n as u64;
        on_progress(received);
    }

    Ok(received)
}

/// 发送正文：从 `source` 读取 `total` 字节写入 `writer`
///
/// 每个块写完后以累计字节数回调 `on_progress`，最后一个块除外；
/// 调用方在刷新并关闭写端之后再上报 100%。
pub async fn send_body<R, W>(
    source: &mut R,
    source_path: &Path,
    writer: &mut W,
    total: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u64),
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent: u64 = 0;

    while sent < total {
        let remaining = usize::try_from(total - sent).unwrap_or(usize::MAX);
        let want = remaining.min(buf.len());

        let n = source
            .read(&mut buf[..want])
            .await
            .map_err(|e| FlinchError::fs(source_path, e))?;
        if n == 0 {
            return Err(FlinchError::fs(
                source_path,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("source file shrank after {sent} of {total} bytes"),
                ),
            ));
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FlinchError::Cancelled),
            written = writer.write_all(&buf[..n]) => written?,
        }
        sent += n as u64;

        if sent < total {
            on_progress(sent);
        }
    }

    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_throttle_first_report_immediate() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_report(10, 100));
        assert!(!throttle.should_report(20, 100));
        // 完成由调用方上报
        assert!(!throttle.should_report(100, 100));
    }

    #[test]
    fn test_throttle_zero_interval_monotonic() {
        let mut throttle = ProgressThrottle::new(Duration::ZERO);
        assert!(throttle.should_report(10, 100));
        assert!(!throttle.should_report(10, 100));
        assert!(throttle.should_report(11, 100));
        assert!(!throttle.should_report(5, 100));
    }

    #[tokio::test]
    async fn test_claim_destination() {
        let dir = TempDir::new().unwrap();
        let first = claim_destination(dir.path(), "a.txt").await.unwrap();
        assert_eq!(first, dir.path().join("a.txt"));
        assert!(first.exists());

        let second = claim_destination(dir.path(), "a.txt").await.unwrap();
        assert_eq!(second, dir.path().join("a_1.txt"));

        let third = claim_destination(dir.path(), "a.txt").await.unwrap();
        assert_eq!(third, dir.path().join("a_2.txt"));

        std::fs::write(dir.path().join("README"), b"x").unwrap();
        let bare = claim_destination(dir.path(), "README").await.unwrap();
        assert_eq!(bare, dir.path().join("README_1"));
        assert_eq!(std::fs::read(dir.path().join("README")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_partial_dropped_is_removed() {
        let dir = TempDir::new().unwrap();
        let dest = DestinationDir::new(dir.path());
        let mut partial = dest.create_partial(SessionId::new()).await.unwrap();
        partial.write(b"half").await.unwrap();
        let path = partial.path().to_path_buf();
        assert!(path.exists());

        drop(partial);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_commit_resolves_collision() {
        let dir = TempDir::new().unwrap();
        let dest = DestinationDir::new(dir.path());

        let mut a = dest.create_partial(SessionId::new()).await.unwrap();
        a.write(b"one").await.unwrap();
        let mut b = dest.create_partial(SessionId::new()).await.unwrap();
        b.write(b"two").await.unwrap();

        let path_a = dest.commit(a, "a.txt").await.unwrap();
        let path_b = dest.commit(b, "a.txt").await.unwrap();
        assert_eq!(path_a, dir.path().join("a.txt"));
        assert_eq!(path_b, dir.path().join("a_1.txt"));
        assert_eq!(std::fs::read(path_a).unwrap(), b"one");
        assert_eq!(std::fs::read(path_b).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_commit_never_replaces_foreign_file() {
        let dir = TempDir::new().unwrap();
        let dest = DestinationDir::new(dir.path());
        let mut partial = dest.create_partial(SessionId::new()).await.unwrap();
        partial.write(b"ours").await.unwrap();

        // 其他程序在提交前写下同名文件
        std::fs::write(dir.path().join("report.csv"), b"theirs").unwrap();
        let saved = dest.commit(partial, "report.csv").await.unwrap();

        assert_eq!(saved, dir.path().join("report_1.csv"));
        assert_eq!(std::fs::read(dir.path().join("report.csv")).unwrap(), b"theirs");
        assert_eq!(std::fs::read(saved).unwrap(), b"ours");
    }

    #[tokio::test]
    async fn test_concurrent_commits_get_distinct_names() {
        let dir = TempDir::new().unwrap();
        let dest = std::sync::Arc::new(DestinationDir::new(dir.path()));

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let dest = dest.clone();
            tasks.push(tokio::spawn(async move {
                let mut partial = dest.create_partial(SessionId::new()).await.unwrap();
                partial.write(&[i]).await.unwrap();
                dest.commit(partial, "same.bin").await.unwrap()
            }));
        }
        let mut saved = Vec::new();
        for task in tasks {
            saved.push(task.await.unwrap());
        }
        saved.sort();
        saved.dedup();
        assert_eq!(saved.len(), 8);
        let mut contents: Vec<u8> = saved
            .iter()
            .map(|p| std::fs::read(p).unwrap()[0])
            .collect();
        contents.sort_unstable();
        assert_eq!(contents, (0..8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_receive_body_stops_at_declared() {
        let dir = TempDir::new().unwrap();
        let dest = DestinationDir::new(dir.path());
        let mut partial = dest.create_partial(SessionId::new()).await.unwrap();

        // 多出来的字节不应被读取
        let mut reader: &[u8] = b"cdefEXTRA";
        let mut seen = Vec::new();
        let n = receive_body(
            &mut reader,
            &mut partial,
            b"ab",
            6,
            3,
            &CancellationToken::new(),
            |p| seen.push(p),
        )
        .await
        .unwrap();

        assert_eq!(n, 6);
        assert_eq!(partial.written(), 6);
        assert_eq!(reader, b"EXTRA");
        assert_eq!(seen, vec![2, 5, 6]);
    }

    #[tokio::test]
    async fn test_receive_body_incomplete() {
        let dir = TempDir::new().unwrap();
        let dest = DestinationDir::new(dir.path());
        let mut partial = dest.create_partial(SessionId::new()).await.unwrap();

        let mut reader: &[u8] = b"abc";
        let err = receive_body(
            &mut reader,
            &mut partial,
            &[],
            10,
            4,
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            FlinchError::IncompleteTransfer {
                received: 3,
                expected: 10
            }
        ));
    }

    #[tokio::test]
    async fn test_send_body_progress_excludes_last() {
        let data = vec![7u8; 10];
        let mut source: &[u8] = &data;
        let mut out = Vec::new();
        let mut seen = Vec::new();
        send_body(
            &mut source,
            Path::new("mem"),
            &mut out,
            10,
            4,
            &CancellationToken::new(),
            |p| seen.push(p),
        )
        .await
        .unwrap();

        assert_eq!(out, data);
        assert_eq!(seen, vec![4, 8]);
    }

    #[tokio::test]
    async fn test_send_body_cancelled() {
        let data = vec![1u8; 10];
        let mut source: &[u8] = &data;
        let mut out = Vec::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = send_body(&mut source, Path::new("mem"), &mut out, 10, 4, &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, FlinchError::Cancelled));
        assert!(out.is_empty());
    }
}
