//! 原子文件写入
//!
//! 数据先写到同目录下的临时文件 `.<文件名>.<uuid>.tmp` 并落盘，再重命名到
//! 目标路径。读者只会看到旧文件或完整的新文件，崩溃最多留下临时文件，
//! 由 [`remove_stale_temps`] 在恢复时清理。

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, PoisonError};

use courier_core::{CourierError, Result};
use courier_dicom::instance;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TEMP_SUFFIX: &str = ".tmp";

/// 进程内每个目标路径一把锁，`write_atomic` 的检查与重命名在锁内完成
static PATH_LOCKS: LazyLock<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| std::sync::Mutex::new(HashMap::new()));

/// 写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 目标原先不存在
    Created,
    /// 同一实例的内容被替换
    Replaced,
    /// 已存在完全相同的文件
    Unchanged,
}

/// 两阶段写入：`prepare` 落盘临时文件，`commit` 重命名。
/// 未提交就被丢弃时删除临时文件。
#[derive(Debug)]
pub struct StagedWrite {
    temp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    pub async fn prepare(target: impl AsRef<Path>, bytes: &[u8]) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        let parent = parent_dir(&target);
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| storage_error("创建目录", &parent, e))?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CourierError::storage(format!("无效的目标路径: {:?}", target)))?;
        let temp_path = parent.join(format!(".{}.{}{}", file_name, Uuid::new_v4(), TEMP_SUFFIX));

        // 先构造守卫，写入失败时由 Drop 删除临时文件
        let staged = Self {
            temp_path,
            target,
            committed: false,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged.temp_path)
            .await
            .map_err(|e| storage_error("创建临时文件", &staged.temp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| storage_error("写入临时文件", &staged.temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_error("同步临时文件", &staged.temp_path, e))?;

        debug!(temp = ?staged.temp_path, size = bytes.len(), "临时文件已落盘");
        Ok(staged)
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// 重命名到目标路径并同步父目录
    pub async fn commit(mut self) -> Result<PathBuf> {
        fs::rename(&self.temp_path, &self.target)
            .await
            .map_err(|e| storage_error("重命名", &self.target, e))?;
        self.committed = true;
        sync_dir(&parent_dir(&self.target)).await?;
        Ok(self.target.clone())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.temp_path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(temp = ?self.temp_path, error = %e, "删除临时文件失败");
                }
            }
        }
    }
}

/// 原子写入 Part-10 文件
///
/// 目标已存在时按 SOP 实例 UID 处理：内容相同返回 `Unchanged`，同一实例的
/// 不同内容原子替换，不同实例 (或无法识别的文件) 返回 `NameCollision`。
///
/// 同一进程内对同一路径的调用串行执行，检查和重命名之间不会被另一个
/// 写入者插入。锁不跨进程：另一个进程在检查之后写入同一路径仍可能被覆盖，
/// 队列目录只应由一个进程使用。
pub async fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> Result<WriteOutcome> {
    let path = path.as_ref();
    let lock = path_lock(path);
    let _guard = lock.lock().await;

    // 先落盘临时文件再解析；解析失败时守卫删除临时文件
    let staged = StagedWrite::prepare(path, bytes).await?;
    let incoming_uid = instance_uid(staged.temp_path()).await?;

    let outcome = match fs::read(path).await {
        Ok(existing) if existing == bytes => {
            debug!(path = ?path, "文件内容未变化");
            return Ok(WriteOutcome::Unchanged);
        }
        Ok(_) => {
            let existing_uid = instance_uid(path)
                .await
                .unwrap_or_else(|_| "<无法识别>".to_string());
            if existing_uid != incoming_uid {
                return Err(CourierError::NameCollision {
                    path: path.to_path_buf(),
                    existing: existing_uid,
                    incoming: incoming_uid,
                });
            }
            WriteOutcome::Replaced
        }
        Err(e) if e.kind() == ErrorKind::NotFound => WriteOutcome::Created,
        Err(e) => return Err(storage_error("读取已有文件", path, e)),
    };

    staged.commit().await?;
    info!(
        path = ?path,
        sop_instance_uid = %incoming_uid,
        outcome = ?outcome,
        "DICOM 文件已写入"
    );
    Ok(outcome)
}

fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = PATH_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    // 没有其他持有者的锁可以丢弃
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    locks.entry(path.to_path_buf()).or_default().clone()
}

/// 在阻塞线程池上读取文件的 SOP 实例 UID
async fn instance_uid(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || instance::read_instance_uid(&path))
        .await
        .map_err(|e| CourierError::Internal(format!("解析任务失败: {}", e)))?
}

/// 原子写入任意记录 (队列元数据)，不做内容检查
pub async fn write_record_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    StagedWrite::prepare(path, bytes).await?.commit().await?;
    Ok(())
}

/// 是否为本模块产生的临时文件
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

/// 删除目录中崩溃遗留的临时文件，返回删除的路径
pub async fn remove_stale_temps(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut removed = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(storage_error("读取目录", dir, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| storage_error("读取目录", dir, e))?
    {
        let path = entry.path();
        if !is_temp_file(&path) {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = ?path, "删除遗留临时文件");
                removed.push(path);
            }
            Err(e) => warn!(path = ?path, error = %e, "删除遗留临时文件失败"),
        }
    }
    Ok(removed)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    let handle = fs::File::open(dir)
        .await
        .map_err(|e| storage_error("打开目录", dir, e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| storage_error("同步目录", dir, e))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> CourierError {
    CourierError::storage(format!("{} {:?} 失败: {}", action, path, err))
}
