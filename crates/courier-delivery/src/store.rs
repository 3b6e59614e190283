//! 队列目录中的持久化记录
//!
//! 每个条目一个 `<id>.meta` (JSON)，通过原子重命名写入。无法解析的记录
//! 改名为 `.corrupt` 隔离，不阻止其余条目恢复。

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use courier_core::{CourierError, Result};
use courier_storage::{remove_stale_temps, write_record_atomic};
use tokio::fs;
use tracing::{debug, warn};

use crate::item::{ItemId, QueueItem};

const META_EXTENSION: &str = "meta";
const PAYLOAD_EXTENSION: &str = "dcm";
const CORRUPT_EXTENSION: &str = "corrupt";

/// 扫描队列目录的结果
#[derive(Debug, Default)]
pub struct ScanResult {
    pub records: Vec<QueueItem>,
    pub corrupt: Vec<PathBuf>,
    pub orphan_payloads: Vec<PathBuf>,
    pub removed_temps: Vec<PathBuf>,
}

/// 队列目录
#[derive(Debug, Clone)]
pub struct QueueStore {
    dir: PathBuf,
}

impl QueueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_path(&self, id: &ItemId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, META_EXTENSION))
    }

    /// 队列自有载荷的路径
    pub fn payload_path(&self, id: &ItemId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, PAYLOAD_EXTENSION))
    }

    /// 路径是否位于队列目录内
    pub fn contains(&self, path: &Path) -> bool {
        path.parent() == Some(self.dir.as_path())
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            CourierError::storage(format!("创建队列目录 {:?} 失败: {}", self.dir, e))
        })
    }

    pub async fn save(&self, item: &QueueItem) -> Result<()> {
        let json = serde_json::to_vec_pretty(item)?;
        write_record_atomic(self.meta_path(&item.id), &json).await
    }

    pub async fn remove(&self, id: &ItemId) -> Result<()> {
        remove_if_exists(&self.meta_path(id)).await
    }

    /// 读取全部记录；同时清理临时文件、隔离损坏记录、找出孤立载荷
    pub async fn scan(&self) -> Result<ScanResult> {
        self.ensure_dir().await?;
        let mut result = ScanResult {
            removed_temps: remove_stale_temps(&self.dir).await?,
            ..Default::default()
        };

        let mut payloads = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            CourierError::storage(format!("读取队列目录 {:?} 失败: {}", self.dir, e))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(META_EXTENSION) => match self.load_record(&path).await {
                    Ok(item) => result.records.push(item),
                    Err(e) => {
                        warn!(path = ?path, error = %e, "队列记录损坏, 已隔离");
                        result.corrupt.push(self.quarantine(&path).await?);
                    }
                },
                Some(PAYLOAD_EXTENSION) => payloads.push(path),
                _ => {}
            }
        }

        let referenced: HashSet<&Path> =
            result.records.iter().map(|r| r.file_path.as_path()).collect();
        result.orphan_payloads = payloads
            .into_iter()
            .filter(|p| !referenced.contains(p.as_path()))
            .collect();
        result.records.sort_by_key(|r| (r.created_at, r.id));

        debug!(
            records = result.records.len(),
            corrupt = result.corrupt.len(),
            orphans = result.orphan_payloads.len(),
            "队列目录扫描完成"
        );
        Ok(result)
    }

    async fn load_record(&self, path: &Path) -> Result<QueueItem> {
        let bytes = fs::read(path).await?;
        let item: QueueItem = serde_json::from_slice(&bytes)?;
        // 文件名与记录内的ID必须一致
        if self.meta_path(&item.id) != path {
            return Err(CourierError::storage(format!(
                "记录ID {} 与文件名不一致",
                item.id
            )));
        }
        Ok(item)
    }

    async fn quarantine(&self, path: &Path) -> Result<PathBuf> {
        let target = path.with_extension(CORRUPT_EXTENSION);
        fs::rename(path, &target).await.map_err(|e| {
            CourierError::storage(format!("隔离损坏记录 {:?} 失败: {}", path, e))
        })?;
        Ok(target)
    }
}

/// 删除文件，文件不存在不算错误
pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CourierError::storage(format!(
            "删除 {:?} 失败: {}",
            path, e
        ))),
    }
}
