//! 通用工具函数

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::{CourierError, Result};

/// DICOM UID 最大长度
pub const MAX_UID_LENGTH: usize = 64;

/// 生成部分 (`.<毫秒>.<进程号>.<计数>`) 预留的最大长度
const GENERATED_SUFFIX_MAX: usize = 1 + 13 + 1 + 10 + 1 + 12;

/// DICOM UID 生成器
///
/// 格式为 `root.<unix毫秒>.<进程号>.<计数>`。计数器在进程内单调递增，
/// 因此同一毫秒内生成的UID也互不相同；不同进程由进程号区分。
#[derive(Debug)]
pub struct UidGenerator {
    root: String,
    counter: AtomicU64,
}

impl UidGenerator {
    pub fn new(root: impl Into<String>) -> Result<Self> {
        let root = root.into();
        if !is_valid_dicom_uid(&root) {
            return Err(CourierError::config(format!("无效的UID根: {}", root)));
        }
        if root.len() + GENERATED_SUFFIX_MAX > MAX_UID_LENGTH {
            return Err(CourierError::config(format!(
                "UID根过长 ({} 字符), 最多 {} 字符",
                root.len(),
                MAX_UID_LENGTH - GENERATED_SUFFIX_MAX
            )));
        }
        Ok(Self {
            root,
            counter: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// 生成新的UID
    pub fn generate(&self) -> Result<String> {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis().max(1);
        let uid = format!("{}.{}.{}.{}", self.root, millis, std::process::id().max(1), seq);

        if !is_valid_dicom_uid(&uid) {
            return Err(CourierError::Internal(format!("生成的UID无效: {}", uid)));
        }
        Ok(uid)
    }
}

/// 验证DICOM UID格式
///
/// 只允许数字和点，总长不超过64，组件非空且没有前导零。
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > MAX_UID_LENGTH {
        return false;
    }
    uid.split('.').all(|component| {
        !component.is_empty()
            && component.bytes().all(|b| b.is_ascii_digit())
            && (component == "0" || !component.starts_with('0'))
    })
}
