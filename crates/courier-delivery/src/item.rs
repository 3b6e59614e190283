//! 队列条目

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use courier_core::CourierError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 条目标识，同时是 `<id>.meta` / `<id>.dcm` 的文件名
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CourierError::config(format!("无效的条目ID {}: {}", s, e)))
    }
}

/// 投递优先级，数值越大越先发送
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Routine,
    High,
    Emergency,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Routine => "routine",
            Self::High => "high",
            Self::Emergency => "emergency",
        };
        f.pad(name)
    }
}

impl FromStr for Priority {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "routine" | "low" => Ok(Self::Routine),
            "high" => Ok(Self::High),
            "emergency" | "stat" => Ok(Self::Emergency),
            other => Err(CourierError::config(format!("未知的优先级: {}", other))),
        }
    }
}

/// 条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// 等待投递 (可能处于退避中)
    Pending,
    /// 被永久拒绝或达到重试上限，等待人工处理
    FailedPermanent,
}

/// 持久化的队列条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub file_path: PathBuf,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// 入队序号，同一时间戳的条目按它保持先进先出
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default = "default_state")]
    pub state: ItemState,
    /// 载荷位于队列目录内，完成或取消时随条目一起处理
    #[serde(default)]
    pub owns_payload: bool,
}

fn default_state() -> ItemState {
    ItemState::Pending
}

impl QueueItem {
    pub fn new(
        id: ItemId,
        file_path: PathBuf,
        priority: Priority,
        now: DateTime<Utc>,
        owns_payload: bool,
    ) -> Self {
        Self {
            id,
            file_path,
            priority,
            created_at: now,
            sequence: 0,
            attempt_count: 0,
            next_attempt_at: now,
            last_error: None,
            state: ItemState::Pending,
            owns_payload,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == ItemState::Pending
    }

    /// 出队顺序键：优先级降序，创建时间升序，再按入队序号
    pub(crate) fn ready_key(&self) -> ReadyKey {
        (
            std::cmp::Reverse(self.priority),
            self.created_at,
            self.sequence,
            self.id,
        )
    }
}

pub(crate) type ReadyKey = (std::cmp::Reverse<Priority>, DateTime<Utc>, u64, ItemId);

/// 一次投递失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// 可重试：超时、连接失败、PACS 忙
    Transient(String),
    /// 重试无意义
    Permanent { status: Option<u16>, reason: String },
}

impl Failure {
    pub fn message(&self) -> String {
        match self {
            Self::Transient(msg) => msg.clone(),
            Self::Permanent {
                status: Some(status),
                reason,
            } => format!("状态 {:#06x}: {}", status, reason),
            Self::Permanent { status: None, reason } => reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Emergency > Priority::High);
        assert!(Priority::High > Priority::Routine);
        assert_eq!("STAT".parse::<Priority>().unwrap(), Priority::Emergency);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_record_json_defaults() {
        let id = ItemId::new();
        let json = format!(
            r#"{{"id":"{}","file_path":"/q/a.dcm","priority":"high",
                "created_at":"2024-01-01T00:00:00Z","next_attempt_at":"2024-01-01T00:00:00Z"}}"#,
            id
        );
        let item: QueueItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.attempt_count, 0);
        assert_eq!(item.sequence, 0);
        assert!(!item.owns_payload);
    }

    #[test]
    fn test_item_id_parse() {
        let id = ItemId::new();
        assert_eq!(id.to_string().parse::<ItemId>().unwrap(), id);
        assert!("not-a-uuid".parse::<ItemId>().is_err());
    }
}
