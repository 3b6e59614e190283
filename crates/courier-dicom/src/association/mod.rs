//! DICOM 关联：上层协议、DIMSE 命令集和存储客户端

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use courier_core::Result;

pub mod client;
pub mod dimse;
pub mod pdu;
pub mod state;
pub mod transport;

pub use client::AssociationClient;
pub use dimse::{classify_status, CommandSet, StatusClass};
pub use pdu::{Pdu, PduCodec};
pub use state::{AssociationEvent, AssociationState, AssociationTracker};

/// 永久拒绝的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// 本地文件不可读或不是有效的 Part-10 文件
    LocalFile,
    /// A-ASSOCIATE-RJ (永久)
    AssociationRejected,
    /// 表示上下文未被接受
    ContextNotAccepted,
    /// C-STORE 响应的失败状态
    Status,
}

/// 永久拒绝的详情
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectReason {
    pub kind: RejectKind,
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} ({:#06x}): {}", self.kind, status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// 一次发送的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    /// 成功或警告状态
    Success { status: u16 },
    /// 重试无意义
    Rejected(RejectReason),
    /// 超时、连接失败、PACS 暂时不可用
    TransientFailure(String),
}

/// 投递工作者与关联客户端之间的接口
#[async_trait]
pub trait StoreSender: Send + Sync {
    /// 在一个独立关联中发送文件
    async fn send(&self, path: &Path) -> SendResult;

    /// C-ECHO
    async fn test_connection(&self) -> Result<()>;
}
