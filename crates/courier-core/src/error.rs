//! 错误定义模块
//!
//! 错误按处理策略分类：编码错误与存储错误只对当前采集致命，
//! 只有网络瞬时错误进入投递队列的退避重试。

use std::path::PathBuf;
use thiserror::Error;

/// 采集投递系统统一错误类型
#[derive(Error, Debug)]
pub enum CourierError {
    #[error("不支持的图像格式: {0}")]
    UnsupportedImage(String),

    #[error("数据集不完整, 缺少必需属性: {0}")]
    IncompleteDataset(String),

    #[error("DICOM编码错误: {0}")]
    Encoding(String),

    #[error("DICOM解析错误: {0}")]
    Parse(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("文件名冲突: {path:?} 已存在实例 {existing}, 拒绝写入实例 {incoming}")]
    NameCollision {
        path: PathBuf,
        existing: String,
        incoming: String,
    },

    #[error("网络瞬时错误: {0}")]
    TransientNetwork(String),

    #[error("PACS永久拒绝 (状态 {status:#06x}): {reason}")]
    PermanentRejection { status: u16, reason: String },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("系统内部错误: {0}")]
    Internal(String),
}

/// 错误类别，决定错误的传播与重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 输入或数据集问题，重试无意义，立即反馈给操作员
    Encoding,
    /// 磁盘问题（空间不足、权限等），对该文件致命
    Storage,
    /// 超时、连接拒绝、PACS忙，由投递队列退避重试
    TransientNetwork,
    /// PACS明确拒绝（一致性问题），单独上报，条目保留
    PermanentRejection,
    Configuration,
    Internal,
}

impl CourierError {
    /// 获取错误类别
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnsupportedImage(_)
            | Self::IncompleteDataset(_)
            | Self::Encoding(_)
            | Self::Parse(_) => ErrorClass::Encoding,
            Self::Storage(_)
            | Self::Io(_)
            | Self::NameCollision { .. }
            | Self::Serialization(_)
            | Self::NotFound(_) => ErrorClass::Storage,
            Self::TransientNetwork(_) => ErrorClass::TransientNetwork,
            Self::PermanentRejection { .. } => ErrorClass::PermanentRejection,
            Self::Config(_) => ErrorClass::Configuration,
            Self::InvalidStateTransition { .. } | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// 只有网络瞬时错误可以重试
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientNetwork
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, CourierError>;
