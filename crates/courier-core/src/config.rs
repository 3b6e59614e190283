//! 配置管理
//!
//! 配置由外部提供：可选的 TOML 文件，再叠加 `COURIER_` 前缀的环境变量
//! (分隔符 `__`，如 `COURIER_PACS__HOST=10.0.0.5`)。

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::{is_valid_dicom_uid, UidGenerator};
use crate::{CourierError, Result};

/// 系统完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub pacs: PacsNodeConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 远端 PACS 节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacsNodeConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 本端 AE 标题
    #[serde(default = "default_calling_ae")]
    pub calling_ae_title: String,
    /// 远端 AE 标题
    #[serde(default = "default_called_ae")]
    pub called_ae_title: String,
    /// 关联建立加存储的总超时 (秒)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 是否用 TLS 包装 TCP 连接
    #[serde(default)]
    pub tls: bool,
    /// 本端可接收的最大 PDU 长度
    #[serde(default = "default_max_pdu")]
    pub max_pdu_length: u32,
}

/// 投递队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 队列目录，存放 `<id>.dcm` 和 `<id>.meta`
    #[serde(default = "default_queue_dir")]
    pub dir: PathBuf,
    /// 退避基准间隔 (毫秒)
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// 退避指数上限
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: u32,
    /// 最大尝试次数，达到后条目转为永久失败；为空表示无限重试
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// 投递成功后的归档目录；为空时直接删除队列内的载荷文件
    #[serde(default)]
    pub sent_dir: Option<PathBuf>,
}

/// DICOM 编码配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// 机构 UID 根
    #[serde(default = "default_uid_root")]
    pub uid_root: String,
    #[serde(default = "default_implementation_class_uid")]
    pub implementation_class_uid: String,
    #[serde(default = "default_implementation_version_name")]
    pub implementation_version_name: String,
    #[serde(default = "default_modality")]
    pub modality: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub station_name: Option<String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for PacsNodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_port(),
            calling_ae_title: default_calling_ae(),
            called_ae_title: default_called_ae(),
            timeout_secs: default_timeout_secs(),
            tls: false,
            max_pdu_length: default_max_pdu(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: default_queue_dir(),
            base_backoff_ms: default_base_backoff_ms(),
            backoff_cap: default_backoff_cap(),
            max_attempts: None,
            sent_dir: None,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            uid_root: default_uid_root(),
            implementation_class_uid: default_implementation_class_uid(),
            implementation_version_name: default_implementation_version_name(),
            modality: default_modality(),
            manufacturer: None,
            station_name: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CourierConfig {
    /// 加载配置：文件可选，环境变量优先
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!("加载配置文件: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(Environment::with_prefix("COURIER").separator("__"))
            .build()
            .map_err(|e| CourierError::config(format!("读取配置失败: {}", e)))?;

        let config: CourierConfig = settings
            .try_deserialize()
            .map_err(|e| CourierError::config(format!("配置反序列化失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        self.pacs.validate()?;
        self.queue.validate()?;
        self.encoder.validate()?;
        Ok(())
    }
}

impl PacsNodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        validate_ae_title("calling_ae_title", &self.calling_ae_title)?;
        validate_ae_title("called_ae_title", &self.called_ae_title)?;

        if self.host.trim().is_empty() {
            return Err(CourierError::config("PACS主机不能为空"));
        }
        if self.port == 0 {
            return Err(CourierError::config("PACS端口必须大于0"));
        }
        if self.timeout_secs == 0 {
            return Err(CourierError::config("超时必须大于0秒"));
        }
        if !(4096..=1_048_576).contains(&self.max_pdu_length) {
            return Err(CourierError::config(
                "最大PDU长度必须在 4096 到 1048576 字节之间",
            ));
        }
        Ok(())
    }
}

impl QueueConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_backoff_ms == 0 {
            return Err(CourierError::config("退避基准间隔必须大于0"));
        }
        if self.backoff_cap > 20 {
            return Err(CourierError::config("退避指数上限不能超过20"));
        }
        if self.max_attempts == Some(0) {
            return Err(CourierError::config("最大尝试次数必须大于0"));
        }
        Ok(())
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        UidGenerator::new(self.uid_root.clone())?;
        if !is_valid_dicom_uid(&self.implementation_class_uid) {
            return Err(CourierError::config(format!(
                "无效的实现类UID: {}",
                self.implementation_class_uid
            )));
        }
        if self.implementation_version_name.is_empty()
            || self.implementation_version_name.len() > 16
        {
            return Err(CourierError::config("实现版本名必须为1-16个字符"));
        }
        if self.modality.is_empty() || self.modality.len() > 16 {
            return Err(CourierError::config("模态必须为1-16个字符"));
        }
        Ok(())
    }
}

/// AE 标题: 1-16 个可打印 ASCII 字符，不含反斜杠，不能全为空格
pub fn validate_ae_title(field: &str, ae_title: &str) -> Result<()> {
    let valid = !ae_title.trim().is_empty()
        && ae_title.len() <= 16
        && ae_title
            .bytes()
            .all(|b| (0x20..0x7f).contains(&b) && b != b'\\');
    if valid {
        Ok(())
    } else {
        Err(CourierError::config(format!(
            "{} 必须为1-16个可打印ASCII字符: {:?}",
            field, ae_title
        )))
    }
}

fn default_port() -> u16 {
    104
}

fn default_calling_ae() -> String {
    "CAPTURE_SCU".to_string()
}

fn default_called_ae() -> String {
    "PACS".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_pdu() -> u32 {
    16384
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from("./data/queue")
}

fn default_base_backoff_ms() -> u64 {
    5_000
}

fn default_backoff_cap() -> u32 {
    6
}

fn default_uid_root() -> String {
    "1.2.826.0.1.3680043.9.7382".to_string()
}

fn default_implementation_class_uid() -> String {
    "1.2.826.0.1.3680043.9.7382.1.1".to_string()
}

fn default_implementation_version_name() -> String {
    concat!("COURIER_", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_modality() -> String {
    "OT".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
