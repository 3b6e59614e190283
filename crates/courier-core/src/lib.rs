//! # Courier Core
//!
//! 采集投递系统的核心模块，提供数据模型、错误定义、配置和UID生成。

pub mod config;
pub mod error;
pub mod models;
pub mod utils;

pub use config::{CourierConfig, EncoderConfig, LoggingConfig, PacsNodeConfig, QueueConfig};
pub use error::{CourierError, ErrorClass, Result};
pub use models::*;
pub use utils::UidGenerator;
