//! # Capture Courier
//!
//! 把采集到的静态图像编码为 DICOM Secondary Capture 对象，原子落盘后
//! 放入持久化队列，由后台工作者可靠地投递到 PACS。
//!
//! 各层的实现位于独立的 crate 中，这里只负责组装：
//!
//! - `courier-core`: 配置、错误、数据模型
//! - `courier-dicom`: 编码器与关联客户端
//! - `courier-storage`: 原子文件写入
//! - `courier-delivery`: 投递队列与工作者

pub mod service;

pub use courier_core::{
    CapturedImage, CourierConfig, CourierError, ErrorClass, PatientRecord, Result, Sex,
    StudyContext, StudyDetails,
};
pub use courier_delivery::{ItemId, Priority, QueueEvent, QueueSnapshot, RecoveryReport};
pub use courier_storage::WriteOutcome;
pub use service::{CaptureReceipt, CaptureService};
