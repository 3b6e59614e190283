//! DICOM 传输语法与 UID 常量
//!
//! 传输语法的属性 (显式VR、是否封装) 查询 `dicom::transfer_syntax::TransferSyntaxRegistry`。

/// 常用的传输语法 UID 常量
pub mod transfer_syntax_uids {
    /// 隐式VR Little Endian (DIMSE 命令集)
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

    /// 显式VR Little Endian (文件元信息组)
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

    /// JPEG Baseline (Process 1)
    pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
}

/// SOP 类 UID 常量
pub mod sop_class_uids {
    /// Verification (C-ECHO)
    pub const VERIFICATION: &str = "1.2.840.10008.1.1";

    /// Secondary Capture Image Storage
    pub const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";
}

/// DICOM 应用上下文名
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";
