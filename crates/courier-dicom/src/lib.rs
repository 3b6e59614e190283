//! # Courier DICOM
//!
//! Secondary Capture 对象的编码、Part-10 读取，以及向 PACS 发送的关联客户端。

pub mod association;
pub mod encoder;
pub mod instance;
pub mod jpeg;
pub mod pixel;
pub mod transfer_syntax;

pub use association::{
    AssociationClient, RejectKind, RejectReason, SendResult, StoreSender,
};
pub use encoder::{DicomEncoder, EncodedObject};
pub use instance::StoredInstance;
pub use transfer_syntax::{sop_class_uids, transfer_syntax_uids};
