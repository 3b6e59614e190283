//! Part-10 文件读取
//!
//! 写入器用它识别已有文件的实例，关联客户端用它取出 SOP 类、实例和
//! 传输语法，并按文件的传输语法重新序列化主数据集作为 C-STORE 负载。

use std::path::Path;

use bytes::Bytes;
use courier_core::{CourierError, Result};
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{DefaultDicomObject, OpenFileOptions};
use dicom::transfer_syntax::TransferSyntaxRegistry;

/// 准备发送的实例
#[derive(Debug, Clone)]
pub struct StoredInstance {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax_uid: String,
    /// 按文件传输语法编码的主数据集，不含元信息组
    pub dataset: Bytes,
}

/// 完整读取一个 Part-10 文件
pub fn open(path: &Path) -> Result<DefaultDicomObject> {
    OpenFileOptions::new()
        .open_file(path)
        .map_err(|e| CourierError::Parse(format!("读取 {:?} 失败: {}", path, e)))
}

/// 只读取到像素数据之前，返回元信息中的 SOP 实例 UID
pub fn read_instance_uid(path: &Path) -> Result<String> {
    let obj = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| CourierError::Parse(format!("读取 {:?} 失败: {}", path, e)))?;
    Ok(trim_uid(obj.meta().media_storage_sop_instance_uid()))
}

/// 读取、校验并重新编码主数据集
pub fn load_for_store(path: &Path) -> Result<StoredInstance> {
    let obj = open(path)?;
    verify_consistency(&obj)?;

    let transfer_syntax_uid = trim_uid(obj.meta().transfer_syntax());
    let ts = TransferSyntaxRegistry.get(&transfer_syntax_uid).ok_or_else(|| {
        CourierError::Parse(format!("未知的传输语法 {}", transfer_syntax_uid))
    })?;

    let mut dataset = Vec::new();
    obj.write_dataset_with_ts(&mut dataset, ts)
        .map_err(|e| CourierError::encoding(format!("序列化数据集失败: {}", e)))?;

    Ok(StoredInstance {
        sop_class_uid: trim_uid(obj.meta().media_storage_sop_class_uid()),
        sop_instance_uid: trim_uid(obj.meta().media_storage_sop_instance_uid()),
        transfer_syntax_uid,
        dataset: Bytes::from(dataset),
    })
}

/// 元信息与数据集一致：SOP 类和实例相同，封装传输语法对应封装像素数据
pub fn verify_consistency(obj: &DefaultDicomObject) -> Result<()> {
    let meta = obj.meta();
    let meta_instance = trim_uid(meta.media_storage_sop_instance_uid());
    let dataset_instance = string(obj, tags::SOP_INSTANCE_UID).unwrap_or_default();
    if dataset_instance != meta_instance {
        return Err(CourierError::Parse(format!(
            "元信息实例 {} 与数据集实例 {} 不一致",
            meta_instance, dataset_instance
        )));
    }

    let meta_class = trim_uid(meta.media_storage_sop_class_uid());
    let dataset_class = string(obj, tags::SOP_CLASS_UID).unwrap_or_default();
    if dataset_class != meta_class {
        return Err(CourierError::Parse(format!(
            "元信息SOP类 {} 与数据集SOP类 {} 不一致",
            meta_class, dataset_class
        )));
    }

    let transfer_syntax_uid = trim_uid(meta.transfer_syntax());
    let encapsulated = TransferSyntaxRegistry
        .get(&transfer_syntax_uid)
        .map(|ts| ts.is_encapsulated_pixel_data())
        .unwrap_or(false);
    let fragments = obj
        .element(tags::PIXEL_DATA)
        .ok()
        .map(|element| element.value().fragments().is_some());
    match (encapsulated, fragments) {
        (true, Some(false)) => Err(CourierError::Parse(format!(
            "传输语法 {} 要求封装像素数据",
            transfer_syntax_uid
        ))),
        (false, Some(true)) => Err(CourierError::Parse(format!(
            "传输语法 {} 不允许封装像素数据",
            transfer_syntax_uid
        ))),
        _ => Ok(()),
    }
}

/// 去掉填充的文本值
pub fn string(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_end_matches(['\0', ' ']).to_string())
}

fn trim_uid(uid: &str) -> String {
    uid.trim_end_matches(['\0', ' ']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{DicomEncoder, EncodedObject};
    use crate::jpeg::tests::synthetic_jpeg;
    use crate::transfer_syntax::{sop_class_uids, transfer_syntax_uids};
    use courier_core::config::EncoderConfig;
    use courier_core::{CapturedImage, PatientRecord, StudyContext, StudyDetails, UidGenerator};
    use dicom::object::InMemDicomObject;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn encoded() -> (EncodedObject, Vec<u8>) {
        let uids = Arc::new(UidGenerator::new("1.2.3.4").unwrap());
        let encoder = DicomEncoder::new(EncoderConfig::default(), uids.clone());
        let study = StudyContext::begin(StudyDetails::default(), &uids).unwrap();
        let jpeg = synthetic_jpeg(0xC0, 8, 100, 50, 1);
        let image = CapturedImage::new(jpeg.clone(), 100, 50);
        let object = encoder
            .encode(&PatientRecord::new("Doe^John", "P001"), &study, &image)
            .unwrap();
        (object, jpeg)
    }

    fn write(dir: &tempfile::TempDir, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join("instance.dcm");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_reads_encoder_output() {
        let (object, jpeg) = encoded();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &object.bytes);

        let obj = open(&path).unwrap();
        assert_eq!(string(&obj, tags::PATIENT_NAME).as_deref(), Some("Doe^John"));
        assert_eq!(
            string(&obj, tags::PHOTOMETRIC_INTERPRETATION).as_deref(),
            Some("MONOCHROME2")
        );
        assert!(obj.element(tags::PLANAR_CONFIGURATION).is_err());
        let fragments = obj.element(tags::PIXEL_DATA).unwrap().value().fragments().unwrap();
        assert_eq!(&fragments[0][..jpeg.len()], jpeg.as_slice());
        verify_consistency(&obj).unwrap();

        assert_eq!(read_instance_uid(&path).unwrap(), object.sop_instance_uid);
    }

    #[test]
    fn test_store_payload_is_dataset_without_meta() {
        let (object, _) = encoded();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &object.bytes);

        let instance = load_for_store(&path).unwrap();
        assert_eq!(instance.sop_instance_uid, object.sop_instance_uid);
        assert_eq!(instance.sop_class_uid, sop_class_uids::SECONDARY_CAPTURE);
        assert_eq!(instance.transfer_syntax_uid, transfer_syntax_uids::JPEG_BASELINE);
        // 第一个元素属于 0008 组，没有元信息组
        let dataset = &instance.dataset;
        assert_eq!(u16::from_le_bytes([dataset[0], dataset[1]]), 0x0008);
        assert!(instance.dataset.len() < object.bytes.len());

        // 接收方按同一传输语法能读回数据集
        let ts = TransferSyntaxRegistry.get(transfer_syntax_uids::JPEG_BASELINE).unwrap();
        let received = InMemDicomObject::read_dataset_with_ts(dataset.as_ref(), ts).unwrap();
        let uid = received.element(tags::SOP_INSTANCE_UID).unwrap().to_str().unwrap();
        assert_eq!(uid.trim_end_matches('\0'), object.sop_instance_uid);
    }

    #[test]
    fn test_rejects_non_part10() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open(&write(&dir, b"not dicom")).is_err());

        let mut bytes = vec![0u8; 200];
        bytes[128..132].copy_from_slice(b"DICN");
        assert!(read_instance_uid(&write(&dir, &bytes)).is_err());
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let (object, _) = encoded();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &object.bytes[..object.bytes.len() - 10]);
        assert!(load_for_store(&path).is_err());
    }

    #[test]
    fn test_inconsistent_instance_is_detected() {
        let (object, _) = encoded();
        let mut bytes = object.bytes.to_vec();
        // 改写数据集中 SOP 实例 UID 的最后一位数字
        let uid = object.sop_instance_uid.as_bytes();
        let last = bytes
            .windows(uid.len())
            .rposition(|w| w == uid)
            .unwrap()
            + uid.len()
            - 1;
        bytes[last] = if bytes[last] == b'9' { b'8' } else { b'9' };

        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &bytes);
        let obj = open(&path).unwrap();
        assert!(verify_consistency(&obj).is_err());
        assert!(load_for_store(&path).is_err());
    }
}
