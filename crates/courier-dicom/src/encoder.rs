//! Secondary Capture 数据集编码器
//!
//! 把患者信息、检查上下文和一帧 JPEG 组装成 `InMemDicomObject`，像素数据
//! 以单帧封装序列存放，再配上文件元信息，整体序列化为 Part-10 字节
//! (128 字节前导、`DICM`、元信息组和 JPEG Baseline 下的主数据集)。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Local;
use courier_core::config::EncoderConfig;
use courier_core::utils::is_valid_dicom_uid;
use courier_core::{CapturedImage, CourierError, PatientRecord, Result, StudyContext, UidGenerator};
use dicom::core::value::Value;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::{FileMetaTable, FileMetaTableBuilder, InMemDicomObject};
use tracing::{debug, info};

use crate::jpeg::{self, JpegFrameInfo};
use crate::pixel;
use crate::transfer_syntax::{sop_class_uids, transfer_syntax_uids};

/// Part-10 前导长度
pub const PREAMBLE_LENGTH: usize = 128;

/// 缺失或为空时拒绝编码的属性
const REQUIRED_ATTRIBUTES: &[(Tag, &str)] = &[
    (tags::SOP_CLASS_UID, "SOPClassUID"),
    (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
    (tags::STUDY_DATE, "StudyDate"),
    (tags::STUDY_TIME, "StudyTime"),
    (tags::MODALITY, "Modality"),
    (tags::PATIENT_NAME, "PatientName"),
    (tags::PATIENT_ID, "PatientID"),
    (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
    (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
    (tags::SAMPLES_PER_PIXEL, "SamplesPerPixel"),
    (tags::PHOTOMETRIC_INTERPRETATION, "PhotometricInterpretation"),
    (tags::ROWS, "Rows"),
    (tags::COLUMNS, "Columns"),
    (tags::BITS_ALLOCATED, "BitsAllocated"),
    (tags::BITS_STORED, "BitsStored"),
    (tags::HIGH_BIT, "HighBit"),
    (tags::PIXEL_REPRESENTATION, "PixelRepresentation"),
    (tags::PIXEL_DATA, "PixelData"),
];

/// 编码结果
#[derive(Debug, Clone)]
pub struct EncodedObject {
    /// 完整的 Part-10 字节
    pub bytes: Bytes,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub transfer_syntax_uid: String,
}

/// Secondary Capture 编码器
pub struct DicomEncoder {
    config: EncoderConfig,
    uids: Arc<UidGenerator>,
    source_ae_title: Option<String>,
    instance_counter: AtomicU32,
}

impl DicomEncoder {
    pub fn new(config: EncoderConfig, uids: Arc<UidGenerator>) -> Self {
        Self {
            config,
            uids,
            source_ae_title: None,
            instance_counter: AtomicU32::new(1),
        }
    }

    /// 写入 (0002,0016) 的本端 AE 标题
    pub fn with_source_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.source_ae_title = Some(ae_title.into());
        self
    }

    /// 编码一帧采集图像，每次调用分配新的 SOP 实例 UID
    pub fn encode(
        &self,
        patient: &PatientRecord,
        study: &StudyContext,
        image: &CapturedImage,
    ) -> Result<EncodedObject> {
        let frame = jpeg::inspect(&image.data)?;
        if frame.width != image.width || frame.height != image.height {
            return Err(CourierError::UnsupportedImage(format!(
                "声明尺寸 {}x{} 与 JPEG 帧头 {}x{} 不一致",
                image.width, image.height, frame.width, frame.height
            )));
        }

        let sop_instance_uid = self.uids.generate()?;
        let dataset = self.build_dataset(patient, study, image, &frame, &sop_instance_uid)?;
        check_required(&dataset, &frame)?;

        let file = dataset.with_exact_meta(self.build_meta(&sop_instance_uid)?);
        let mut buf = Vec::with_capacity(PREAMBLE_LENGTH + image.data.len() + 2048);
        file.write_all(&mut buf)
            .map_err(|e| CourierError::encoding(format!("序列化 Part-10 文件失败: {}", e)))?;

        info!(
            sop_instance_uid = %sop_instance_uid,
            study_instance_uid = %study.study_instance_uid(),
            size = buf.len(),
            "DICOM 对象编码完成"
        );

        Ok(EncodedObject {
            bytes: Bytes::from(buf),
            sop_class_uid: sop_class_uids::SECONDARY_CAPTURE.to_string(),
            sop_instance_uid,
            study_instance_uid: study.study_instance_uid().to_string(),
            series_instance_uid: study.series_instance_uid().to_string(),
            transfer_syntax_uid: transfer_syntax_uids::JPEG_BASELINE.to_string(),
        })
    }

    /// 文件元信息组，(0002,0000) 组长度由构建器计算
    fn build_meta(&self, sop_instance_uid: &str) -> Result<FileMetaTable> {
        check_text(
            tags::IMPLEMENTATION_CLASS_UID,
            VR::UI,
            &self.config.implementation_class_uid,
        )?;
        check_text(
            tags::IMPLEMENTATION_VERSION_NAME,
            VR::SH,
            &self.config.implementation_version_name,
        )?;

        let mut builder = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(sop_class_uids::SECONDARY_CAPTURE)
            .media_storage_sop_instance_uid(sop_instance_uid)
            .transfer_syntax(transfer_syntax_uids::JPEG_BASELINE)
            .implementation_class_uid(self.config.implementation_class_uid.as_str())
            .implementation_version_name(self.config.implementation_version_name.as_str());
        if let Some(ae_title) = &self.source_ae_title {
            check_text(tags::SOURCE_APPLICATION_ENTITY_TITLE, VR::AE, ae_title)?;
            builder = builder.source_application_entity_title(ae_title.as_str());
        }

        builder
            .build()
            .map_err(|e| CourierError::encoding(format!("构建文件元信息失败: {}", e)))
    }

    fn build_dataset(
        &self,
        patient: &PatientRecord,
        study: &StudyContext,
        image: &CapturedImage,
        frame: &JpegFrameInfo,
        sop_instance_uid: &str,
    ) -> Result<InMemDicomObject> {
        let details = study.details();
        let started_at = study.started_at();
        let now = Local::now();
        let instance_number = self.instance_counter.fetch_add(1, Ordering::Relaxed);

        let mut texts: Vec<(Tag, VR, String)> = vec![
            (tags::STUDY_DATE, VR::DA, started_at.format("%Y%m%d").to_string()),
            (tags::SERIES_DATE, VR::DA, started_at.format("%Y%m%d").to_string()),
            (tags::CONTENT_DATE, VR::DA, now.format("%Y%m%d").to_string()),
            (tags::STUDY_TIME, VR::TM, started_at.format("%H%M%S").to_string()),
            (tags::CONTENT_TIME, VR::TM, now.format("%H%M%S").to_string()),
            (tags::MODALITY, VR::CS, self.config.modality.clone()),
            (tags::CONVERSION_TYPE, VR::CS, "WSD".to_string()),
            (tags::PATIENT_NAME, VR::PN, patient.name.clone()),
            (tags::PATIENT_ID, VR::LO, patient.patient_id.clone()),
            (
                tags::PATIENT_BIRTH_DATE,
                VR::DA,
                patient
                    .birth_date
                    .map(|d| d.format("%Y%m%d").to_string())
                    .unwrap_or_default(),
            ),
            (
                tags::PATIENT_SEX,
                VR::CS,
                patient.sex.map(|s| s.dicom_code().to_string()).unwrap_or_default(),
            ),
            (
                tags::ACCESSION_NUMBER,
                VR::SH,
                details.accession_number.clone().unwrap_or_default(),
            ),
            (
                tags::REFERRING_PHYSICIAN_NAME,
                VR::PN,
                details.referring_physician.clone().unwrap_or_default(),
            ),
            (tags::STUDY_ID, VR::SH, String::new()),
            (tags::PATIENT_ORIENTATION, VR::CS, String::new()),
            (tags::SERIES_NUMBER, VR::IS, "1".to_string()),
            (tags::INSTANCE_NUMBER, VR::IS, instance_number.to_string()),
            (
                tags::PHOTOMETRIC_INTERPRETATION,
                VR::CS,
                frame.color.photometric_interpretation().to_string(),
            ),
            (tags::LOSSY_IMAGE_COMPRESSION, VR::CS, "01".to_string()),
            (
                tags::LOSSY_IMAGE_COMPRESSION_METHOD,
                VR::CS,
                "ISO_10918_1".to_string(),
            ),
            (tags::SOP_CLASS_UID, VR::UI, sop_class_uids::SECONDARY_CAPTURE.to_string()),
            (tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid.to_string()),
            (
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                study.study_instance_uid().to_string(),
            ),
            (
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                study.series_instance_uid().to_string(),
            ),
        ];

        let optional = [
            (tags::STUDY_DESCRIPTION, VR::LO, &details.study_description),
            (
                tags::PERFORMING_PHYSICIAN_NAME,
                VR::PN,
                &details.performing_physician,
            ),
            (tags::INSTITUTION_NAME, VR::LO, &details.institution),
            (tags::MANUFACTURER, VR::LO, &self.config.manufacturer),
            (tags::STATION_NAME, VR::SH, &self.config.station_name),
        ];
        for (tag, vr, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                texts.push((tag, vr, value.to_string()));
            }
        }

        let mut dataset = InMemDicomObject::new_empty();
        if texts.iter().any(|(_, _, value)| !value.is_ascii()) {
            dataset.put(DataElement::new(
                tags::SPECIFIC_CHARACTER_SET,
                VR::CS,
                PrimitiveValue::from("ISO_IR 192"),
            ));
        }
        for (tag, vr, value) in texts {
            check_text(tag, vr, &value)?;
            dataset.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        }

        let samples = frame.color.samples_per_pixel();
        let mut image_pixel = vec![
            (tags::SAMPLES_PER_PIXEL, samples),
            (tags::ROWS, frame.height),
            (tags::COLUMNS, frame.width),
            (tags::BITS_ALLOCATED, 8),
            (tags::BITS_STORED, 8),
            (tags::HIGH_BIT, 7),
            (tags::PIXEL_REPRESENTATION, 0),
        ];
        if samples > 1 {
            image_pixel.push((tags::PLANAR_CONFIGURATION, 0));
        }
        for (tag, value) in image_pixel {
            dataset.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
        }

        dataset.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            Value::PixelSequence(pixel::single_frame(&image.data[..frame.length])),
        ));

        debug!(elements = dataset.iter().count(), "数据集构建完成");
        Ok(dataset)
    }
}

/// 必需属性检查，缺失或为空的属性全部列出
fn check_required(dataset: &InMemDicomObject, frame: &JpegFrameInfo) -> Result<()> {
    let mut missing: Vec<&str> = REQUIRED_ATTRIBUTES
        .iter()
        .filter(|(tag, _)| !has_value(dataset, *tag))
        .map(|(_, name)| *name)
        .collect();
    if frame.color.samples_per_pixel() > 1 && !has_value(dataset, tags::PLANAR_CONFIGURATION) {
        missing.push("PlanarConfiguration");
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(CourierError::IncompleteDataset(missing.join(", ")))
    }
}

fn has_value(dataset: &InMemDicomObject, tag: Tag) -> bool {
    match dataset.element(tag) {
        Ok(element) => match element.value() {
            Value::Primitive(value) => !value.to_str().trim().is_empty(),
            _ => true,
        },
        Err(_) => false,
    }
}

/// 按 VR 检查文本值：UID 语法，以及单个值 (PN 为每个组件组) 的长度上限
fn check_text(tag: Tag, vr: VR, value: &str) -> Result<()> {
    if vr == VR::UI {
        if !value.split('\\').all(is_valid_dicom_uid) {
            return Err(CourierError::encoding(format!(
                "({:04X},{:04X}) 的UID无效: {:?}",
                tag.group(),
                tag.element(),
                value
            )));
        }
        return Ok(());
    }

    let max = match vr {
        VR::AE | VR::CS | VR::SH | VR::DS | VR::TM => 16,
        VR::AS => 4,
        VR::DA => 8,
        VR::DT => 26,
        VR::IS => 12,
        VR::LO | VR::PN => 64,
        VR::ST => 1024,
        VR::LT => 10240,
        _ => return Ok(()),
    };
    let too_long = if vr == VR::PN {
        value
            .split('\\')
            .flat_map(|name| name.split('='))
            .any(|group| group.len() > max)
    } else {
        value.split('\\').any(|v| v.len() > max)
    };
    if too_long {
        return Err(CourierError::encoding(format!(
            "({:04X},{:04X}) 的 {} 值超过 {} 字节: {:?}",
            tag.group(),
            tag.element(),
            vr,
            max,
            value
        )));
    }
    Ok(())
}
