//! DIMSE 命令集
//!
//! 命令集总是以隐式VR小端编码，(0000,0000) 组长度位于最前。

use bytes::Bytes;
use courier_core::{CourierError, Result};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags::{
    AFFECTED_SOP_CLASS_UID, AFFECTED_SOP_INSTANCE_UID, COMMAND_DATA_SET_TYPE, COMMAND_FIELD,
    ERROR_COMMENT, MESSAGE_ID, MESSAGE_ID_BEING_RESPONDED_TO, PRIORITY, STATUS,
};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;

/// 命令字段
pub mod command_field {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
}

/// 命令集中不含数据集
pub const DATA_SET_ABSENT: u16 = 0x0101;
/// 命令集后跟数据集
pub const DATA_SET_PRESENT: u16 = 0x0000;

/// 优先级 MEDIUM
pub const PRIORITY_MEDIUM: u16 = 0x0000;

/// DIMSE 命令集
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSet {
    pub command_field: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub priority: Option<u16>,
    pub data_set_type: u16,
    pub status: Option<u16>,
    pub error_comment: Option<String>,
}

impl CommandSet {
    pub fn c_echo_rq(message_id: u16, sop_class_uid: &str) -> Self {
        Self {
            command_field: command_field::C_ECHO_RQ,
            affected_sop_class_uid: Some(sop_class_uid.to_string()),
            message_id: Some(message_id),
            data_set_type: DATA_SET_ABSENT,
            ..Default::default()
        }
    }

    pub fn c_echo_rsp(request: &CommandSet, status: u16) -> Self {
        Self {
            command_field: command_field::C_ECHO_RSP,
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            message_id_being_responded_to: request.message_id,
            data_set_type: DATA_SET_ABSENT,
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn c_store_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        Self {
            command_field: command_field::C_STORE_RQ,
            affected_sop_class_uid: Some(sop_class_uid.to_string()),
            affected_sop_instance_uid: Some(sop_instance_uid.to_string()),
            message_id: Some(message_id),
            priority: Some(PRIORITY_MEDIUM),
            data_set_type: DATA_SET_PRESENT,
            ..Default::default()
        }
    }

    pub fn c_store_rsp(request: &CommandSet, status: u16, error_comment: Option<&str>) -> Self {
        Self {
            command_field: command_field::C_STORE_RSP,
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: request.affected_sop_instance_uid.clone(),
            message_id_being_responded_to: request.message_id,
            data_set_type: DATA_SET_ABSENT,
            status: Some(status),
            error_comment: error_comment.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn has_data_set(&self) -> bool {
        self.data_set_type != DATA_SET_ABSENT
    }

    /// 隐式VR小端编码，带组长度
    pub fn encode(&self) -> Result<Bytes> {
        let mut elements = vec![
            us(COMMAND_FIELD, self.command_field),
            us(COMMAND_DATA_SET_TYPE, self.data_set_type),
        ];
        if let Some(uid) = &self.affected_sop_class_uid {
            elements.push(text(AFFECTED_SOP_CLASS_UID, VR::UI, uid));
        }
        if let Some(id) = self.message_id {
            elements.push(us(MESSAGE_ID, id));
        }
        if let Some(id) = self.message_id_being_responded_to {
            elements.push(us(MESSAGE_ID_BEING_RESPONDED_TO, id));
        }
        if let Some(priority) = self.priority {
            elements.push(us(PRIORITY, priority));
        }
        if let Some(status) = self.status {
            elements.push(us(STATUS, status));
        }
        if let Some(comment) = &self.error_comment {
            elements.push(text(ERROR_COMMENT, VR::LO, comment));
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            elements.push(text(AFFECTED_SOP_INSTANCE_UID, VR::UI, uid));
        }

        // 组长度由 command_from_element_iter 计算
        let command = InMemDicomObject::command_from_element_iter(elements);
        let mut buf = Vec::new();
        command
            .write_dataset_with_ts(&mut buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(|e| CourierError::encoding(format!("命令集编码失败: {}", e)))?;
        Ok(Bytes::from(buf))
    }

    /// 解析隐式VR小端命令集，忽略不认识的元素
    pub fn decode(data: &[u8]) -> Result<Self> {
        let obj = InMemDicomObject::read_dataset_with_ts(data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(|e| CourierError::Parse(format!("命令集解析失败: {}", e)))?;

        let (Some(command_field), Some(data_set_type)) = (
            read_us(&obj, COMMAND_FIELD)?,
            read_us(&obj, COMMAND_DATA_SET_TYPE)?,
        ) else {
            return Err(CourierError::Parse(
                "命令集缺少命令字段或数据集类型".to_string(),
            ));
        };

        Ok(CommandSet {
            command_field,
            affected_sop_class_uid: read_text(&obj, AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: read_text(&obj, AFFECTED_SOP_INSTANCE_UID),
            message_id: read_us(&obj, MESSAGE_ID)?,
            message_id_being_responded_to: read_us(&obj, MESSAGE_ID_BEING_RESPONDED_TO)?,
            priority: read_us(&obj, PRIORITY)?,
            data_set_type,
            status: read_us(&obj, STATUS)?,
            error_comment: read_text(&obj, ERROR_COMMENT),
        })
    }
}

fn us(tag: Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

/// 文本值补齐到偶数长度：UI 用 NUL，其余用空格
fn text(tag: Tag, vr: VR, value: &str) -> InMemElement {
    let mut value = value.to_string();
    if value.len() % 2 != 0 {
        value.push(if vr == VR::UI { '\0' } else { ' ' });
    }
    DataElement::new(tag, vr, PrimitiveValue::from(value))
}

fn read_us(obj: &InMemDicomObject, tag: Tag) -> Result<Option<u16>> {
    match obj.element(tag) {
        Ok(element) => element.uint16().map(Some).map_err(|_| {
            CourierError::Parse(format!(
                "({:04X},{:04X}) 不是 US 值",
                tag.group(),
                tag.element()
            ))
        }),
        Err(_) => Ok(None),
    }
}

fn read_text(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_end_matches(['\0', ' ']).to_string())
}

/// DIMSE 状态的处理类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// 警告按成功处理
    Warning,
    /// 稍后重试
    Transient,
    /// 永久拒绝，重试无意义
    Rejected,
}

impl StatusClass {
    pub fn is_success(self) -> bool {
        matches!(self, StatusClass::Success | StatusClass::Warning)
    }
}

/// 按 PS3.4 状态码分类；未知的失败码视为暂时失败
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        0x0000 => StatusClass::Success,
        0x0001 | 0xB000 | 0xB006 | 0xB007 => StatusClass::Warning,
        0xA700..=0xA7FF | 0x0213 | 0xFE00 | 0x0110 => StatusClass::Transient,
        0xA900..=0xA9FF | 0xC000..=0xCFFF | 0x0122 | 0x0124 | 0x0211 | 0x0212 => {
            StatusClass::Rejected
        }
        _ => StatusClass::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_echo_rq_encoding() {
        let bytes = CommandSet::c_echo_rq(7, "1.2.840.10008.1.1").encode().unwrap();

        // 组长度元素: (0000,0000) 长度 4
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 4, 0, 0, 0]);
        let group_length = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        assert_eq!(group_length, bytes.len() - 12);

        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(decoded.command_field, command_field::C_ECHO_RQ);
        assert_eq!(decoded.message_id, Some(7));
        assert_eq!(decoded.affected_sop_class_uid.as_deref(), Some("1.2.840.10008.1.1"));
        assert!(!decoded.has_data_set());
    }

    #[test]
    fn test_c_store_round_trip() {
        let rq = CommandSet::c_store_rq(3, "1.2.840.10008.5.1.4.1.1.7", "1.2.3.4.5");
        let decoded = CommandSet::decode(&rq.encode().unwrap()).unwrap();
        assert_eq!(decoded, rq);
        assert!(decoded.has_data_set());

        let rsp = CommandSet::c_store_rsp(&rq, 0xA900, Some("SOP class mismatch"));
        let decoded = CommandSet::decode(&rsp.encode().unwrap()).unwrap();
        assert_eq!(decoded.status, Some(0xA900));
        assert_eq!(decoded.message_id_being_responded_to, Some(3));
        assert_eq!(decoded.error_comment.as_deref(), Some("SOP class mismatch"));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let bytes = CommandSet::c_echo_rq(1, "1.2.840.10008.1.1").encode().unwrap();
        assert!(CommandSet::decode(&bytes[..bytes.len() - 3]).is_err());
        assert!(CommandSet::decode(&[]).is_err());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(0x0000), StatusClass::Success);
        for warning in [0x0001, 0xB000, 0xB006, 0xB007] {
            assert!(classify_status(warning).is_success());
        }
        for transient in [0xA700, 0xA7FF, 0x0213, 0xFE00, 0x0110, 0x1234] {
            assert_eq!(classify_status(transient), StatusClass::Transient);
        }
        for rejected in [0xA900, 0xA9FF, 0xC000, 0xCFFF, 0x0122, 0x0124, 0x0211, 0x0212] {
            assert_eq!(classify_status(rejected), StatusClass::Rejected);
        }
    }
}
