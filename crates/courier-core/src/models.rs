//! 核心数据模型定义

use bytes::Bytes;
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::utils::UidGenerator;
use crate::Result;

/// 患者基本信息，由外部工作列表或界面提供，关联到检查后不再变化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    /// 患者姓名 (DICOM PN 格式, 如 `Doe^John`)
    pub name: String,
    /// 医院内部患者ID
    pub patient_id: String,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
}

impl PatientRecord {
    pub fn new(name: impl Into<String>, patient_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patient_id: patient_id.into(),
            birth_date: None,
            sex: None,
        }
    }

    pub fn with_birth_date(mut self, birth_date: NaiveDate) -> Self {
        self.birth_date = Some(birth_date);
        self
    }

    pub fn with_sex(mut self, sex: Sex) -> Self {
        self.sex = Some(sex);
        self
    }
}

/// 性别枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    Other,
}

impl Sex {
    /// DICOM (0010,0040) 代码
    pub fn dicom_code(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Other => "O",
        }
    }
}

/// 检查上下文的可选描述信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyDetails {
    pub accession_number: Option<String>,
    pub study_description: Option<String>,
    pub referring_physician: Option<String>,
    pub performing_physician: Option<String>,
    pub institution: Option<String>,
}

/// 检查上下文
///
/// 每个采集会话一个。检查和序列实例UID在会话开始时分配，
/// 之后不可修改，同一会话内的所有图像共享它们。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyContext {
    details: StudyDetails,
    study_instance_uid: String,
    series_instance_uid: String,
    started_at: DateTime<Local>,
}

impl StudyContext {
    /// 开始新的采集会话
    pub fn begin(details: StudyDetails, uids: &UidGenerator) -> Result<Self> {
        Ok(Self {
            details,
            study_instance_uid: uids.generate()?,
            series_instance_uid: uids.generate()?,
            started_at: Local::now(),
        })
    }

    /// 从已知的UID和时间恢复会话 (例如由工作列表下发的检查UID)
    pub fn resume(
        details: StudyDetails,
        study_instance_uid: String,
        series_instance_uid: String,
        started_at: DateTime<Local>,
    ) -> Self {
        Self {
            details,
            study_instance_uid,
            series_instance_uid,
            started_at,
        }
    }

    pub fn details(&self) -> &StudyDetails {
        &self.details
    }

    pub fn study_instance_uid(&self) -> &str {
        &self.study_instance_uid
    }

    pub fn series_instance_uid(&self) -> &str {
        &self.series_instance_uid
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }
}

/// 采集设备输出的压缩图像
#[derive(Debug, Clone)]
pub struct CapturedImage {
    /// JPEG 压缩数据
    pub data: Bytes,
    pub width: u16,
    pub height: u16,
}

impl CapturedImage {
    pub fn new(data: impl Into<Bytes>, width: u16, height: u16) -> Self {
        Self {
            data: data.into(),
            width,
            height,
        }
    }
}
