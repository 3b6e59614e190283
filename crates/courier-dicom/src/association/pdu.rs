//! DICOM 上层协议 PDU 编解码
//!
//! PDU 头为 6 字节：类型、保留、4 字节大端长度。关联请求/接受的可变字段
//! 由条目组成，每个条目为 类型、保留、2 字节大端长度 加内容。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use courier_core::{CourierError, Result};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const PDU_ASSOCIATE_RQ: u8 = 0x01;
pub const PDU_ASSOCIATE_AC: u8 = 0x02;
pub const PDU_ASSOCIATE_RJ: u8 = 0x03;
pub const PDU_P_DATA_TF: u8 = 0x04;
pub const PDU_RELEASE_RQ: u8 = 0x05;
pub const PDU_RELEASE_RP: u8 = 0x06;
pub const PDU_ABORT: u8 = 0x07;

const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
const ITEM_USER_INFORMATION: u8 = 0x50;
const ITEM_MAX_LENGTH: u8 = 0x51;
const ITEM_IMPLEMENTATION_CLASS_UID: u8 = 0x52;
const ITEM_IMPLEMENTATION_VERSION_NAME: u8 = 0x55;

/// 协议版本
const PROTOCOL_VERSION: u16 = 0x0001;

/// AE 标题固定 16 字节
const AE_TITLE_LENGTH: usize = 16;

/// PDV 控制位：命令
const PDV_COMMAND: u8 = 0x01;
/// PDV 控制位：最后一个分片
const PDV_LAST: u8 = 0x02;

/// 关联请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRq {
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextProposal>,
    pub user_info: UserInfo,
}

/// 关联接受
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAc {
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    pub user_info: UserInfo,
}

/// 请求方提议的表示上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposal {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// 接受方对表示上下文的答复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextNegotiated {
    pub id: u8,
    pub result: PresentationContextResult,
    pub transfer_syntax: String,
}

/// 表示上下文结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResult {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxNotSupported,
}

impl PresentationContextResult {
    fn code(self) -> u8 {
        match self {
            Self::Acceptance => 0,
            Self::UserRejection => 1,
            Self::NoReason => 2,
            Self::AbstractSyntaxNotSupported => 3,
            Self::TransferSyntaxNotSupported => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            2 => Self::NoReason,
            3 => Self::AbstractSyntaxNotSupported,
            4 => Self::TransferSyntaxNotSupported,
            other => return Err(parse_error(format!("未知的表示上下文结果: {}", other))),
        })
    }
}

/// 用户信息条目
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// 本端可接收的最大 P-DATA 长度，0 表示不限
    pub max_pdu_length: u32,
    pub implementation_class_uid: Option<String>,
    pub implementation_version_name: Option<String>,
}

/// 关联拒绝
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateRj {
    /// 1 永久, 2 暂时
    pub result: u8,
    pub source: u8,
    pub reason: u8,
}

impl AssociateRj {
    pub fn is_permanent(&self) -> bool {
        self.result == 1
    }
}

/// 表示数据值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdv {
    pub presentation_context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Bytes,
}

/// 上层协议数据单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociateRq(AssociateRq),
    AssociateAc(AssociateAc),
    AssociateRj(AssociateRj),
    PData(Vec<Pdv>),
    ReleaseRq,
    ReleaseRp,
    Abort { source: u8, reason: u8 },
}

impl Pdu {
    /// 日志用的 PDU 名称
    pub fn name(&self) -> &'static str {
        match self {
            Pdu::AssociateRq(_) => "A-ASSOCIATE-RQ",
            Pdu::AssociateAc(_) => "A-ASSOCIATE-AC",
            Pdu::AssociateRj(_) => "A-ASSOCIATE-RJ",
            Pdu::PData(_) => "P-DATA-TF",
            Pdu::ReleaseRq => "A-RELEASE-RQ",
            Pdu::ReleaseRp => "A-RELEASE-RP",
            Pdu::Abort { .. } => "A-ABORT",
        }
    }
}

/// PDU 编解码器
#[derive(Debug, Clone)]
pub struct PduCodec {
    /// 允许接收的最大 PDU 长度 (不含 6 字节头)
    max_incoming: u32,
}

impl PduCodec {
    pub fn new(max_incoming: u32) -> Self {
        Self { max_incoming }
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = CourierError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 6 {
            return Ok(None);
        }

        let pdu_type = src[0];
        let pdu_length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
        // 关联协商 PDU 不受 P-DATA 长度限制，但仍需要一个上限
        let limit = self.max_incoming.max(64 * 1024);
        if pdu_length > limit {
            return Err(parse_error(format!(
                "PDU 长度 {} 超过上限 {}",
                pdu_length, limit
            )));
        }

        let total_length = 6 + pdu_length as usize;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total_length).freeze();
        let body = frame.slice(6..);
        trace!(pdu_type, pdu_length, "收到PDU");
        decode_pdu(pdu_type, body).map(Some)
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = CourierError;

    fn encode(&mut self, pdu: Pdu, dst: &mut BytesMut) -> Result<()> {
        let (pdu_type, body) = encode_pdu(&pdu)?;
        let length = u32::try_from(body.len())
            .map_err(|_| CourierError::encoding(format!("{} 过长", pdu.name())))?;
        dst.reserve(6 + body.len());
        dst.put_u8(pdu_type);
        dst.put_u8(0);
        dst.put_u32(length);
        dst.put_slice(&body);
        Ok(())
    }
}

fn encode_pdu(pdu: &Pdu) -> Result<(u8, BytesMut)> {
    let mut body = BytesMut::new();
    let pdu_type = match pdu {
        Pdu::AssociateRq(rq) => {
            put_association_header(&mut body, &rq.called_ae_title, &rq.calling_ae_title)?;
            put_item(&mut body, ITEM_APPLICATION_CONTEXT, rq.application_context.as_bytes())?;
            for pc in &rq.presentation_contexts {
                let mut item = BytesMut::new();
                item.put_u8(pc.id);
                item.put_bytes(0, 3);
                put_item(&mut item, ITEM_ABSTRACT_SYNTAX, pc.abstract_syntax.as_bytes())?;
                for ts in &pc.transfer_syntaxes {
                    put_item(&mut item, ITEM_TRANSFER_SYNTAX, ts.as_bytes())?;
                }
                put_item(&mut body, ITEM_PRESENTATION_CONTEXT_RQ, &item)?;
            }
            put_user_info(&mut body, &rq.user_info)?;
            PDU_ASSOCIATE_RQ
        }
        Pdu::AssociateAc(ac) => {
            put_association_header(&mut body, &ac.called_ae_title, &ac.calling_ae_title)?;
            put_item(&mut body, ITEM_APPLICATION_CONTEXT, ac.application_context.as_bytes())?;
            for pc in &ac.presentation_contexts {
                let mut item = BytesMut::new();
                item.put_u8(pc.id);
                item.put_u8(0);
                item.put_u8(pc.result.code());
                item.put_u8(0);
                put_item(&mut item, ITEM_TRANSFER_SYNTAX, pc.transfer_syntax.as_bytes())?;
                put_item(&mut body, ITEM_PRESENTATION_CONTEXT_AC, &item)?;
            }
            put_user_info(&mut body, &ac.user_info)?;
            PDU_ASSOCIATE_AC
        }
        Pdu::AssociateRj(rj) => {
            body.put_u8(0);
            body.put_u8(rj.result);
            body.put_u8(rj.source);
            body.put_u8(rj.reason);
            PDU_ASSOCIATE_RJ
        }
        Pdu::PData(pdvs) => {
            for pdv in pdvs {
                body.put_u32(pdv.data.len() as u32 + 2);
                body.put_u8(pdv.presentation_context_id);
                let mut control = 0;
                if pdv.is_command {
                    control |= PDV_COMMAND;
                }
                if pdv.is_last {
                    control |= PDV_LAST;
                }
                body.put_u8(control);
                body.put_slice(&pdv.data);
            }
            PDU_P_DATA_TF
        }
        Pdu::ReleaseRq => {
            body.put_bytes(0, 4);
            PDU_RELEASE_RQ
        }
        Pdu::ReleaseRp => {
            body.put_bytes(0, 4);
            PDU_RELEASE_RP
        }
        Pdu::Abort { source, reason } => {
            body.put_bytes(0, 2);
            body.put_u8(*source);
            body.put_u8(*reason);
            PDU_ABORT
        }
    };
    Ok((pdu_type, body))
}

fn put_association_header(buf: &mut BytesMut, called: &str, calling: &str) -> Result<()> {
    buf.put_u16(PROTOCOL_VERSION);
    buf.put_u16(0);
    put_ae_title(buf, called)?;
    put_ae_title(buf, calling)?;
    buf.put_bytes(0, 32);
    Ok(())
}

fn put_ae_title(buf: &mut BytesMut, ae_title: &str) -> Result<()> {
    if ae_title.len() > AE_TITLE_LENGTH {
        return Err(CourierError::encoding(format!("AE标题过长: {}", ae_title)));
    }
    buf.put_slice(ae_title.as_bytes());
    buf.put_bytes(b' ', AE_TITLE_LENGTH - ae_title.len());
    Ok(())
}

fn put_item(buf: &mut BytesMut, item_type: u8, content: &[u8]) -> Result<()> {
    let length = u16::try_from(content.len())
        .map_err(|_| CourierError::encoding(format!("条目 0x{:02X} 过长", item_type)))?;
    buf.put_u8(item_type);
    buf.put_u8(0);
    buf.put_u16(length);
    buf.put_slice(content);
    Ok(())
}

fn put_user_info(buf: &mut BytesMut, user_info: &UserInfo) -> Result<()> {
    let mut item = BytesMut::new();
    put_item(&mut item, ITEM_MAX_LENGTH, &user_info.max_pdu_length.to_be_bytes())?;
    if let Some(uid) = &user_info.implementation_class_uid {
        put_item(&mut item, ITEM_IMPLEMENTATION_CLASS_UID, uid.as_bytes())?;
    }
    if let Some(name) = &user_info.implementation_version_name {
        put_item(&mut item, ITEM_IMPLEMENTATION_VERSION_NAME, name.as_bytes())?;
    }
    put_item(buf, ITEM_USER_INFORMATION, &item)
}

fn decode_pdu(pdu_type: u8, mut body: Bytes) -> Result<Pdu> {
    match pdu_type {
        PDU_ASSOCIATE_RQ | PDU_ASSOCIATE_AC => {
            if body.remaining() < 68 {
                return Err(parse_error("关联PDU头不完整"));
            }
            let _version = body.get_u16();
            body.advance(2);
            let called_ae_title = read_ae_title(&mut body);
            let calling_ae_title = read_ae_title(&mut body);
            body.advance(32);

            let mut application_context = String::new();
            let mut proposals = Vec::new();
            let mut negotiated = Vec::new();
            let mut user_info = UserInfo::default();

            for (item_type, mut content) in read_items(body)? {
                match item_type {
                    ITEM_APPLICATION_CONTEXT => application_context = uid_string(&content),
                    ITEM_PRESENTATION_CONTEXT_RQ => {
                        if content.remaining() < 4 {
                            return Err(parse_error("表示上下文条目过短"));
                        }
                        let id = content.get_u8();
                        content.advance(3);
                        let mut proposal = PresentationContextProposal {
                            id,
                            abstract_syntax: String::new(),
                            transfer_syntaxes: Vec::new(),
                        };
                        for (sub_type, sub) in read_items(content)? {
                            match sub_type {
                                ITEM_ABSTRACT_SYNTAX => proposal.abstract_syntax = uid_string(&sub),
                                ITEM_TRANSFER_SYNTAX => {
                                    proposal.transfer_syntaxes.push(uid_string(&sub))
                                }
                                _ => {}
                            }
                        }
                        proposals.push(proposal);
                    }
                    ITEM_PRESENTATION_CONTEXT_AC => {
                        if content.remaining() < 4 {
                            return Err(parse_error("表示上下文条目过短"));
                        }
                        let id = content.get_u8();
                        content.advance(1);
                        let result = PresentationContextResult::from_code(content.get_u8())?;
                        content.advance(1);
                        let transfer_syntax = read_items(content)?
                            .into_iter()
                            .find(|(sub_type, _)| *sub_type == ITEM_TRANSFER_SYNTAX)
                            .map(|(_, sub)| uid_string(&sub))
                            .unwrap_or_default();
                        negotiated.push(PresentationContextNegotiated {
                            id,
                            result,
                            transfer_syntax,
                        });
                    }
                    ITEM_USER_INFORMATION => user_info = decode_user_info(content)?,
                    other => trace!(item_type = other, "忽略未知条目"),
                }
            }

            Ok(if pdu_type == PDU_ASSOCIATE_RQ {
                Pdu::AssociateRq(AssociateRq {
                    called_ae_title,
                    calling_ae_title,
                    application_context,
                    presentation_contexts: proposals,
                    user_info,
                })
            } else {
                Pdu::AssociateAc(AssociateAc {
                    called_ae_title,
                    calling_ae_title,
                    application_context,
                    presentation_contexts: negotiated,
                    user_info,
                })
            })
        }
        PDU_ASSOCIATE_RJ => {
            if body.remaining() < 4 {
                return Err(parse_error("A-ASSOCIATE-RJ 过短"));
            }
            body.advance(1);
            Ok(Pdu::AssociateRj(AssociateRj {
                result: body.get_u8(),
                source: body.get_u8(),
                reason: body.get_u8(),
            }))
        }
        PDU_P_DATA_TF => {
            let mut pdvs = Vec::new();
            while body.has_remaining() {
                if body.remaining() < 6 {
                    return Err(parse_error("PDV 头不完整"));
                }
                let length = body.get_u32() as usize;
                if length < 2 || body.remaining() < length {
                    return Err(parse_error(format!("PDV 长度无效: {}", length)));
                }
                let presentation_context_id = body.get_u8();
                let control = body.get_u8();
                let data = body.split_to(length - 2);
                pdvs.push(Pdv {
                    presentation_context_id,
                    is_command: control & PDV_COMMAND != 0,
                    is_last: control & PDV_LAST != 0,
                    data,
                });
            }
            Ok(Pdu::PData(pdvs))
        }
        PDU_RELEASE_RQ => Ok(Pdu::ReleaseRq),
        PDU_RELEASE_RP => Ok(Pdu::ReleaseRp),
        PDU_ABORT => {
            if body.remaining() < 4 {
                return Err(parse_error("A-ABORT 过短"));
            }
            body.advance(2);
            Ok(Pdu::Abort {
                source: body.get_u8(),
                reason: body.get_u8(),
            })
        }
        other => Err(parse_error(format!("未知的PDU类型: 0x{:02X}", other))),
    }
}

fn decode_user_info(content: Bytes) -> Result<UserInfo> {
    let mut user_info = UserInfo::default();
    for (sub_type, mut sub) in read_items(content)? {
        match sub_type {
            ITEM_MAX_LENGTH if sub.remaining() >= 4 => user_info.max_pdu_length = sub.get_u32(),
            ITEM_IMPLEMENTATION_CLASS_UID => {
                user_info.implementation_class_uid = Some(uid_string(&sub))
            }
            ITEM_IMPLEMENTATION_VERSION_NAME => {
                user_info.implementation_version_name = Some(uid_string(&sub))
            }
            _ => {}
        }
    }
    Ok(user_info)
}

fn read_items(mut buf: Bytes) -> Result<Vec<(u8, Bytes)>> {
    let mut items = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(parse_error("条目头不完整"));
        }
        let item_type = buf.get_u8();
        buf.advance(1);
        let length = buf.get_u16() as usize;
        if buf.remaining() < length {
            return Err(parse_error(format!(
                "条目 0x{:02X} 长度 {} 超出剩余数据",
                item_type, length
            )));
        }
        items.push((item_type, buf.split_to(length)));
    }
    Ok(items)
}

fn read_ae_title(buf: &mut Bytes) -> String {
    let raw = buf.split_to(AE_TITLE_LENGTH);
    String::from_utf8_lossy(&raw).trim().to_string()
}

fn uid_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}

fn parse_error(msg: impl Into<String>) -> CourierError {
    CourierError::Parse(msg.into())
}
