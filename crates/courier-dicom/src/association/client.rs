//! 关联客户端 (SCU)
//!
//! 每个文件使用一个独立的关联：协商一个表示上下文，发送 C-STORE，
//! 读取响应后释放。整个过程受同一个截止时间约束。

use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use courier_core::{CourierError, EncoderConfig, PacsNodeConfig, Result};
use futures::{SinkExt, StreamExt};
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::dimse::{classify_status, command_field, CommandSet, StatusClass};
use super::pdu::{
    AssociateRq, Pdu, PduCodec, Pdv, PresentationContextProposal, PresentationContextResult,
    UserInfo,
};
use super::state::{AssociationEvent, AssociationTracker};
use super::transport::{BoxedStream, Transport};
use super::{RejectKind, RejectReason, SendResult, StoreSender};
use crate::instance::{self, StoredInstance};
use crate::transfer_syntax::{sop_class_uids, transfer_syntax_uids, APPLICATION_CONTEXT_NAME};

/// 释放关联时等待 A-RELEASE-RP 的最长时间
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// 会话内部错误，决定投递结果的分类
#[derive(Debug)]
enum SessionError {
    Transient(String),
    Rejected(RejectReason),
}

impl From<CourierError> for SessionError {
    fn from(err: CourierError) -> Self {
        SessionError::Transient(err.to_string())
    }
}

impl From<SessionError> for CourierError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transient(msg) => CourierError::TransientNetwork(msg),
            SessionError::Rejected(reason) => CourierError::PermanentRejection {
                status: reason.status.unwrap_or(0),
                reason: reason.message,
            },
        }
    }
}

/// DICOM 关联客户端
pub struct AssociationClient {
    config: PacsNodeConfig,
    implementation_class_uid: String,
    implementation_version_name: String,
    transport: Transport,
    message_id: AtomicU16,
}

impl AssociationClient {
    pub fn new(config: PacsNodeConfig, encoder: &EncoderConfig) -> Result<Self> {
        config.validate()?;
        let transport = Transport::new(&config)?;
        Ok(Self {
            config,
            implementation_class_uid: encoder.implementation_class_uid.clone(),
            implementation_version_name: encoder.implementation_version_name.clone(),
            transport,
            message_id: AtomicU16::new(1),
        })
    }

    pub fn config(&self) -> &PacsNodeConfig {
        &self.config
    }

    /// C-ECHO 验证连通性，状态必须为 0x0000
    pub async fn test_connection(&self) -> Result<()> {
        let proposal = PresentationContextProposal {
            id: 1,
            abstract_syntax: sop_class_uids::VERIFICATION.to_string(),
            transfer_syntaxes: vec![
                transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ],
        };

        let mut session = Session::open(self, proposal).await?;
        let request = CommandSet::c_echo_rq(self.next_message_id(), sop_class_uids::VERIFICATION);
        session.send_message(&request, None).await?;
        let response = session.receive_command().await?;
        check_response(&request, &response, command_field::C_ECHO_RSP)?;

        let status = response.status.unwrap_or(0xFFFF);
        let class = classify_status(status);
        let event = if status == 0x0000 {
            AssociationEvent::ResponseSuccess
        } else {
            AssociationEvent::ResponseFailure
        };
        session.tracker.apply(event)?;
        session.release().await;

        match (status, class) {
            (0x0000, _) => {
                info!(peer = %self.config.address(), "C-ECHO 成功");
                Ok(())
            }
            (_, StatusClass::Rejected) => Err(CourierError::PermanentRejection {
                status,
                reason: "C-ECHO 被拒绝".to_string(),
            }),
            _ => Err(CourierError::TransientNetwork(format!(
                "C-ECHO 返回状态 {:#06x}",
                status
            ))),
        }
    }

    /// 发送一个 Part-10 文件
    pub async fn send(&self, path: &Path) -> SendResult {
        let instance = match read_local_file(path).await {
            Ok(instance) => instance,
            Err(err) => {
                warn!(path = ?path, error = %err, "本地文件不可读");
                return SendResult::Rejected(RejectReason {
                    kind: RejectKind::LocalFile,
                    status: None,
                    message: err.to_string(),
                });
            }
        };

        match self.store(&instance).await {
            Ok(status) => SendResult::Success { status },
            Err(SessionError::Transient(msg)) => SendResult::TransientFailure(msg),
            Err(SessionError::Rejected(reason)) => SendResult::Rejected(reason),
        }
    }

    async fn store(&self, instance: &StoredInstance) -> std::result::Result<u16, SessionError> {
        let proposal = PresentationContextProposal {
            id: 1,
            abstract_syntax: instance.sop_class_uid.clone(),
            transfer_syntaxes: vec![instance.transfer_syntax_uid.clone()],
        };

        let mut session = Session::open(self, proposal).await?;
        let request = CommandSet::c_store_rq(
            self.next_message_id(),
            &instance.sop_class_uid,
            &instance.sop_instance_uid,
        );
        session
            .send_message(&request, Some(instance.dataset.clone()))
            .await?;
        let response = session.receive_command().await?;
        check_response(&request, &response, command_field::C_STORE_RSP)?;

        let status = response.status.ok_or_else(|| {
            SessionError::Transient("C-STORE 响应缺少状态".to_string())
        })?;
        let class = classify_status(status);
        let event = if class.is_success() {
            AssociationEvent::ResponseSuccess
        } else {
            AssociationEvent::ResponseFailure
        };
        session.tracker.apply(event)?;
        session.release().await;

        debug!(
            sop_instance_uid = %instance.sop_instance_uid,
            status = format_args!("{:#06x}", status),
            "收到 C-STORE 响应"
        );

        match class {
            StatusClass::Success | StatusClass::Warning => Ok(status),
            StatusClass::Transient => Err(SessionError::Transient(format!(
                "PACS 返回暂时失败状态 {:#06x}",
                status
            ))),
            StatusClass::Rejected => Err(SessionError::Rejected(RejectReason {
                kind: RejectKind::Status,
                status: Some(status),
                message: response
                    .error_comment
                    .unwrap_or_else(|| format!("PACS 拒绝存储, 状态 {:#06x}", status)),
            })),
        }
    }

    fn next_message_id(&self) -> u16 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl StoreSender for AssociationClient {
    async fn send(&self, path: &Path) -> SendResult {
        AssociationClient::send(self, path).await
    }

    async fn test_connection(&self) -> Result<()> {
        AssociationClient::test_connection(self).await
    }
}

/// 文件解析在阻塞线程池上进行
async fn read_local_file(path: &Path) -> Result<StoredInstance> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || instance::load_for_store(&path))
        .await
        .map_err(|e| CourierError::Internal(format!("读取任务失败: {}", e)))?
}

fn check_response(
    request: &CommandSet,
    response: &CommandSet,
    expected: u16,
) -> std::result::Result<(), SessionError> {
    if response.command_field != expected {
        return Err(SessionError::Transient(format!(
            "意外的响应命令 {:#06x}",
            response.command_field
        )));
    }
    if response.message_id_being_responded_to != request.message_id {
        return Err(SessionError::Transient(format!(
            "响应的消息ID {:?} 与请求 {:?} 不符",
            response.message_id_being_responded_to, request.message_id
        )));
    }
    Ok(())
}

/// 一个已建立的关联
struct Session {
    framed: Framed<BoxedStream, PduCodec>,
    tracker: AssociationTracker,
    deadline: Instant,
    context_id: u8,
    /// 每个 PDV 可携带的最大数据字节数
    max_fragment: usize,
}

impl Session {
    /// 连接并协商唯一的表示上下文
    async fn open(
        client: &AssociationClient,
        proposal: PresentationContextProposal,
    ) -> std::result::Result<Self, SessionError> {
        let config = &client.config;
        let deadline = Instant::now() + config.timeout();
        let peer = config.address();

        let stream = match timeout_at(deadline, client.transport.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(SessionError::Transient(format!("连接 {} 失败: {}", peer, e)))
            }
            Err(_) => return Err(SessionError::Transient(format!("连接 {} 超时", peer))),
        };

        let mut session = Session {
            framed: Framed::new(stream, PduCodec::new(config.max_pdu_length)),
            tracker: AssociationTracker::new(),
            deadline,
            context_id: proposal.id,
            max_fragment: 0,
        };

        let request = AssociateRq {
            called_ae_title: config.called_ae_title.clone(),
            calling_ae_title: config.calling_ae_title.clone(),
            application_context: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![proposal.clone()],
            user_info: UserInfo {
                max_pdu_length: config.max_pdu_length,
                implementation_class_uid: Some(client.implementation_class_uid.clone()),
                implementation_version_name: Some(client.implementation_version_name.clone()),
            },
        };
        session.tracker.apply(AssociationEvent::Connect)?;
        session.send_pdu(Pdu::AssociateRq(request)).await?;

        match session.next_pdu().await? {
            Pdu::AssociateAc(ac) => {
                let accepted = ac.presentation_contexts.iter().find(|pc| {
                    pc.id == proposal.id
                        && pc.result == PresentationContextResult::Acceptance
                        && proposal.transfer_syntaxes.contains(&pc.transfer_syntax)
                });
                if accepted.is_none() {
                    session.tracker.apply(AssociationEvent::AssociationRejected)?;
                    session.release().await;
                    return Err(SessionError::Rejected(RejectReason {
                        kind: RejectKind::ContextNotAccepted,
                        status: None,
                        message: format!(
                            "{} 未接受表示上下文 {} / {:?}",
                            peer, proposal.abstract_syntax, proposal.transfer_syntaxes
                        ),
                    }));
                }

                session.tracker.apply(AssociationEvent::Accepted)?;
                let peer_max = match ac.user_info.max_pdu_length {
                    0 => config.max_pdu_length,
                    n => n,
                };
                // PDV 头占 6 字节
                session.max_fragment = (peer_max as usize).saturating_sub(6).max(1);
                debug!(peer = %peer, peer_max_pdu = peer_max, "关联已建立");
                Ok(session)
            }
            Pdu::AssociateRj(rj) => {
                session.tracker.apply(AssociationEvent::AssociationRejected)?;
                let message = format!(
                    "{} 拒绝关联 (result={}, source={}, reason={})",
                    peer, rj.result, rj.source, rj.reason
                );
                if rj.is_permanent() {
                    Err(SessionError::Rejected(RejectReason {
                        kind: RejectKind::AssociationRejected,
                        status: None,
                        message,
                    }))
                } else {
                    Err(SessionError::Transient(message))
                }
            }
            Pdu::Abort { source, reason } => {
                session.tracker.apply(AssociationEvent::Aborted)?;
                Err(SessionError::Transient(format!(
                    "{} 中止关联 (source={}, reason={})",
                    peer, source, reason
                )))
            }
            other => {
                session.abort().await;
                Err(SessionError::Transient(format!(
                    "关联协商时收到意外的 {}",
                    other.name()
                )))
            }
        }
    }

    async fn send_pdu(&mut self, pdu: Pdu) -> std::result::Result<(), SessionError> {
        match timeout_at(self.deadline, self.framed.send(pdu)).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(self.timed_out().await),
        }
    }

    async fn next_pdu(&mut self) -> std::result::Result<Pdu, SessionError> {
        match timeout_at(self.deadline, self.framed.next()).await {
            Ok(Some(Ok(pdu))) => Ok(pdu),
            Ok(Some(Err(e))) => Err(SessionError::Transient(format!("读取PDU失败: {}", e))),
            Ok(None) => Err(SessionError::Transient("连接被对端关闭".to_string())),
            Err(_) => Err(self.timed_out().await),
        }
    }

    async fn timed_out(&mut self) -> SessionError {
        let _ = self.tracker.apply(AssociationEvent::Timeout);
        self.abort().await;
        SessionError::Transient("关联操作超时".to_string())
    }

    /// 命令和数据集分别分片发送
    async fn send_message(
        &mut self,
        command: &CommandSet,
        dataset: Option<Bytes>,
    ) -> std::result::Result<(), SessionError> {
        self.tracker.apply(AssociationEvent::RequestSent)?;
        self.send_fragments(command.encode()?, true).await?;
        if let Some(dataset) = dataset {
            self.send_fragments(dataset, false).await?;
        }
        Ok(())
    }

    async fn send_fragments(
        &mut self,
        data: Bytes,
        is_command: bool,
    ) -> std::result::Result<(), SessionError> {
        let total = data.len();
        let mut offset = 0;
        loop {
            let end = (offset + self.max_fragment).min(total);
            let pdv = Pdv {
                presentation_context_id: self.context_id,
                is_command,
                is_last: end == total,
                data: data.slice(offset..end),
            };
            self.send_pdu(Pdu::PData(vec![pdv])).await?;
            offset = end;
            if offset >= total {
                return Ok(());
            }
        }
    }

    /// 读取完整的响应命令集
    async fn receive_command(&mut self) -> std::result::Result<CommandSet, SessionError> {
        let mut buf = BytesMut::new();
        loop {
            match self.next_pdu().await? {
                Pdu::PData(pdvs) => {
                    for pdv in pdvs {
                        if !pdv.is_command {
                            continue;
                        }
                        buf.extend_from_slice(&pdv.data);
                        if pdv.is_last {
                            return Ok(CommandSet::decode(&buf)?);
                        }
                    }
                }
                Pdu::Abort { source, reason } => {
                    let _ = self.tracker.apply(AssociationEvent::Aborted);
                    return Err(SessionError::Transient(format!(
                        "等待响应时关联被中止 (source={}, reason={})",
                        source, reason
                    )));
                }
                other => {
                    self.abort().await;
                    return Err(SessionError::Transient(format!(
                        "等待响应时收到意外的 {}",
                        other.name()
                    )));
                }
            }
        }
    }

    /// 有序释放；失败不影响已经得到的结果
    async fn release(&mut self) {
        let released = timeout(RELEASE_TIMEOUT, async {
            self.framed.send(Pdu::ReleaseRq).await?;
            while let Some(pdu) = self.framed.next().await {
                if pdu? == Pdu::ReleaseRp {
                    break;
                }
            }
            Ok::<_, CourierError>(())
        })
        .await;

        match released {
            Ok(Ok(())) => debug!("关联已释放"),
            Ok(Err(e)) => debug!(error = %e, "释放关联失败"),
            Err(_) => debug!("等待 A-RELEASE-RP 超时"),
        }
        let _ = self.tracker.apply(AssociationEvent::Release);
    }

    async fn abort(&mut self) {
        let abort = Pdu::Abort {
            source: 0,
            reason: 0,
        };
        let _ = timeout(RELEASE_TIMEOUT, self.framed.send(abort)).await;
        let _ = self.tracker.apply(AssociationEvent::Aborted);
    }
}
