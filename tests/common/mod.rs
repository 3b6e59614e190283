//! 集成测试用的假 PACS (SCP) 与测试数据

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use capture_courier::{CapturedImage, CourierConfig, PatientRecord, StudyDetails};
use courier_dicom::association::dimse::command_field;
use courier_dicom::association::pdu::{
    AssociateAc, AssociateRj, Pdu, PduCodec, Pdv, PresentationContextNegotiated,
    PresentationContextResult, UserInfo,
};
use courier_dicom::association::CommandSet;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// 每个连接的应答方式
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// 接受关联，C-STORE 返回给定状态，C-ECHO 返回成功
    Store(u16),
    /// 返回 A-ASSOCIATE-RJ
    RejectAssociation { result: u8 },
    /// 接受 TCP 连接后立即关闭
    Close,
    /// 接受 TCP 连接后不作任何应答
    Silent,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub sop_instance_uid: String,
    pub dataset_len: usize,
}

#[derive(Default)]
struct ScpState {
    script: VecDeque<Behavior>,
    connections: usize,
    stored: Vec<StoredObject>,
    echoes: usize,
}

/// 按脚本应答的 SCP，脚本用完后使用默认行为
pub struct FakeScp {
    pub port: u16,
    state: Arc<Mutex<ScpState>>,
    task: JoinHandle<()>,
}

impl FakeScp {
    pub async fn start(script: Vec<Behavior>, default: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(ScpState {
            script: script.into(),
            ..Default::default()
        }));

        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    let behavior = {
                        let mut state = state.lock().unwrap();
                        state.connections += 1;
                        state.script.pop_front().unwrap_or(default)
                    };
                    tokio::spawn(serve(socket, behavior, state.clone()));
                }
            })
        };
        Self { port, state, task }
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub fn stored(&self) -> Vec<StoredObject> {
        self.state.lock().unwrap().stored.clone()
    }

    pub fn echoes(&self) -> usize {
        self.state.lock().unwrap().echoes
    }
}

impl Drop for FakeScp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: TcpStream, behavior: Behavior, state: Arc<Mutex<ScpState>>) {
    match behavior {
        Behavior::Close => return,
        Behavior::Silent => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            return;
        }
        _ => {}
    }

    let mut framed = Framed::new(socket, PduCodec::new(64 * 1024));
    let Some(Ok(Pdu::AssociateRq(rq))) = framed.next().await else {
        return;
    };

    if let Behavior::RejectAssociation { result } = behavior {
        let _ = framed
            .send(Pdu::AssociateRj(AssociateRj {
                result,
                source: 1,
                reason: 1,
            }))
            .await;
        return;
    }

    let ac = AssociateAc {
        called_ae_title: rq.called_ae_title.clone(),
        calling_ae_title: rq.calling_ae_title.clone(),
        application_context: rq.application_context.clone(),
        presentation_contexts: rq
            .presentation_contexts
            .iter()
            .map(|pc| PresentationContextNegotiated {
                id: pc.id,
                result: PresentationContextResult::Acceptance,
                transfer_syntax: pc.transfer_syntaxes[0].clone(),
            })
            .collect(),
        user_info: UserInfo {
            max_pdu_length: 16 * 1024,
            implementation_class_uid: Some("1.2.826.0.1.3680043.9.9999".to_string()),
            implementation_version_name: Some("FAKE_SCP".to_string()),
        },
    };
    if framed.send(Pdu::AssociateAc(ac)).await.is_err() {
        return;
    }

    let mut command = BytesMut::new();
    let mut dataset = BytesMut::new();
    let mut request: Option<CommandSet> = None;
    let mut context_id = 1;

    while let Some(Ok(pdu)) = framed.next().await {
        match pdu {
            Pdu::PData(pdvs) => {
                for pdv in pdvs {
                    context_id = pdv.presentation_context_id;
                    if pdv.is_command {
                        command.extend_from_slice(&pdv.data);
                        if pdv.is_last {
                            request = Some(CommandSet::decode(&command).unwrap());
                            command.clear();
                        }
                    } else {
                        dataset.extend_from_slice(&pdv.data);
                    }
                    let dataset_done = !pdv.is_command && pdv.is_last;
                    let complete = match &request {
                        Some(req) if !req.has_data_set() => pdv.is_command && pdv.is_last,
                        Some(_) => dataset_done,
                        None => false,
                    };
                    if !complete {
                        continue;
                    }

                    let Some(req) = request.take() else { continue };
                    let response = match (req.command_field, behavior) {
                        (command_field::C_ECHO_RQ, _) => {
                            state.lock().unwrap().echoes += 1;
                            CommandSet::c_echo_rsp(&req, 0x0000)
                        }
                        (command_field::C_STORE_RQ, Behavior::Store(status)) => {
                            state.lock().unwrap().stored.push(StoredObject {
                                sop_instance_uid: req
                                    .affected_sop_instance_uid
                                    .clone()
                                    .unwrap_or_default(),
                                dataset_len: dataset.len(),
                            });
                            dataset.clear();
                            CommandSet::c_store_rsp(&req, status, None)
                        }
                        _ => return,
                    };
                    let reply = Pdv {
                        presentation_context_id: context_id,
                        is_command: true,
                        is_last: true,
                        data: response.encode().unwrap(),
                    };
                    if framed.send(Pdu::PData(vec![reply])).await.is_err() {
                        return;
                    }
                }
            }
            Pdu::ReleaseRq => {
                let _ = framed.send(Pdu::ReleaseRp).await;
                return;
            }
            _ => return,
        }
    }
}

/// 指向假 SCP 的配置
pub fn config(queue_dir: &Path, port: u16) -> CourierConfig {
    let mut config = CourierConfig::default();
    config.pacs.port = port;
    config.pacs.timeout_secs = 2;
    config.queue.dir = queue_dir.to_path_buf();
    config.queue.base_backoff_ms = 1000;
    config.queue.backoff_cap = 6;
    config
}

/// 最小的 8 位灰度 JPEG (SOI, SOF0, SOS, EOI)
pub fn jpeg(width: u16, height: u16) -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xC0, 0x00, 0x0B, 0x08];
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
    data.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02, 0x12, 0x34, 0x56]);
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

pub fn image() -> CapturedImage {
    CapturedImage::new(jpeg(64, 48), 64, 48)
}

pub fn patient() -> PatientRecord {
    PatientRecord::new("Zhang^San", "P0001")
}

pub fn study_details() -> StudyDetails {
    StudyDetails {
        accession_number: Some("ACC001".to_string()),
        study_description: Some("内镜采集".to_string()),
        ..Default::default()
    }
}
