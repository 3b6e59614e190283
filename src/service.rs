//! 采集服务
//!
//! 显式构造的服务实例，生命周期为 `initialize` → 使用 → `cleanup`。
//! 采集路径只做编码、写盘和入队，不等待网络。

use std::path::PathBuf;
use std::sync::Arc;

use courier_core::{
    CapturedImage, CourierConfig, CourierError, PatientRecord, Result, StudyContext,
    StudyDetails, UidGenerator,
};
use courier_delivery::{
    Clock, DeliveryQueue, DeliveryWorker, ItemId, Priority, QueueEvent, QueueSnapshot,
    RecoveryReport, SystemClock, WorkerStats,
};
use courier_dicom::{AssociationClient, DicomEncoder, StoreSender};
use courier_storage::{write_atomic, WriteOutcome};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 一次采集的本地结果；投递状态通过 [`CaptureService::delivery_status`] 查询
#[derive(Debug, Clone)]
pub struct CaptureReceipt {
    pub item_id: ItemId,
    pub path: PathBuf,
    pub sop_instance_uid: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub outcome: WriteOutcome,
}

pub struct CaptureService {
    uids: Arc<UidGenerator>,
    encoder: DicomEncoder,
    queue: Arc<DeliveryQueue>,
    sender: Arc<dyn StoreSender>,
    recovery: RecoveryReport,
    shutdown: CancellationToken,
    worker: JoinHandle<Result<WorkerStats>>,
}

impl CaptureService {
    /// 使用配置中的 PACS 节点和系统时钟启动服务
    pub async fn initialize(config: CourierConfig) -> Result<Self> {
        let client = AssociationClient::new(config.pacs.clone(), &config.encoder)?;
        Self::initialize_with(config, Arc::new(client), Arc::new(SystemClock)).await
    }

    /// 指定发送端和时钟启动服务
    pub async fn initialize_with(
        config: CourierConfig,
        sender: Arc<dyn StoreSender>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let uids = Arc::new(UidGenerator::new(config.encoder.uid_root.clone())?);
        let encoder = DicomEncoder::new(config.encoder.clone(), uids.clone())
            .with_source_ae_title(config.pacs.calling_ae_title.clone());

        let queue = Arc::new(DeliveryQueue::open(&config.queue, clock));
        let recovery = queue.load_from_disk().await?;

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(
            DeliveryWorker::new(queue.clone(), sender.clone()).run(shutdown.clone()),
        );

        info!(
            pacs = %config.pacs.address(),
            called_ae = %config.pacs.called_ae_title,
            queue_dir = ?config.queue.dir,
            restored = recovery.restored,
            "采集服务已启动"
        );
        Ok(Self {
            uids,
            encoder,
            queue,
            sender,
            recovery,
            shutdown,
            worker,
        })
    }

    /// 开始一次采集会话，分配检查和序列 UID
    pub fn begin_study(&self, details: StudyDetails) -> Result<StudyContext> {
        StudyContext::begin(details, &self.uids)
    }

    /// 编码、原子写入队列目录并入队；编码或写盘错误直接返回，不进入队列
    pub async fn capture(
        &self,
        patient: &PatientRecord,
        study: &StudyContext,
        image: &CapturedImage,
        priority: Priority,
    ) -> Result<CaptureReceipt> {
        let encoded = self.encoder.encode(patient, study, image).map_err(|e| {
            error!(error = %e, "编码失败");
            e
        })?;

        let item_id = ItemId::new();
        let path = self.queue.payload_path(&item_id);
        let outcome = write_atomic(&path, &encoded.bytes).await.map_err(|e| {
            error!(path = ?path, error = %e, "写入DICOM文件失败");
            e
        })?;

        if let Err(e) = self.queue.enqueue_with_id(item_id, &path, priority).await {
            error!(path = ?path, error = %e, "入队失败");
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                warn!(path = ?path, error = %remove_err, "清理未入队的文件失败");
            }
            return Err(e);
        }

        info!(
            id = %item_id,
            sop_instance_uid = %encoded.sop_instance_uid,
            priority = %priority,
            "采集完成, 等待投递"
        );
        Ok(CaptureReceipt {
            item_id,
            path,
            sop_instance_uid: encoded.sop_instance_uid,
            study_instance_uid: encoded.study_instance_uid,
            series_instance_uid: encoded.series_instance_uid,
            outcome,
        })
    }

    /// C-ECHO，用于验证配置
    pub async fn test_connection(&self) -> Result<()> {
        self.sender.test_connection().await
    }

    pub async fn delivery_status(&self) -> QueueSnapshot {
        self.queue.snapshot().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// 启动恢复时的报告
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// 停止工作者；正在进行的发送会完成或超时，未尝试的条目留在磁盘上
    pub async fn cleanup(self) -> Result<WorkerStats> {
        self.shutdown.cancel();
        let stats = self
            .worker
            .await
            .map_err(|e| CourierError::Internal(format!("投递工作者异常退出: {}", e)))??;
        info!("采集服务已停止");
        Ok(stats)
    }
}
