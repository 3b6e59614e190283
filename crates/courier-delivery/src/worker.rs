//! 投递工作者
//!
//! 单任务顺序投递，是 `complete`/`fail` 的唯一调用方。停机信号只在两次
//! 投递之间检查，正在进行的发送会完成或超时。

use std::sync::Arc;

use courier_core::Result;
use courier_dicom::{SendResult, StoreSender};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::item::{Failure, QueueItem};
use crate::queue::{DeliveryQueue, FailOutcome};

/// 工作者退出时的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub delivered: u64,
    pub rescheduled: u64,
    pub parked: u64,
}

pub struct DeliveryWorker {
    queue: Arc<DeliveryQueue>,
    sender: Arc<dyn StoreSender>,
}

impl DeliveryWorker {
    pub fn new(queue: Arc<DeliveryQueue>, sender: Arc<dyn StoreSender>) -> Self {
        Self { queue, sender }
    }

    /// 运行到收到停机信号
    pub async fn run(self, shutdown: CancellationToken) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        info!(dir = ?self.queue.dir(), "投递工作者已启动");

        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = self.queue.dequeue() => item?,
            };
            self.deliver(item, &mut stats).await;
        }

        info!(
            delivered = stats.delivered,
            rescheduled = stats.rescheduled,
            parked = stats.parked,
            "投递工作者已停止"
        );
        Ok(stats)
    }

    async fn deliver(&self, item: QueueItem, stats: &mut WorkerStats) {
        let attempt = item.attempt_count + 1;
        info!(id = %item.id, attempt, path = ?item.file_path, "开始投递");

        let failure = match self.sender.send(&item.file_path).await {
            SendResult::Success { status } => {
                if status != 0 {
                    warn!(id = %item.id, status = %format!("{:#06x}", status), "PACS返回警告状态");
                }
                match self.queue.complete(&item.id).await {
                    Ok(()) => stats.delivered += 1,
                    // 载荷已送达，记录未删除时下次启动会重复发送
                    Err(e) => error!(id = %item.id, error = %e, "删除已投递条目失败"),
                }
                return;
            }
            SendResult::Rejected(reason) => {
                error!(id = %item.id, attempt, reason = %reason, "PACS永久拒绝");
                Failure::Permanent {
                    status: reason.status,
                    reason: reason.message,
                }
            }
            SendResult::TransientFailure(message) => {
                warn!(id = %item.id, attempt, error = %message, "投递暂时失败");
                Failure::Transient(message)
            }
        };

        match self.queue.fail(&item.id, failure).await {
            Ok(FailOutcome::Rescheduled { .. }) => stats.rescheduled += 1,
            Ok(FailOutcome::Parked { .. }) => stats.parked += 1,
            Err(e) => error!(id = %item.id, error = %e, "记录投递失败时出错"),
        }
    }
}
