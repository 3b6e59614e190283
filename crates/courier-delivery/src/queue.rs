//! 持久化投递队列
//!
//! 条目按 (优先级降序, 创建时间升序) 出队，只有 `next_attempt_at <= now`
//! 的条目可以出队。两个有序索引避免每次出队线性扫描：
//! `ready` 存放已到期的条目，`deferred` 按下次尝试时间存放退避中的条目。
//!
//! 启动时队列处于 `Idle`，`load_from_disk` 完成 `Idle → Recovering → Ready`
//! 之后才接受其他操作。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_core::{CourierError, QueueConfig, Result};
use tokio::fs;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::clock::Clock;
use crate::item::{Failure, ItemId, ItemState, Priority, QueueItem, ReadyKey};
use crate::store::{remove_if_exists, QueueStore};

const EVENT_CAPACITY: usize = 256;

/// 队列生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Recovering,
    Ready,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 启动恢复的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// 恢复为待投递的条目数
    pub restored: usize,
    /// 恢复时处于永久失败状态的条目数 (含载荷缺失)
    pub parked: usize,
    /// 载荷文件缺失、被转为永久失败的条目
    pub missing_payloads: Vec<ItemId>,
    /// 被隔离的损坏记录
    pub corrupt_records: Vec<PathBuf>,
    /// 没有记录引用的载荷，只上报不处理
    pub orphan_payloads: Vec<PathBuf>,
    /// 清理的崩溃遗留临时文件
    pub removed_temps: Vec<PathBuf>,
}

/// `fail` 的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Rescheduled {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Parked {
        attempt: u32,
    },
}

/// 队列事件，供状态面板订阅
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Recovered(RecoveryReport),
    Enqueued {
        id: ItemId,
        priority: Priority,
    },
    Delivered {
        id: ItemId,
    },
    Rescheduled {
        id: ItemId,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    FailedPermanent {
        id: ItemId,
        attempt: u32,
        reason: String,
    },
    Cancelled {
        id: ItemId,
    },
    Requeued {
        id: ItemId,
    },
}

/// 队列快照
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub state: QueueState,
    /// 已到期、可立即出队
    pub ready: usize,
    /// 退避中
    pub deferred: usize,
    /// 已出队、等待结果
    pub in_flight: usize,
    pub failed_permanent: usize,
    /// 全部条目，按出队顺序排列
    pub items: Vec<QueueItem>,
}

impl QueueSnapshot {
    pub fn pending(&self) -> usize {
        self.ready + self.deferred + self.in_flight
    }
}

#[derive(Debug)]
struct Inner {
    state: QueueState,
    items: HashMap<ItemId, QueueItem>,
    ready: BTreeSet<ReadyKey>,
    deferred: BTreeSet<(DateTime<Utc>, ItemId)>,
    in_flight: HashSet<ItemId>,
    /// 下一个入队序号，恢复时从已有记录的最大值之后继续
    next_sequence: u64,
}

impl Inner {
    fn ensure_ready(&self, operation: &str) -> Result<()> {
        if self.state == QueueState::Ready {
            Ok(())
        } else {
            Err(CourierError::InvalidStateTransition {
                from: self.state.to_string(),
                event: operation.to_string(),
            })
        }
    }

    fn get(&self, id: &ItemId) -> Result<&QueueItem> {
        self.items
            .get(id)
            .ok_or_else(|| CourierError::NotFound(format!("队列条目 {}", id)))
    }

    /// 把待投递条目放入对应索引
    fn index(&mut self, item: &QueueItem, now: DateTime<Utc>) {
        if !item.is_pending() {
            return;
        }
        if item.next_attempt_at <= now {
            self.ready.insert(item.ready_key());
        } else {
            self.deferred.insert((item.next_attempt_at, item.id));
        }
    }

    fn unindex(&mut self, item: &QueueItem) {
        self.ready.remove(&item.ready_key());
        self.deferred.remove(&(item.next_attempt_at, item.id));
        self.in_flight.remove(&item.id);
    }

    /// 把到期的退避条目移到 `ready`
    fn promote(&mut self, now: DateTime<Utc>) {
        while let Some(&(at, id)) = self.deferred.first() {
            if at > now {
                break;
            }
            self.deferred.pop_first();
            if let Some(item) = self.items.get(&id) {
                self.ready.insert(item.ready_key());
            }
        }
    }

    fn pop_eligible(&mut self, now: DateTime<Utc>) -> Option<QueueItem> {
        self.promote(now);
        let (_, _, _, id) = self.ready.pop_first()?;
        self.in_flight.insert(id);
        self.items.get(&id).cloned()
    }

    fn earliest_deferred(&self) -> Option<DateTime<Utc>> {
        self.deferred.first().map(|(at, _)| *at)
    }
}

/// 持久化投递队列
pub struct DeliveryQueue {
    store: QueueStore,
    backoff: BackoffPolicy,
    max_attempts: Option<u32>,
    sent_dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    wakeup: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("dir", &self.store.dir())
            .field("backoff", &self.backoff)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl DeliveryQueue {
    /// 创建处于 `Idle` 状态的队列，不访问磁盘
    pub fn open(config: &QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store: QueueStore::new(&config.dir),
            backoff: BackoffPolicy::from_config(config),
            max_attempts: config.max_attempts,
            sent_dir: config.sent_dir.clone(),
            clock,
            inner: Mutex::new(Inner {
                state: QueueState::Idle,
                items: HashMap::new(),
                ready: BTreeSet::new(),
                deferred: BTreeSet::new(),
                in_flight: HashSet::new(),
                next_sequence: 0,
            }),
            wakeup: Notify::new(),
            events,
        }
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    /// 队列自有载荷应写入的路径
    pub fn payload_path(&self, id: &ItemId) -> PathBuf {
        self.store.payload_path(id)
    }

    pub async fn state(&self) -> QueueState {
        self.inner.lock().await.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// 从磁盘重建待投递集合，包括尝试次数和下次尝试时间
    pub async fn load_from_disk(&self) -> Result<RecoveryReport> {
        let mut inner = self.inner.lock().await;
        if inner.state != QueueState::Idle {
            return Err(CourierError::InvalidStateTransition {
                from: inner.state.to_string(),
                event: "load_from_disk".to_string(),
            });
        }
        inner.state = QueueState::Recovering;
        info!(dir = ?self.store.dir(), "开始恢复投递队列");

        match self.recover(&mut inner).await {
            Ok(report) => {
                inner.state = QueueState::Ready;
                info!(
                    restored = report.restored,
                    parked = report.parked,
                    corrupt = report.corrupt_records.len(),
                    orphans = report.orphan_payloads.len(),
                    "投递队列恢复完成"
                );
                for path in &report.orphan_payloads {
                    warn!(path = ?path, "发现没有队列记录的载荷文件");
                }
                drop(inner);
                self.wakeup.notify_waiters();
                let _ = self.events.send(QueueEvent::Recovered(report.clone()));
                Ok(report)
            }
            Err(e) => {
                inner.items.clear();
                inner.ready.clear();
                inner.deferred.clear();
                inner.in_flight.clear();
                inner.next_sequence = 0;
                inner.state = QueueState::Idle;
                error!(error = %e, "投递队列恢复失败");
                Err(e)
            }
        }
    }

    async fn recover(&self, inner: &mut Inner) -> Result<RecoveryReport> {
        let scan = self.store.scan().await?;
        let now = self.clock.now();
        let mut report = RecoveryReport {
            corrupt_records: scan.corrupt,
            orphan_payloads: scan.orphan_payloads,
            removed_temps: scan.removed_temps,
            ..Default::default()
        };

        for mut item in scan.records {
            if item.is_pending() && !path_exists(&item.file_path).await {
                warn!(id = %item.id, path = ?item.file_path, "载荷文件缺失, 条目转为永久失败");
                item.state = ItemState::FailedPermanent;
                item.last_error = Some(format!("载荷文件缺失: {}", item.file_path.display()));
                self.store.save(&item).await?;
                report.missing_payloads.push(item.id);
            }
            if item.is_pending() {
                report.restored += 1;
            } else {
                report.parked += 1;
            }
            inner.next_sequence = inner.next_sequence.max(item.sequence.saturating_add(1));
            inner.index(&item, now);
            inner.items.insert(item.id, item);
        }
        Ok(report)
    }

    /// 入队一个已持久化的文件
    pub async fn enqueue(&self, path: impl AsRef<Path>, priority: Priority) -> Result<ItemId> {
        let id = ItemId::new();
        self.enqueue_with_id(id, path, priority).await?;
        Ok(id)
    }

    /// 以指定ID入队，用于先按 [`payload_path`](Self::payload_path) 写文件再入队
    pub async fn enqueue_with_id(
        &self,
        id: ItemId,
        path: impl AsRef<Path>,
        priority: Priority,
    ) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("enqueue")?;
        if inner.items.contains_key(&id) {
            return Err(CourierError::Internal(format!("队列条目 {} 已存在", id)));
        }

        let now = self.clock.now();
        let owns_payload = self.store.contains(&path);
        let mut item = QueueItem::new(id, path, priority, now, owns_payload);
        item.sequence = inner.next_sequence;
        self.store.save(&item).await?;
        inner.next_sequence += 1;

        inner.index(&item, now);
        inner.items.insert(id, item.clone());
        drop(inner);

        info!(id = %id, priority = %priority, path = ?item.file_path, "已入队");
        self.wakeup.notify_waiters();
        let _ = self.events.send(QueueEvent::Enqueued { id, priority });
        Ok(())
    }

    /// 非阻塞出队
    pub async fn try_dequeue(&self) -> Result<Option<QueueItem>> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("dequeue")?;
        Ok(inner.pop_eligible(self.clock.now()))
    }

    /// 阻塞出队：有新条目时立即唤醒，否则最晚在最早的退避到期时唤醒
    pub async fn dequeue(&self) -> Result<QueueItem> {
        loop {
            // 先注册通知再检查，避免丢失检查与等待之间的入队
            let wakeup = self.wakeup.notified();
            let deadline = {
                let mut inner = self.inner.lock().await;
                inner.ensure_ready("dequeue")?;
                if let Some(item) = inner.pop_eligible(self.clock.now()) {
                    debug!(id = %item.id, attempt = item.attempt_count + 1, "出队");
                    return Ok(item);
                }
                inner.earliest_deferred()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = wakeup => {}
                        _ = self.clock.sleep_until(deadline) => {}
                    }
                }
                None => wakeup.await,
            }
        }
    }

    /// 投递成功：删除记录，处理自有载荷
    pub async fn complete(&self, id: &ItemId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("complete")?;
        let item = inner.get(id)?.clone();

        // 先删记录：之后崩溃只会留下孤立载荷，不会留下指向空文件的记录
        if let Err(e) = self.store.remove(id).await {
            // 记录还在磁盘上：条目按退避重新排队，重复投递由 PACS 按实例 UID 去重
            let now = self.clock.now();
            self.reinstate(&mut inner, &item, item.clone(), now);
            drop(inner);
            self.wakeup.notify_waiters();
            error!(id = %id, error = %e, "删除已投递记录失败, 条目重新排队");
            return Err(e);
        }
        inner.unindex(&item);
        inner.items.remove(id);
        drop(inner);

        if item.owns_payload {
            if let Err(e) = self.dispose_payload(&item).await {
                warn!(id = %id, error = %e, "处理已投递载荷失败");
            }
        }

        info!(id = %id, attempts = item.attempt_count + 1, "投递完成");
        let _ = self.events.send(QueueEvent::Delivered { id: *id });
        Ok(())
    }

    async fn dispose_payload(&self, item: &QueueItem) -> Result<()> {
        match &self.sent_dir {
            Some(sent_dir) => {
                fs::create_dir_all(sent_dir).await.map_err(|e| {
                    CourierError::storage(format!("创建归档目录 {:?} 失败: {}", sent_dir, e))
                })?;
                let file_name = item
                    .file_path
                    .file_name()
                    .ok_or_else(|| CourierError::storage("载荷路径没有文件名"))?;
                let target = sent_dir.join(file_name);
                fs::rename(&item.file_path, &target).await.map_err(|e| {
                    CourierError::storage(format!("归档载荷到 {:?} 失败: {}", target, e))
                })?;
                debug!(id = %item.id, target = ?target, "载荷已归档");
                Ok(())
            }
            None => remove_if_exists(&item.file_path).await,
        }
    }

    /// 记录一次失败：瞬时失败按退避重新安排，永久失败或达到上限则搁置
    pub async fn fail(&self, id: &ItemId, failure: Failure) -> Result<FailOutcome> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("fail")?;
        let previous = inner.get(id)?.clone();
        if !previous.is_pending() {
            return Err(CourierError::InvalidStateTransition {
                from: format!("{:?}", previous.state),
                event: "fail".to_string(),
            });
        }

        let now = self.clock.now();
        let mut item = previous.clone();
        item.attempt_count = item.attempt_count.saturating_add(1);
        item.last_error = Some(failure.message());

        let exhausted = self
            .max_attempts
            .map(|max| item.attempt_count >= max)
            .unwrap_or(false);
        let outcome = match &failure {
            Failure::Transient(_) if !exhausted => {
                item.next_attempt_at =
                    self.backoff
                        .next_attempt_at(item.attempt_count, now, previous.next_attempt_at);
                FailOutcome::Rescheduled {
                    attempt: item.attempt_count,
                    next_attempt_at: item.next_attempt_at,
                }
            }
            _ => {
                item.state = ItemState::FailedPermanent;
                FailOutcome::Parked {
                    attempt: item.attempt_count,
                }
            }
        };

        if let Err(e) = self.store.save(&item).await {
            // 磁盘上仍是上一次的记录；内存中照常退避，下次保存时一并写入
            self.reinstate(&mut inner, &previous, item, now);
            drop(inner);
            self.wakeup.notify_waiters();
            error!(id = %id, error = %e, "保存失败记录出错, 条目按退避保留在队列中");
            return Err(e);
        }
        inner.unindex(&previous);
        inner.index(&item, now);
        inner.items.insert(item.id, item.clone());
        drop(inner);

        let message = failure.message();
        let event = match outcome {
            FailOutcome::Rescheduled {
                attempt,
                next_attempt_at,
            } => {
                warn!(
                    id = %id,
                    attempt,
                    next_attempt_at = %next_attempt_at,
                    error = %message,
                    "投递失败, 已安排重试"
                );
                QueueEvent::Rescheduled {
                    id: *id,
                    attempt,
                    next_attempt_at,
                    error: message,
                }
            }
            FailOutcome::Parked { attempt } => {
                error!(id = %id, attempt, reason = %message, "投递永久失败, 等待人工处理");
                QueueEvent::FailedPermanent {
                    id: *id,
                    attempt,
                    reason: message,
                }
            }
        };
        // 重新安排可能提前了最早的截止时间
        self.wakeup.notify_waiters();
        let _ = self.events.send(event);
        Ok(outcome)
    }

    /// 持久化失败后把条目放回索引：保持待投递，按退避延后，不留在 `in_flight`
    fn reinstate(
        &self,
        inner: &mut Inner,
        previous: &QueueItem,
        mut item: QueueItem,
        now: DateTime<Utc>,
    ) {
        item.state = ItemState::Pending;
        item.next_attempt_at = self.backoff.next_attempt_at(
            item.attempt_count.max(1),
            now,
            previous.next_attempt_at,
        );
        inner.unindex(previous);
        inner.index(&item, now);
        inner.items.insert(item.id, item);
    }

    /// 操作员取消：删除记录和自有载荷
    pub async fn cancel(&self, id: &ItemId) -> Result<QueueItem> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("cancel")?;
        let item = inner.get(id)?.clone();

        self.store.remove(id).await?;
        inner.unindex(&item);
        inner.items.remove(id);
        drop(inner);

        if item.owns_payload {
            remove_if_exists(&item.file_path).await?;
        }
        info!(id = %id, "条目已取消");
        let _ = self.events.send(QueueEvent::Cancelled { id: *id });
        Ok(item)
    }

    /// 重新启用永久失败的条目，尝试次数清零并立即可出队
    pub async fn retry(&self, id: &ItemId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("retry")?;
        let previous = inner.get(id)?.clone();
        if previous.is_pending() {
            return Err(CourierError::InvalidStateTransition {
                from: format!("{:?}", previous.state),
                event: "retry".to_string(),
            });
        }
        if !path_exists(&previous.file_path).await {
            return Err(CourierError::NotFound(format!(
                "载荷文件 {}",
                previous.file_path.display()
            )));
        }

        let now = self.clock.now();
        let mut item = previous;
        item.state = ItemState::Pending;
        item.attempt_count = 0;
        item.next_attempt_at = now;
        self.store.save(&item).await?;

        inner.index(&item, now);
        inner.items.insert(item.id, item);
        drop(inner);

        info!(id = %id, "条目已重新入队");
        self.wakeup.notify_waiters();
        let _ = self.events.send(QueueEvent::Requeued { id: *id });
        Ok(())
    }

    pub async fn get(&self, id: &ItemId) -> Option<QueueItem> {
        self.inner.lock().await.items.get(id).cloned()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let mut items: Vec<QueueItem> = inner.items.values().cloned().collect();
        items.sort_by_key(|item| (!item.is_pending(), item.ready_key()));
        QueueSnapshot {
            state: inner.state,
            ready: inner.ready.len(),
            deferred: inner.deferred.len(),
            in_flight: inner.in_flight.len(),
            failed_permanent: inner.items.values().filter(|i| !i.is_pending()).count(),
            items,
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn config(dir: &Path) -> QueueConfig {
        QueueConfig {
            dir: dir.to_path_buf(),
            base_backoff_ms: 1000,
            backoff_cap: 3,
            max_attempts: None,
            sent_dir: None,
        }
    }

    async fn ready_queue(config: &QueueConfig, clock: Arc<ManualClock>) -> DeliveryQueue {
        let queue = DeliveryQueue::open(config, clock);
        queue.load_from_disk().await.unwrap();
        queue
    }

    /// 在队列目录内放一个载荷并入队
    async fn enqueue_owned(queue: &DeliveryQueue, priority: Priority) -> ItemId {
        let id = ItemId::new();
        let path = queue.payload_path(&id);
        std::fs::write(&path, b"payload").unwrap();
        queue.enqueue_with_id(id, &path, priority).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_operations_require_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DeliveryQueue::open(&config(dir.path()), Arc::new(ManualClock::default()));
        assert_eq!(queue.state().await, QueueState::Idle);

        let err = queue.enqueue(dir.path().join("a.dcm"), Priority::Routine).await;
        assert!(matches!(err, Err(CourierError::InvalidStateTransition { .. })));

        queue.load_from_disk().await.unwrap();
        assert_eq!(queue.state().await, QueueState::Ready);
        assert!(queue.load_from_disk().await.is_err());
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let queue = ready_queue(&config(dir.path()), clock.clone()).await;

        let first_low = enqueue_owned(&queue, Priority::Routine).await;
        clock.advance(chrono::Duration::milliseconds(1));
        let high = enqueue_owned(&queue, Priority::High).await;
        clock.advance(chrono::Duration::milliseconds(1));
        let second_low = enqueue_owned(&queue, Priority::Routine).await;

        let order: Vec<ItemId> = vec![
            queue.try_dequeue().await.unwrap().unwrap().id,
            queue.try_dequeue().await.unwrap().unwrap().id,
            queue.try_dequeue().await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![high, first_low, second_low]);
        assert!(queue.try_dequeue().await.unwrap().is_none());
        assert_eq!(queue.snapshot().await.in_flight, 3);
    }

    #[tokio::test]
    async fn test_backoff_is_monotonic_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let queue = ready_queue(&config(dir.path()), clock.clone()).await;
        let id = enqueue_owned(&queue, Priority::Routine).await;

        let mut previous = queue.get(&id).await.unwrap().next_attempt_at;
        let mut delays = Vec::new();
        for attempt in 1..=6u32 {
            let item = queue.try_dequeue().await.unwrap().unwrap();
            assert_eq!(item.id, id);
            let now = clock.now();
            let outcome = queue
                .fail(&id, Failure::Transient("连接被拒绝".into()))
                .await
                .unwrap();
            let FailOutcome::Rescheduled { attempt: n, next_attempt_at } = outcome else {
                panic!("unexpected outcome {:?}", outcome);
            };
            assert_eq!(n, attempt);
            assert!(next_attempt_at >= previous);
            delays.push((next_attempt_at - now).num_seconds());
            previous = next_attempt_at;

            // 到期前不可出队
            assert!(queue.try_dequeue().await.unwrap().is_none());
            clock.set(next_attempt_at);
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);

        let item = queue.get(&id).await.unwrap();
        assert_eq!(item.attempt_count, 6);
        assert_eq!(item.last_error.as_deref(), Some("连接被拒绝"));
    }

    /// 把记录文件换成非空目录，之后的保存 (重命名) 和删除都会失败
    fn block_record(dir: &Path, id: &ItemId) -> PathBuf {
        let meta = dir.join(format!("{}.meta", id));
        std::fs::remove_file(&meta).unwrap();
        std::fs::create_dir(&meta).unwrap();
        std::fs::write(meta.join("blocker"), b"x").unwrap();
        meta
    }

    #[tokio::test]
    async fn test_failed_record_save_keeps_item_schedulable() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let queue = ready_queue(&config(dir.path()), clock.clone()).await;
        let id = enqueue_owned(&queue, Priority::Routine).await;
        queue.try_dequeue().await.unwrap().unwrap();

        let meta = block_record(dir.path(), &id);
        let result = queue.fail(&id, Failure::Transient("连接被拒绝".into())).await;
        assert!(matches!(result, Err(CourierError::Storage(_))));

        // 不滞留在 in_flight，按退避等待
        let snapshot = queue.snapshot().await;
        assert_eq!((snapshot.ready, snapshot.deferred, snapshot.in_flight), (0, 1, 0));
        assert!(queue.try_dequeue().await.unwrap().is_none());

        std::fs::remove_dir_all(&meta).unwrap();
        clock.advance(chrono::Duration::days(365));
        let item = queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.attempt_count, 1);

        // 磁盘恢复后下一次失败照常落盘
        let outcome = queue.fail(&id, Failure::Transient("超时".into())).await.unwrap();
        assert!(matches!(outcome, FailOutcome::Rescheduled { attempt: 2, .. }));
        assert!(meta.is_file());
    }

    #[tokio::test]
    async fn test_failed_permanent_save_keeps_item_pending() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let queue = ready_queue(&config(dir.path()), clock.clone()).await;
        let id = enqueue_owned(&queue, Priority::High).await;
        queue.try_dequeue().await.unwrap().unwrap();

        let meta = block_record(dir.path(), &id);
        let failure = Failure::Permanent {
            status: Some(0xA900),
            reason: "SOP 类不匹配".into(),
        };
        assert!(queue.fail(&id, failure).await.is_err());

        // 搁置没有落盘，条目保持待投递
        let item = queue.get(&id).await.unwrap();
        assert!(item.is_pending());
        assert_eq!(queue.snapshot().await.in_flight, 0);

        std::fs::remove_dir_all(&meta).unwrap();
        clock.advance(chrono::Duration::days(365));
        assert_eq!(queue.try_dequeue().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn test_failed_record_removal_requeues_item() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let queue = ready_queue(&config(dir.path()), clock.clone()).await;
        let id = enqueue_owned(&queue, Priority::Routine).await;
        queue.try_dequeue().await.unwrap().unwrap();

        let meta = block_record(dir.path(), &id);
        assert!(queue.complete(&id).await.is_err());

        let snapshot = queue.snapshot().await;
        assert_eq!((snapshot.deferred, snapshot.in_flight), (1, 0));
        assert_eq!(queue.get(&id).await.unwrap().attempt_count, 0);
        // 载荷保留，重新投递时仍可读取
        assert!(queue.payload_path(&id).exists());

        std::fs::remove_dir_all(&meta).unwrap();
        clock.advance(chrono::Duration::days(365));
        assert_eq!(queue.try_dequeue().await.unwrap().unwrap().id, id);
        queue.complete(&id).await.unwrap();
        assert!(queue.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_same_timestamp_keeps_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let config = config(dir.path());

        // 时钟不动，所有条目的创建时间相同
        let expected = {
            let queue = ready_queue(&config, clock.clone()).await;
            let mut ids = Vec::new();
            for _ in 0..8 {
                ids.push(enqueue_owned(&queue, Priority::Routine).await);
            }
            let mut order = Vec::new();
            while let Some(item) = queue.try_dequeue().await.unwrap() {
                order.push(item.id);
            }
            assert_eq!(order, ids);
            ids
        };

        // 序号随记录持久化，重启后继续递增
        let queue = ready_queue(&config, clock.clone()).await;
        let later = enqueue_owned(&queue, Priority::Routine).await;
        let mut order = Vec::new();
        while let Some(item) = queue.try_dequeue().await.unwrap() {
            order.push(item.id);
        }
        let mut all = expected;
        all.push(later);
        assert_eq!(order, all);
    }

    #[tokio::test]
    async fn test_recovery_preserves_attempts_and_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let config = config(dir.path());

        let (id, before) = {
            let queue = ready_queue(&config, clock.clone()).await;
            let id = enqueue_owned(&queue, Priority::High).await;
            for _ in 0..2 {
                queue.try_dequeue().await.unwrap();
                queue.fail(&id, Failure::Transient("超时".into())).await.unwrap();
                clock.set(queue.get(&id).await.unwrap().next_attempt_at);
            }
            (id, queue.get(&id).await.unwrap())
        };

        let queue = DeliveryQueue::open(&config, clock.clone());
        let report = queue.load_from_disk().await.unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.parked, 0);
        assert_eq!(queue.get(&id).await.unwrap(), before);
        assert_eq!(before.attempt_count, 2);

        // 重启前已到期，恢复后立即可出队
        assert_eq!(queue.try_dequeue().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_parked_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let queue = ready_queue(&config(dir.path()), clock.clone()).await;
        let mut events = queue.subscribe();
        let id = enqueue_owned(&queue, Priority::Routine).await;
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Enqueued { .. }));

        queue.try_dequeue().await.unwrap().unwrap();
        let outcome = queue
            .fail(
                &id,
                Failure::Permanent {
                    status: Some(0xA900),
                    reason: "数据集与 SOP 类不匹配".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Parked { attempt: 1 });
        match events.recv().await.unwrap() {
            QueueEvent::FailedPermanent { id: event_id, reason, .. } => {
                assert_eq!(event_id, id);
                assert!(reason.contains("0xa900"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        clock.advance(chrono::Duration::days(1));
        assert!(queue.try_dequeue().await.unwrap().is_none());
        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.failed_permanent, 1);
        assert_eq!(snapshot.pending(), 0);
        assert!(dir.path().join(format!("{}.meta", id)).exists());

        // 重启后仍处于搁置状态
        let reopened = ready_queue(&config(dir.path()), clock.clone()).await;
        assert_eq!(reopened.snapshot().await.failed_permanent, 1);

        queue.retry(&id).await.unwrap();
        let item = queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.attempt_count, 0);
        assert!(queue.retry(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_max_attempts_parks_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.max_attempts = Some(2);
        let clock = Arc::new(ManualClock::default());
        let queue = ready_queue(&config, clock.clone()).await;
        let id = enqueue_owned(&queue, Priority::Routine).await;

        let first = queue.fail(&id, Failure::Transient("忙".into())).await.unwrap();
        assert!(matches!(first, FailOutcome::Rescheduled { attempt: 1, .. }));
        let second = queue.fail(&id, Failure::Transient("忙".into())).await.unwrap();
        assert_eq!(second, FailOutcome::Parked { attempt: 2 });
        assert!(queue.fail(&id, Failure::Transient("忙".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_complete_removes_record_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ready_queue(&config(dir.path()), Arc::new(ManualClock::default())).await;
        let id = enqueue_owned(&queue, Priority::Routine).await;
        let payload = queue.payload_path(&id);

        queue.try_dequeue().await.unwrap().unwrap();
        queue.complete(&id).await.unwrap();
        assert!(!payload.exists());
        assert!(!dir.path().join(format!("{}.meta", id)).exists());
        assert!(queue.get(&id).await.is_none());
        assert!(matches!(
            queue.complete(&id).await,
            Err(CourierError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_archives_to_sent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sent = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.sent_dir = Some(sent.path().join("sent"));
        let queue = ready_queue(&config, Arc::new(ManualClock::default())).await;
        let id = enqueue_owned(&queue, Priority::Routine).await;

        queue.complete(&id).await.unwrap();
        assert!(!queue.payload_path(&id).exists());
        assert!(sent.path().join("sent").join(format!("{}.dcm", id)).exists());
    }

    #[tokio::test]
    async fn test_external_payload_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let payload = outside.path().join("study.dcm");
        std::fs::write(&payload, b"x").unwrap();

        let queue = ready_queue(&config(dir.path()), Arc::new(ManualClock::default())).await;
        let id = queue.enqueue(&payload, Priority::Routine).await.unwrap();
        assert!(!queue.get(&id).await.unwrap().owns_payload);
        queue.cancel(&id).await.unwrap();
        assert!(payload.exists());
    }

    #[tokio::test]
    async fn test_recovery_parks_missing_payload_and_reports_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let config = config(dir.path());
        let (lost, kept) = {
            let queue = ready_queue(&config, clock.clone()).await;
            let lost = enqueue_owned(&queue, Priority::Routine).await;
            let kept = enqueue_owned(&queue, Priority::Routine).await;
            (lost, kept)
        };
        std::fs::remove_file(dir.path().join(format!("{}.dcm", lost))).unwrap();
        let orphan = dir.path().join(format!("{}.dcm", ItemId::new()));
        std::fs::write(&orphan, b"x").unwrap();

        let queue = DeliveryQueue::open(&config, clock);
        let report = queue.load_from_disk().await.unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.parked, 1);
        assert_eq!(report.missing_payloads, vec![lost]);
        assert_eq!(report.orphan_payloads, vec![orphan.clone()]);
        assert!(orphan.exists());

        assert_eq!(queue.try_dequeue().await.unwrap().unwrap().id, kept);
        assert_eq!(
            queue.get(&lost).await.unwrap().state,
            ItemState::FailedPermanent
        );
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(
            ready_queue(&config(dir.path()), Arc::new(ManualClock::default())).await,
        );

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let id = enqueue_owned(&queue, Priority::Emergency).await;
        let item = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item.id, id);
    }

    #[tokio::test]
    async fn test_dequeue_wakes_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(ready_queue(&config(dir.path()), clock.clone()).await);
        let id = enqueue_owned(&queue, Priority::Routine).await;
        queue.try_dequeue().await.unwrap().unwrap();
        queue.fail(&id, Failure::Transient("超时".into())).await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        clock.advance(chrono::Duration::seconds(1));
        let item = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_item() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ready_queue(&config(dir.path()), Arc::new(ManualClock::default())).await;
        let id = enqueue_owned(&queue, Priority::High).await;

        let cancelled = queue.cancel(&id).await.unwrap();
        assert_eq!(cancelled.id, id);
        assert!(!queue.payload_path(&id).exists());
        assert!(queue.try_dequeue().await.unwrap().is_none());
        assert!(queue.cancel(&id).await.is_err());
    }
}
