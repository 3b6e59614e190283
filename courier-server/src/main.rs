//! 采集投递服务主程序

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use capture_courier::{CaptureService, CapturedImage, PatientRecord, StudyDetails};
use clap::{Parser, Subcommand};
use courier_core::CourierConfig;
use courier_delivery::{DeliveryQueue, ItemId, Priority, QueueSnapshot, SystemClock};
use courier_dicom::{jpeg, AssociationClient};
use tracing::{info, warn};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "courier-server")]
#[command(about = "采集影像的 DICOM 编码与 PACS 投递服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别，缺省使用配置中的 logging.level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 恢复队列并持续投递，直到收到 Ctrl-C
    Run,
    /// 向 PACS 发送 C-ECHO
    Echo,
    /// 编码一张 JPEG 并放入投递队列
    Capture {
        /// JPEG 文件
        image: PathBuf,
        #[arg(long)]
        patient_name: String,
        #[arg(long)]
        patient_id: String,
        #[arg(long)]
        accession_number: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value = "routine")]
        priority: Priority,
    },
    /// 显示队列状态
    Status,
    /// 重新启用永久失败的条目
    Retry { id: ItemId },
    /// 取消条目并删除其载荷
    Cancel { id: ItemId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = CourierConfig::load(args.config.as_deref()).context("加载配置失败")?;

    // 初始化日志
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(level.as_str()).init();

    match args.command {
        Command::Run => run(config).await,
        Command::Echo => {
            let client = AssociationClient::new(config.pacs.clone(), &config.encoder)?;
            client.test_connection().await?;
            println!("C-ECHO 成功: {}", config.pacs.address());
            Ok(())
        }
        Command::Capture {
            image,
            patient_name,
            patient_id,
            accession_number,
            description,
            priority,
        } => {
            let data = tokio::fs::read(&image)
                .await
                .with_context(|| format!("读取图像 {:?} 失败", image))?;
            let frame = jpeg::inspect(&data)?;
            let image = CapturedImage::new(data, frame.width, frame.height);

            let service = CaptureService::initialize(config).await?;
            let study = service.begin_study(StudyDetails {
                accession_number,
                study_description: description,
                ..Default::default()
            })?;
            let patient = PatientRecord::new(patient_name, patient_id);
            let receipt = service.capture(&patient, &study, &image, priority).await?;
            println!("已入队 {} ({})", receipt.item_id, receipt.sop_instance_uid);
            service.cleanup().await?;
            Ok(())
        }
        Command::Status => {
            let queue = open_queue(&config).await?;
            print_snapshot(&queue.snapshot().await);
            Ok(())
        }
        Command::Retry { id } => {
            let queue = open_queue(&config).await?;
            queue.retry(&id).await?;
            println!("已重新入队 {}", id);
            Ok(())
        }
        Command::Cancel { id } => {
            let queue = open_queue(&config).await?;
            queue.cancel(&id).await?;
            println!("已取消 {}", id);
            Ok(())
        }
    }
}

async fn run(config: CourierConfig) -> anyhow::Result<()> {
    info!("启动采集投递服务...");
    let service = CaptureService::initialize(config).await?;

    let report = service.recovery_report();
    if !report.corrupt_records.is_empty() || !report.missing_payloads.is_empty() {
        warn!(
            corrupt = report.corrupt_records.len(),
            missing = report.missing_payloads.len(),
            "恢复时发现需要人工处理的条目"
        );
    }
    if let Err(e) = service.test_connection().await {
        warn!(error = %e, "PACS 当前不可达, 条目将在队列中等待");
    }

    tokio::signal::ctrl_c().await.context("监听退出信号失败")?;
    info!("收到退出信号, 等待当前投递结束");
    let stats = service.cleanup().await?;
    info!(
        delivered = stats.delivered,
        rescheduled = stats.rescheduled,
        parked = stats.parked,
        "服务已退出"
    );
    Ok(())
}

async fn open_queue(config: &CourierConfig) -> anyhow::Result<DeliveryQueue> {
    let queue = DeliveryQueue::open(&config.queue, Arc::new(SystemClock));
    queue.load_from_disk().await?;
    Ok(queue)
}

fn print_snapshot(snapshot: &QueueSnapshot) {
    println!(
        "待投递 {} (就绪 {}, 退避中 {}), 永久失败 {}",
        snapshot.pending(),
        snapshot.ready,
        snapshot.deferred,
        snapshot.failed_permanent
    );
    for item in &snapshot.items {
        println!(
            "{}  {:<9}  {:?}  尝试 {}  下次 {}  {}",
            item.id,
            item.priority,
            item.state,
            item.attempt_count,
            item.next_attempt_at.format("%Y-%m-%d %H:%M:%S"),
            item.last_error.as_deref().unwrap_or("-")
        );
    }
}
