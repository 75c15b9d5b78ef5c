//! daemon 子命令
//!
//! 单机演示版的调度循环：注册一台设备、把任务全部入队，
//! 然后按认领契约轮询执行，队列排空即退出。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use dtp_common::{DeviceDescriptor, JobParameters, JobStatus};
use dtp_engine::{Job, JobContext};
use dtp_scheduler::{JobSource, MemoryJobSource, QueuedJob, SchedulerDaemon};

use super::common::load_document;

pub async fn handle(
    job_paths: &[String],
    device_path: &str,
    output_dir: &str,
    interval_secs: u64,
) -> Result<()> {
    let device_doc = load_document(device_path)?;
    let device_type = DeviceDescriptor::from_value(device_doc.clone())
        .device_type()
        .to_string();
    let device_id = format!("{}-01", device_type);

    let source = Arc::new(MemoryJobSource::new());
    source.add_device(&device_id, &device_type).await?;

    for path in job_paths {
        let definition = load_document(path)?;
        source.submit(QueuedJob::new(&device_type, definition)).await;
    }

    let daemon = SchedulerDaemon::new(Arc::clone(&source), Duration::from_secs(interval_secs));
    let mut failed = 0usize;

    loop {
        let claimed = daemon.poll_once().await;

        if claimed.is_empty() {
            if source.queue_len().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            continue;
        }

        for (device, queued) in claimed {
            info!("执行任务 {} (设备 {})", queued.id, device);

            let context = JobContext {
                parameters: JobParameters::from_value(queued.definition.clone()),
                device: DeviceDescriptor::from_value(device_doc.clone()),
                namespace: "common".to_string(),
                output_dir: Path::new(output_dir).join(&queued.id),
            };
            std::fs::create_dir_all(&context.output_dir)?;

            let status = match dtp_actions::assemble(&context) {
                Ok(pipeline) => {
                    let mut job = Job::new(context, pipeline);
                    let report = job.run().await;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    report.status
                }
                Err(e) => {
                    error!("任务 {} 组装失败: {}", queued.id, e);
                    JobStatus::Incomplete
                }
            };

            if status != JobStatus::Complete {
                failed += 1;
            }
            source.complete(&device, status).await?;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} 个任务未完成", failed);
    }
    Ok(())
}
