//! run 子命令

use anyhow::{bail, Result};
use tracing::info;

use dtp_common::JobStatus;
use dtp_engine::Job;

use super::common::load_context;

pub async fn handle(job_path: &str, device_path: &str, output_dir: &str) -> Result<()> {
    let context = load_context(job_path, device_path, output_dir)?;
    let pipeline = dtp_actions::assemble(&context)?;

    let mut job = Job::new(context, pipeline);
    info!("任务 {} 已组装，开始执行", job.id());

    let report = job.run().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    match report.status {
        JobStatus::Complete => Ok(()),
        status => bail!("任务未完成: {:?}", status),
    }
}
