//! validate 子命令

use anyhow::{bail, Result};
use tracing::info;

use dtp_engine::Job;

use super::common::load_context;

pub async fn handle(job_path: &str, device_path: &str) -> Result<()> {
    let context = load_context(job_path, device_path, "./dtp-output")?;
    let pipeline = dtp_actions::assemble(&context)?;

    let mut job = Job::new(context, pipeline);
    let failures = job.validate();

    if failures.is_empty() {
        info!("校验通过");
        return Ok(());
    }

    for failure in &failures {
        eprintln!("[{}] {}: {}", failure.level, failure.action, failure.error);
    }
    bail!("校验失败，共 {} 个错误", failures.len());
}
