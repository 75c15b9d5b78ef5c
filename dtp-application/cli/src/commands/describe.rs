//! describe 子命令

use anyhow::Result;

use dtp_engine::Job;

use super::common::load_context;

pub async fn handle(job_path: &str, device_path: &str) -> Result<()> {
    let context = load_context(job_path, device_path, "./dtp-output")?;
    let pipeline = dtp_actions::assemble(&context)?;

    let job = Job::new(context, pipeline);
    println!("{}", serde_json::to_string_pretty(&job.pipeline().describe())?);

    Ok(())
}
