//! 子命令共用的加载逻辑

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use dtp_common::{DeviceDescriptor, JobParameters};
use dtp_engine::JobContext;

/// 读取 YAML 描述文件为参数树
pub fn load_document(path: &str) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取描述文件: {}", path))?;
    serde_yaml::from_str(&content).with_context(|| format!("描述文件不是合法的 YAML: {}", path))
}

/// 从任务与设备描述文件构造任务上下文
pub fn load_context(job_path: &str, device_path: &str, output_dir: &str) -> Result<JobContext> {
    let parameters = JobParameters::from_value(load_document(job_path)?);
    let device = DeviceDescriptor::from_value(load_document(device_path)?);

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("无法创建输出目录: {}", output_dir))?;

    Ok(JobContext {
        parameters,
        device,
        namespace: "common".to_string(),
        output_dir: Path::new(output_dir).to_path_buf(),
    })
}
