//! 端到端测试
//!
//! 用真实子进程模拟设备会话，跑完 启动 -> 测试 -> 收尾 的
//! 完整流水线。

use std::path::Path;

use serde_json::{json, Value};

use dtp_actions::assemble;
use dtp_common::{DeviceDescriptor, JobParameters, JobStatus};
use dtp_engine::{Job, JobContext};

fn context(output_dir: &Path, params: Value, device: Value) -> JobContext {
    JobContext {
        parameters: JobParameters::from_value(params),
        device: DeviceDescriptor::from_value(device),
        namespace: "common".to_string(),
        output_dir: output_dir.to_path_buf(),
    }
}

/// 模拟设备：先打印登录提示符，之后回显所有输入
fn echo_device() -> Value {
    json!({
        "device_type": "echo-sim",
        "actions": {
            "boot": {"methods": ["shell"]},
            "test": {"methods": ["shell"]},
        },
        "commands": {
            "connect": ["sh", "-c", "echo 'dtp-login:'; exec cat"],
            "power_off": ["true"],
        },
        "constants": {
            "shell_prompt": "dtp-login:",
            "test_shell_cmd": "/bin/sh",
        },
    })
}

#[tokio::test]
async fn test_boot_test_finalize_roundtrip() {
    let scratch = tempfile::tempdir().unwrap();
    let params = json!({
        "job_name": "e2e-echo",
        "timeouts": {"job": 60},
        "actions": [
            {"boot": {"method": "shell"}},
            {"test": {
                "method": "shell",
                "definitions": [{"name": "smoke", "steps": ["echo hello"]}],
            }},
            {"finalize": {}},
        ],
    });

    let ctx = context(scratch.path(), params, echo_device());
    let pipeline = assemble(&ctx).unwrap();

    let mut job = Job::new(ctx, pipeline);
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Complete, "报告: {:?}", report);

    // 启动动作在数据仓库记录了结果
    assert_eq!(report.metadata["boot.boot-result"], json!("success"));
    // 测试动作记录了每个定义的执行情况
    assert_eq!(report.metadata["test-shell.results.smoke"]["steps"], json!(1));

    // 描述树完整：每个动作都有层级与结果
    assert_eq!(report.actions.len(), 3);
    for action in &report.actions {
        assert!(!action.level.is_empty());
    }
}

#[tokio::test]
async fn test_boot_without_prompt_fails_incomplete() {
    let scratch = tempfile::tempdir().unwrap();
    // 设备永远不输出提示符
    let device = json!({
        "device_type": "silent-sim",
        "actions": {"boot": {"methods": ["shell"]}},
        "commands": {"connect": ["cat"]},
        "constants": {"shell_prompt": "never-appears:"},
        "timeouts": {
            // 压缩重试预算，让测试快速结束
            "actions": {"boot-connect-retry": 1, "wait-for-prompt": 1},
        },
    });
    let params = json!({
        "job_name": "e2e-silent",
        "timeouts": {"job": 20},
        "actions": [
            {"boot": {"method": "shell", "retries": 2}},
        ],
    });

    let ctx = context(scratch.path(), params, device);
    let pipeline = assemble(&ctx).unwrap();

    let mut job = Job::new(ctx, pipeline);
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Incomplete);
    // 重试动作的每次尝试都留下了记录
    let boot = &report.actions[0];
    let retry = &boot.children[0];
    assert_eq!(retry.name, "boot-connect-retry");
    assert_eq!(retry.attempts, 2);
}
