//! 策略注册表与流水线组装
//!
//! 一张封闭、可枚举的静态表：(段落类型, 策略, 优先级)。
//! 组装时按文档顺序处理各段落，由选择器选出唯一的策略并
//! 构造对应动作。选择只看设备能力与段落参数，不触碰硬件。

use serde_json::Value;
use tracing::info;

use dtp_common::{DeviceDescriptor, StanzaKind};
use dtp_engine::{select, Action, DispatchError, JobContext, Pipeline, Result, Strategy};

use crate::boot::BootShellAction;
use crate::deploy::{DeployImageAction, DeployTftpAction};
use crate::finalize::FinalizeAction;
use crate::test::TestShellAction;

fn accepts_deploy_image(device: &DeviceDescriptor, params: &Value) -> bool {
    device.has_method(StanzaKind::Deploy, "image") && params["method"].as_str() == Some("image")
}

fn accepts_deploy_tftp(device: &DeviceDescriptor, params: &Value) -> bool {
    device.has_method(StanzaKind::Deploy, "tftp") && params["method"].as_str() == Some("tftp")
}

fn accepts_boot_shell(device: &DeviceDescriptor, params: &Value) -> bool {
    device.has_method(StanzaKind::Boot, "shell") && params["method"].as_str() == Some("shell")
}

fn accepts_test_shell(device: &DeviceDescriptor, params: &Value) -> bool {
    device.has_method(StanzaKind::Test, "shell") && params["method"].as_str() == Some("shell")
}

fn accepts_finalize(_device: &DeviceDescriptor, _params: &Value) -> bool {
    // 收尾对任何设备都适用
    true
}

fn build_deploy_image(job: &JobContext, params: &Value) -> Result<Box<dyn Action>> {
    Ok(Box::new(DeployImageAction::new(job, params)))
}

fn build_deploy_tftp(job: &JobContext, params: &Value) -> Result<Box<dyn Action>> {
    Ok(Box::new(DeployTftpAction::new(job, params)))
}

fn build_boot_shell(job: &JobContext, params: &Value) -> Result<Box<dyn Action>> {
    Ok(Box::new(BootShellAction::new(job, params)))
}

fn build_test_shell(job: &JobContext, params: &Value) -> Result<Box<dyn Action>> {
    Ok(Box::new(TestShellAction::new(job, params)))
}

fn build_finalize(job: &JobContext, params: &Value) -> Result<Box<dyn Action>> {
    Ok(Box::new(FinalizeAction::new(job, params)))
}

/// 全部已注册的策略
///
/// 新增设备能力 = 在此注册新的策略项；同一段落的谓词设计上
/// 互斥，优先级只作歧义时的决胜。
static STRATEGIES: &[Strategy] = &[
    Strategy {
        kind: StanzaKind::Deploy,
        name: "deploy-image",
        priority: 10,
        accepts: accepts_deploy_image,
        build: build_deploy_image,
    },
    Strategy {
        kind: StanzaKind::Deploy,
        name: "deploy-tftp",
        priority: 20,
        accepts: accepts_deploy_tftp,
        build: build_deploy_tftp,
    },
    Strategy {
        kind: StanzaKind::Boot,
        name: "boot-shell",
        priority: 10,
        accepts: accepts_boot_shell,
        build: build_boot_shell,
    },
    Strategy {
        kind: StanzaKind::Test,
        name: "test-shell",
        priority: 10,
        accepts: accepts_test_shell,
        build: build_test_shell,
    },
    Strategy {
        kind: StanzaKind::Finalize,
        name: "finalize",
        priority: 100,
        accepts: accepts_finalize,
        build: build_finalize,
    },
];

pub fn strategies() -> &'static [Strategy] {
    STRATEGIES
}

/// 把任务描述组装成顶层流水线
///
/// 按文档顺序处理各段落；任何段落选不出策略都使整次组装
/// 失败，没有段落全部解析成功的任务不会执行。
pub fn assemble(context: &JobContext) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new();

    for (key, params) in context.parameters.stanzas() {
        let kind = StanzaKind::from_key(&key)
            .ok_or_else(|| DispatchError::Configuration(format!("未知的段落类型: {}", key)))?;

        let strategy = select(STRATEGIES, kind, &context.device, &params)?;
        info!("段落 {} 选用策略 {}", kind, strategy.name);

        pipeline.add_action((strategy.build)(context, &params)?);
    }

    Ok(pipeline)
}
