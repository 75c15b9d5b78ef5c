//! 启动段落的策略动作
//!
//! 启动类动作是唯一允许替换连接句柄的动作：断电/复位先显式
//! 关闭旧连接，再建立新会话。连接与等待提示符的序列包在
//! RetryAction 里，吸收硬件抖动造成的偶发失败。

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use dtp_engine::{
    Action, ActionMeta, Deadline, DispatchError, JobContext, Pipeline, Result, RetryAction,
    RunContext,
};
use dtp_transport::Connection;

/// shell 方式启动
///
/// 内部是一个重试包装的 [连接设备, 等待提示符] 序列，成功后
/// 在数据仓库记录启动结果供后续测试动作查询。
pub struct BootShellAction {
    meta: ActionMeta,
    pipeline: Pipeline,
}

impl BootShellAction {
    pub fn new(_job: &JobContext, params: &Value) -> Self {
        let mut inner = Pipeline::new();
        inner.add_action(Box::new(ConnectDevice::new()));
        inner.add_action(Box::new(WaitForPrompt::new(params)));

        let mut retry = RetryAction::new(
            "boot-connect-retry",
            "带重试地连接设备并等待提示符",
            "重试连接",
            inner,
        );
        if let Some(retries) = params["retries"].as_u64() {
            retry = retry.with_max_retries(retries as u32);
        }

        let mut pipeline = Pipeline::new();
        pipeline.add_action(Box::new(retry));

        Self {
            meta: ActionMeta::new("boot-shell", "通过交互会话启动设备", "shell 启动"),
            pipeline,
        }
    }
}

#[async_trait]
impl Action for BootShellAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }
    fn internal_pipeline(&self) -> Option<&Pipeline> {
        Some(&self.pipeline)
    }
    fn internal_pipeline_mut(&mut self) -> Option<&mut Pipeline> {
        Some(&mut self.pipeline)
    }

    fn validate(&mut self, _job: &JobContext) {}

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let connection = self.pipeline.run_actions(connection, deadline, ctx).await?;

        ctx.store
            .set(&ctx.job.namespace, "boot", "boot-result", json!("success"));

        Ok(connection)
    }
}

/// 建立设备会话
///
/// 已有连接时先显式关闭（断电/复位语义），再按设备描述的
/// connect 命令建立新会话并返回新句柄。
pub struct ConnectDevice {
    meta: ActionMeta,
}

impl ConnectDevice {
    pub fn new() -> Self {
        Self {
            meta: ActionMeta::new("connect-device", "建立到设备的交互会话", "连接设备"),
        }
    }
}

impl Default for ConnectDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ConnectDevice {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, job: &JobContext) {
        if job.device.connect_command().is_none() {
            self.meta.record_error("设备未配置 connect 命令");
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        _deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        // 泄漏打开的旧连接是缺陷：替换前必须关闭
        if let Some(old) = connection {
            info!("关闭原有连接 {}", old.id());
            old.close().await.map_err(DispatchError::from)?;
        }

        let argv = ctx.job.device.connect_command().ok_or_else(|| {
            DispatchError::Configuration("设备未配置 connect 命令".to_string())
        })?;

        let new = Connection::spawn(&argv)?;
        debug!("设备会话已建立: {}", new.id());
        Ok(Some(new))
    }
}

/// 等待登录提示符
pub struct WaitForPrompt {
    meta: ActionMeta,
    /// 段落参数里的提示符覆盖，缺省用设备常量
    prompt_override: Option<String>,
    pattern: Option<Regex>,
}

impl WaitForPrompt {
    pub fn new(params: &Value) -> Self {
        Self {
            meta: ActionMeta::new("wait-for-prompt", "等待设备输出提示符", "等待提示符"),
            prompt_override: params["prompt"].as_str().map(str::to_string),
            pattern: None,
        }
    }
}

#[async_trait]
impl Action for WaitForPrompt {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, job: &JobContext) {
        let prompt = self
            .prompt_override
            .clone()
            .or_else(|| job.device.shell_prompt().map(str::to_string));

        match prompt {
            None => self.meta.record_error("未配置 shell 提示符"),
            Some(prompt) => match Regex::new(&prompt) {
                Ok(pattern) => self.pattern = Some(pattern),
                Err(e) => self
                    .meta
                    .record_error(format!("提示符不是合法的正则表达式: {}", e)),
            },
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        _ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let pattern = self
            .pattern
            .as_ref()
            .ok_or_else(|| DispatchError::Configuration("未配置 shell 提示符".to_string()))?;

        let mut conn = connection
            .ok_or_else(|| DispatchError::Job("等待提示符时没有活动连接".to_string()))?;

        // 敲一下回车促使设备重新输出提示符
        conn.send_line("").await?;
        let output = conn.wait_for(pattern, deadline).await?;
        debug!("匹配到提示符，共读取 {} 字节", output.len());

        Ok(Some(conn))
    }
}
