//! 收尾段落的策略动作

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use dtp_engine::{Action, ActionMeta, Deadline, DispatchError, JobContext, Result, RunContext};
use dtp_transport::{run_command_checked, Connection, TransportError};

/// 任务收尾
///
/// 关闭仍然打开的连接并执行设备断电命令。断电失败意味着
/// 台架损坏，按基础设施错误处理，绝不重试。
pub struct FinalizeAction {
    meta: ActionMeta,
}

impl FinalizeAction {
    pub fn new(_job: &JobContext, _params: &Value) -> Self {
        Self {
            meta: ActionMeta::new("finalize", "关闭连接并将设备断电", "任务收尾"),
        }
    }
}

#[async_trait]
impl Action for FinalizeAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, _job: &JobContext) {}

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        // 断电前必须显式关闭连接
        if let Some(conn) = connection {
            info!("收尾: 关闭连接 {}", conn.id());
            conn.close().await.map_err(DispatchError::from)?;
        }

        if let Some(argv) = ctx.job.device.power_off_command() {
            debug!("执行断电命令: {}", argv.join(" "));
            run_command_checked(&argv, deadline)
                .await
                .map_err(|e| match e {
                    TransportError::Timeout(msg) => {
                        // 断电超时说明台架损坏，不是设备抖动
                        DispatchError::Infrastructure(format!("设备断电超时: {}", msg))
                    }
                    other => DispatchError::Infrastructure(format!("设备断电失败: {}", other)),
                })?;
        }

        Ok(None)
    }
}
