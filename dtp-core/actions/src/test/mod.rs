//! 测试段落的策略动作

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use dtp_engine::{Action, ActionMeta, Deadline, DispatchError, JobContext, Result, RunContext};
use dtp_transport::Connection;

/// 通过交互会话执行测试定义
///
/// 逐条把测试步骤写入会话，最后发出结束信号并等待其回显，
/// 确认设备消费完了全部命令。测试动作不替换连接，原样返回
/// 收到的句柄。
pub struct TestShellAction {
    meta: ActionMeta,
    definitions: Vec<(String, Vec<String>)>,
}

impl TestShellAction {
    pub fn new(_job: &JobContext, params: &Value) -> Self {
        let definitions = params["definitions"]
            .as_array()
            .map(|defs| {
                defs.iter()
                    .map(|def| {
                        let name = def["name"].as_str().unwrap_or_default().to_string();
                        let steps = def["steps"]
                            .as_array()
                            .map(|steps| {
                                steps
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default();
                        (name, steps)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            meta: ActionMeta::new("test-shell", "通过交互会话执行测试定义", "shell 测试"),
            definitions,
        }
    }
}

#[async_trait]
impl Action for TestShellAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, _job: &JobContext) {
        if self.definitions.is_empty() {
            self.meta.record_error("测试段落未包含任何测试定义");
        }
        for (name, _steps) in &self.definitions {
            if name.is_empty() {
                self.meta.record_error("测试定义缺少名称");
            }
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let mut conn = connection
            .ok_or_else(|| DispatchError::Job("执行测试时没有活动连接".to_string()))?;

        for (name, steps) in &self.definitions {
            info!("执行测试定义 {} ({} 步)", name, steps.len());

            for step in steps {
                conn.send_line(step).await?;
            }

            // 结束信号回显后才认为该定义的命令全部被消费
            let marker = format!("<DTP_SIGNAL_ENDRUN {}>", name);
            conn.send_line(&format!("echo '{}'", marker)).await?;

            let pattern = Regex::new(&regex::escape(&marker))
                .map_err(|e| DispatchError::Job(format!("无法构造结束信号模式: {}", e)))?;
            let output = conn.wait_for(&pattern, deadline).await?;
            debug!("测试定义 {} 完成，读取 {} 字节输出", name, output.len());

            ctx.store.set(
                &ctx.job.namespace,
                "test-shell",
                &format!("results.{}", name),
                json!({
                    "steps": steps.len(),
                    "result": "complete",
                }),
            );
        }

        Ok(Some(conn))
    }
}
