//! 重试动作
//!
//! RetryAction 以组合方式包装一条内部流水线（而不是被包装者的
//! 子类型）：可重试的失败被就地吸收并重新执行，致命失败原样
//! 向上传播。它是引擎中唯一做本地恢复的位置。

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use dtp_transport::Connection;

use crate::action::{Action, ActionMeta, Deadline, JobContext, RunContext};
use crate::pipeline::Pipeline;
use crate::{DispatchError, Result, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL};

/// 带重试的复合动作
pub struct RetryAction {
    meta: ActionMeta,
    pipeline: Pipeline,
    max_retries: u32,
    interval: Duration,
}

impl RetryAction {
    pub fn new(name: &str, description: &str, summary: &str, pipeline: Pipeline) -> Self {
        Self {
            meta: ActionMeta::new(name, description, summary),
            pipeline,
            max_retries: DEFAULT_MAX_RETRIES,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl Action for RetryAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    /// meta 里的超时是单次尝试的预算，总预算要乘上重试次数
    /// 再加上尝试间的等待
    fn total_budget(&self) -> Duration {
        self.meta.timeout * self.max_retries
            + self.interval * self.max_retries.saturating_sub(1)
    }

    fn internal_pipeline(&self) -> Option<&Pipeline> {
        Some(&self.pipeline)
    }

    fn internal_pipeline_mut(&mut self) -> Option<&mut Pipeline> {
        Some(&mut self.pipeline)
    }

    fn validate(&mut self, _job: &JobContext) {
        if self.max_retries == 0 {
            self.meta.record_error("重试上限必须至少为 1");
        }
    }

    async fn run(
        &mut self,
        mut connection: Option<Connection>,
        parent_deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let mut last_error: Option<DispatchError> = None;

        for attempt in 1..=self.max_retries {
            if ctx.cancel.is_cancelled() {
                return Err(DispatchError::Canceled);
            }

            self.meta.attempts = attempt;

            // 每次尝试的截止时间独立计算，但绝不超过父预算
            let attempt_deadline =
                std::cmp::min(parent_deadline, Deadline::now() + self.meta.timeout);

            // 失败尝试写入的数据不允许泄漏到下一次尝试；
            // 硬件侧的副作用无法回滚，尽力而为
            let checkpoint = ctx.store.snapshot(&ctx.job.namespace);

            match self
                .pipeline
                .run_actions(connection.take(), attempt_deadline, ctx)
                .await
            {
                Ok(conn) => return Ok(conn),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(
                        "动作 {} 第 {}/{} 次尝试失败: {}",
                        self.meta.name, attempt, self.max_retries, err
                    );
                    self.meta
                        .record_error(format!("第 {} 次尝试: {}", attempt, err));
                    ctx.store.restore(&ctx.job.namespace, checkpoint);
                    last_error = Some(err);

                    if attempt < self.max_retries {
                        if Deadline::now() + self.interval >= parent_deadline {
                            // 父预算不足以再来一轮
                            break;
                        }
                        tokio::time::sleep(self.interval).await;
                    }
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| DispatchError::Job("重试循环未执行任何尝试".to_string()));
        Err(DispatchError::RetriesExceeded {
            attempts: self.meta.attempts,
            last: Box::new(last),
        })
    }
}
