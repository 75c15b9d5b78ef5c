//! 任务驱动
//!
//! 持有整棵动作树、数据仓库与取消令牌，依次完成整树校验与
//! 整树执行两个阶段，最终产出交给结果接收方的任务报告。

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use dtp_common::{JobReport, JobStatus, ValidationFailure};

use crate::action::{Deadline, JobContext, RunContext};
use crate::pipeline::Pipeline;
use crate::store::DataStore;
use crate::{DispatchError, DEFAULT_JOB_TIMEOUT};

/// 一次测试任务
///
/// 每个任务独占自己的流水线、连接与数据仓库实例，任务之间
/// 不共享任何状态。
pub struct Job {
    id: Uuid,
    context: JobContext,
    pipeline: Pipeline,
    store: DataStore,
    cancel: CancellationToken,
}

impl Job {
    /// 由组装完成的流水线创建任务
    ///
    /// 此处一次性完成层级编号与设备超时覆盖，此后树结构不再
    /// 变化。
    pub fn new(context: JobContext, mut pipeline: Pipeline) -> Self {
        pipeline.assign_levels("");
        pipeline.apply_timeouts(&context.device);

        Self {
            id: Uuid::new_v4(),
            context,
            pipeline,
            store: DataStore::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// 取消令牌的克隆，供外部请求协作式取消
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 整树校验
    ///
    /// 一趟遍历收集全部问题；返回非空即任务无效，任何动作的
    /// run 阶段都不会开始。
    pub fn validate(&mut self) -> Vec<ValidationFailure> {
        self.pipeline.validate(&self.context);
        let mut failures = Vec::new();
        self.pipeline.collect_failures(&mut failures);
        failures
    }

    /// 执行任务
    ///
    /// 先整树校验，校验不通过直接拒绝；然后以任务总超时为根
    /// 预算执行整树，结束后收集描述与元数据产出报告。
    pub async fn run(&mut self) -> JobReport {
        let job_name = self.context.parameters.job_name().to_string();
        let started = std::time::Instant::now();

        info!("任务 {} ({}) 开始", job_name, self.id);

        let failures = self.validate();
        if !failures.is_empty() {
            error!("任务 {} 校验失败，共 {} 个错误", job_name, failures.len());
            return self.report(JobStatus::Incomplete, started, failures);
        }

        let job_timeout = self
            .context
            .parameters
            .job_timeout_secs()
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_JOB_TIMEOUT);
        let deadline = Deadline::now() + job_timeout;

        let mut ctx = RunContext {
            job: &self.context,
            store: &mut self.store,
            cancel: &self.cancel,
        };

        let status = match self.pipeline.run_actions(None, deadline, &mut ctx).await {
            Ok(leftover) => {
                if let Some(connection) = leftover {
                    // 泄漏的打开连接是缺陷：收尾动作应当显式关闭
                    error!("任务结束时连接 {} 仍然打开，强制关闭", connection.id());
                    let _ = connection.close().await;
                }
                JobStatus::Complete
            }
            Err(DispatchError::Canceled) => {
                info!("任务 {} 被取消", job_name);
                JobStatus::Canceled
            }
            Err(err) => {
                error!("任务 {} 失败: {}", job_name, err);
                JobStatus::Incomplete
            }
        };

        info!(
            "任务 {} 结束: {:?}, 耗时 {} 毫秒",
            job_name,
            status,
            started.elapsed().as_millis()
        );

        self.report(status, started, Vec::new())
    }

    fn report(
        &self,
        status: JobStatus,
        started: std::time::Instant,
        validation_errors: Vec<ValidationFailure>,
    ) -> JobReport {
        JobReport {
            job_name: self.context.parameters.job_name().to_string(),
            job_id: self.id.to_string(),
            status,
            finished_at_ms: Utc::now().timestamp_millis(),
            duration_ms: started.elapsed().as_millis() as u64,
            actions: self.pipeline.describe(),
            metadata: self.store.export(&self.context.namespace),
            validation_errors,
        }
    }
}
