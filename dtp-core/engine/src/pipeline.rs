//! 流水线
//!
//! 有序的动作序列，由父动作（或任务根部）独占持有。动作可以
//! 嵌套内部流水线，整体构成一棵树。校验与执行都严格按照
//! 组装顺序遍历子动作。

use std::collections::HashSet;

use tokio::time::timeout_at;
use tracing::{debug, error};

use dtp_common::{ActionOutcome, DescribedAction, DeviceDescriptor, ValidationFailure};
use dtp_transport::Connection;

use crate::action::{Action, Deadline, JobContext, RunContext};
use crate::{DispatchError, Result};

/// 动作流水线
///
/// 空流水线合法（等价于空操作）；非空流水线内同级子动作
/// 名称必须互异，违反时在校验阶段报告。
#[derive(Default)]
pub struct Pipeline {
    children: Vec<Box<dyn Action>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个子动作，执行顺序即追加顺序
    pub fn add_action(&mut self, action: Box<dyn Action>) {
        self.children.push(action);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// 同级子动作的名称，按执行顺序
    pub fn child_names(&self) -> Vec<String> {
        self.children
            .iter()
            .map(|child| child.meta().name.clone())
            .collect()
    }

    /// 自顶向下为整棵树赋层级编号
    ///
    /// 根部传入空串得到 "1"、"2"…，内部流水线得到
    /// "2.1"、"2.1.1" 这样的编号；编号按执行顺序单调递增，
    /// 且唯一标识一个节点。
    pub fn assign_levels(&mut self, base: &str) {
        for (index, child) in self.children.iter_mut().enumerate() {
            let level = if base.is_empty() {
                format!("{}", index + 1)
            } else {
                format!("{}.{}", base, index + 1)
            };
            child.meta_mut().level = level.clone();

            if let Some(pipeline) = child.internal_pipeline_mut() {
                pipeline.assign_levels(&level);
            }
        }
    }

    /// 应用设备描述中的超时覆盖（`timeouts.actions.<name>`）
    pub fn apply_timeouts(&mut self, device: &DeviceDescriptor) {
        for child in &mut self.children {
            if let Some(secs) = device.action_timeout_secs(&child.meta().name) {
                child.meta_mut().timeout = std::time::Duration::from_secs(secs);
            }
            if let Some(pipeline) = child.internal_pipeline_mut() {
                pipeline.apply_timeouts(device);
            }
        }
    }

    /// 校验整棵子树
    ///
    /// 按顺序访问每个子动作，即使前面的子动作已记录错误也
    /// 无条件继续，使一趟校验报告全部问题。
    pub fn validate(&mut self, job: &JobContext) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut duplicated: Vec<usize> = Vec::new();
        for (index, child) in self.children.iter().enumerate() {
            if !seen.insert(child.meta().name.clone()) {
                duplicated.push(index);
            }
        }
        for index in duplicated {
            let name = self.children[index].meta().name.clone();
            self.children[index]
                .meta_mut()
                .record_error(format!("同级重复的动作名称: {}", name));
        }

        for child in &mut self.children {
            child.validate(job);
            if let Some(pipeline) = child.internal_pipeline_mut() {
                pipeline.validate(job);
            }
        }
    }

    /// 收集整棵子树的校验失败记录
    pub fn collect_failures(&self, out: &mut Vec<ValidationFailure>) {
        for child in &self.children {
            let meta = child.meta();
            for error in &meta.errors {
                out.push(ValidationFailure {
                    level: meta.level.clone(),
                    action: meta.name.clone(),
                    error: error.clone(),
                });
            }
            if let Some(pipeline) = child.internal_pipeline() {
                pipeline.collect_failures(out);
            }
        }
    }

    /// 按组装顺序执行子动作，贯穿连接句柄
    ///
    /// 每个子动作的截止时间取父截止时间与自身预算的较小者，
    /// 任何后代都无法静默超出祖先的预算。子动作致命失败时
    /// 中止剩余兄弟并向上传播。
    pub async fn run_actions(
        &mut self,
        mut connection: Option<Connection>,
        parent_deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        for child in &mut self.children {
            if ctx.cancel.is_cancelled() {
                child.meta_mut().outcome = ActionOutcome::Canceled;
                return Err(DispatchError::Canceled);
            }

            let name = child.meta().name.clone();
            let level = child.meta().level.clone();
            let budget = child.total_budget();
            let deadline = std::cmp::min(parent_deadline, Deadline::now() + budget);
            let incoming = connection.as_ref().map(|c| c.id());

            debug!("执行动作 {} ({})", name, level);
            let started = std::time::Instant::now();
            let result = timeout_at(deadline, child.run(connection.take(), deadline, ctx)).await;
            let elapsed = started.elapsed();

            let meta = child.meta_mut();
            meta.duration = Some(elapsed);

            match result {
                Ok(Ok(next)) => {
                    meta.outcome = ActionOutcome::Success;
                    if let (Some(before), Some(after)) = (incoming, next.as_ref().map(|c| c.id())) {
                        if before != after {
                            debug!("动作 {} 替换了连接: {} -> {}", name, before, after);
                        }
                    }
                    connection = next;
                }
                Ok(Err(err)) => {
                    meta.outcome = if matches!(err, DispatchError::Canceled) {
                        ActionOutcome::Canceled
                    } else {
                        ActionOutcome::Failed
                    };
                    meta.record_error(err.to_string());
                    error!("动作 {} ({}) 失败: {}", name, level, err);
                    return Err(err);
                }
                Err(_elapsed) => {
                    // 强制终止：未完成的 run 被丢弃，其中的子进程
                    // 随句柄销毁被杀死
                    meta.outcome = ActionOutcome::TimedOut;
                    let err =
                        DispatchError::Timeout(format!("动作 {} 超过 {:?} 预算", name, budget));
                    meta.record_error(err.to_string());
                    error!("动作 {} ({}) 超时", name, level);
                    return Err(err);
                }
            }
        }

        Ok(connection)
    }

    /// 描述整棵子树，供结果接收方消费
    pub fn describe(&self) -> Vec<DescribedAction> {
        self.children
            .iter()
            .map(|child| {
                let meta = child.meta();
                DescribedAction {
                    name: meta.name.clone(),
                    level: meta.level.clone(),
                    description: meta.description.clone(),
                    summary: meta.summary.clone(),
                    outcome: meta.outcome,
                    duration_ms: meta.duration.map(|d| d.as_millis() as u64),
                    errors: meta.errors.clone(),
                    attempts: meta.attempts,
                    children: child
                        .internal_pipeline()
                        .map(|p| p.describe())
                        .unwrap_or_default(),
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("children", &self.child_names())
            .finish()
    }
}
