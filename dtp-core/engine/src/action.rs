//! 动作执行契约
//!
//! 每个动作都经历两个阶段：`validate` 检查静态前置条件并累积
//! 错误，`run` 执行实际工作。整棵树先完成校验再开始执行，
//! 两个阶段绝不交错。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dtp_common::{ActionOutcome, DeviceDescriptor, JobParameters};
use dtp_transport::Connection;

use crate::pipeline::Pipeline;
use crate::store::DataStore;
use crate::{Result, DEFAULT_ACTION_TIMEOUT};

/// 绝对截止时间，沿流水线树向下传递
pub type Deadline = tokio::time::Instant;

/// 动作元信息
///
/// `level` 与 `errors` 是构建完成后唯一允许变化的字段
/// （前者在组装期赋值，后者在校验/执行期累积），
/// 执行统计（outcome/duration/attempts）在 run 阶段记录。
#[derive(Debug, Clone)]
pub struct ActionMeta {
    /// 动作名称，同一类型内唯一
    pub name: String,
    /// 说明
    pub description: String,
    /// 摘要
    pub summary: String,
    /// 层级编号（如 "2.3.1"），组装期赋值
    pub level: String,
    /// 超时预算，父动作的截止时间是聚合上界
    pub timeout: Duration,
    /// 校验/执行期间累积的错误
    pub errors: Vec<String>,
    /// 执行结果
    pub outcome: ActionOutcome,
    /// 执行耗时
    pub duration: Option<Duration>,
    /// 尝试次数（仅重试动作会大于 1）
    pub attempts: u32,
}

impl ActionMeta {
    pub fn new(name: &str, description: &str, summary: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            summary: summary.to_string(),
            level: String::new(),
            timeout: DEFAULT_ACTION_TIMEOUT,
            errors: Vec::new(),
            outcome: ActionOutcome::Pending,
            duration: None,
            attempts: 1,
        }
    }

    /// 记录一个校验/执行错误，不中断当前阶段
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// 任务级只读上下文
///
/// 参数树与设备描述在流水线构建前创建，此后不再变化。
pub struct JobContext {
    /// 任务参数树
    pub parameters: JobParameters,
    /// 设备描述
    pub device: DeviceDescriptor,
    /// 本任务在数据仓库中的命名空间
    pub namespace: String,
    /// 产物输出目录
    pub output_dir: PathBuf,
}

/// 执行期可变上下文
pub struct RunContext<'a> {
    /// 任务级只读上下文
    pub job: &'a JobContext,
    /// 跨动作数据仓库
    pub store: &'a mut DataStore,
    /// 协作式取消令牌
    pub cancel: &'a CancellationToken,
}

/// 动作 trait
///
/// 动作可以是叶子，也可以通过 `internal_pipeline` 持有内部
/// 流水线。连接句柄按值传入 `run` 并按值返回：只有启动类
/// 动作允许返回不同的句柄，其余动作必须原样返回。
#[async_trait]
pub trait Action: Send {
    fn meta(&self) -> &ActionMeta;

    fn meta_mut(&mut self) -> &mut ActionMeta;

    /// 本动作的总预算，外层流水线据此计算截止时间
    ///
    /// 默认等于 `meta().timeout`；把超时预算另作解释的动作
    /// （如按次计时的重试动作）覆盖此方法。
    fn total_budget(&self) -> Duration {
        self.meta().timeout
    }

    /// 内部流水线（只读），叶子动作返回 None
    fn internal_pipeline(&self) -> Option<&Pipeline> {
        None
    }

    /// 内部流水线（可变）
    fn internal_pipeline_mut(&mut self) -> Option<&mut Pipeline> {
        None
    }

    /// 校验静态前置条件
    ///
    /// 失败追加到 `meta_mut().errors`，不得中断校验遍历；
    /// 可恢复形态的问题也在这里累积而不是抛出，保证一趟
    /// 校验报告任务的全部问题。
    fn validate(&mut self, job: &JobContext);

    /// 执行动作
    ///
    /// 接收当前连接（可能没有）与绝对截止时间，返回（可能被
    /// 替换的）连接供下一个兄弟动作使用。
    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>>;
}
