//! DTP 执行引擎
//!
//! 测试任务的流水线执行引擎：策略选择、动作树组装、两阶段
//! 校验/执行、层级化超时预算、重试语义与跨动作数据共享。

pub mod action;
pub mod job;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod strategy;

pub use action::{Action, ActionMeta, Deadline, JobContext, RunContext};
pub use job::Job;
pub use pipeline::Pipeline;
pub use retry::RetryAction;
pub use store::{DataStore, NamespaceSnapshot};
pub use strategy::{select, Strategy};

use std::time::Duration;

use thiserror::Error;

use dtp_transport::TransportError;

/// 动作的默认超时预算
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(300);

/// 任务的默认总超时
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

/// 重试动作的默认重试上限
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 两次重试之间的默认间隔
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// 执行错误
///
/// 是否可重试是每种错误类别的固定属性（见 `is_retryable`），
/// 而不是调用点各自推断：配置与环境错误永不重试，任务级
/// 失败与超时可以被 RetryAction 吸收。
#[derive(Error, Debug)]
pub enum DispatchError {
    /// 构建期错误：没有策略匹配或必要参数缺失
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 支撑环境损坏（缺工具、未挂载、传输不可达）
    #[error("基础设施错误: {0}")]
    Infrastructure(String),

    /// 任务本身失败（镜像损坏、启动输出异常、命令失败）
    #[error("任务错误: {0}")]
    Job(String),

    /// 截止时间到达
    #[error("超时: {0}")]
    Timeout(String),

    /// 重试耗尽后由最后一次错误转化而来，不可再重试
    #[error("重试 {attempts} 次后仍失败: {last}")]
    RetriesExceeded {
        attempts: u32,
        #[source]
        last: Box<DispatchError>,
    },

    /// 任务被取消
    #[error("任务已取消")]
    Canceled,
}

impl DispatchError {
    /// 此错误是否允许 RetryAction 重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Job(_) | Self::Timeout(_))
    }
}

impl From<TransportError> for DispatchError {
    fn from(err: TransportError) -> Self {
        match err {
            // 超时默认按可重试处理；判定为设备台架损坏的调用点
            // 应当自行构造 Infrastructure
            TransportError::Timeout(msg) => Self::Timeout(msg),
            TransportError::CommandFailed { .. } => Self::Job(err.to_string()),
            TransportError::Spawn(_) | TransportError::Closed | TransportError::Io(_) => {
                Self::Infrastructure(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification_is_declared() {
        assert!(DispatchError::Job("x".into()).is_retryable());
        assert!(DispatchError::Timeout("x".into()).is_retryable());
        assert!(!DispatchError::Configuration("x".into()).is_retryable());
        assert!(!DispatchError::Infrastructure("x".into()).is_retryable());
        assert!(!DispatchError::Canceled.is_retryable());
        assert!(!DispatchError::RetriesExceeded {
            attempts: 3,
            last: Box::new(DispatchError::Job("x".into())),
        }
        .is_retryable());
    }

    #[test]
    fn test_transport_error_mapping() {
        let err: DispatchError = TransportError::Timeout("读取超时".into()).into();
        assert!(err.is_retryable());

        let err: DispatchError = TransportError::Spawn("tar".into()).into();
        assert!(matches!(err, DispatchError::Infrastructure(_)));

        let err: DispatchError = TransportError::CommandFailed {
            code: Some(1),
            detail: "bad".into(),
        }
        .into();
        assert!(matches!(err, DispatchError::Job(_)));
    }
}
