//! DTP 调度器
//!
//! 设备与任务的认领契约：设备的独占分配通过乐观认领仲裁，
//! 版本冲突时整个认领流程重试，而不是用全局锁串行化——
//! 不同设备的并发认领互不阻塞。

pub mod daemon;
pub mod source;

pub use daemon::SchedulerDaemon;
pub use source::{JobSource, MemoryJobSource, QueuedJob};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 设备标识
pub type DeviceId = String;

/// 设备状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// 空闲，可被认领
    Idle,
    /// 已绑定任务
    Busy,
    /// 维护中，不参与调度
    Offline,
}

/// 调度器错误
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("设备 {0} 不存在")]
    DeviceNotFound(String),

    #[error("设备 {0} 已注册")]
    DeviceExists(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
