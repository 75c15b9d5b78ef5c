//! DTP 传输层
//!
//! 负责与设备的交互会话以及外部进程的执行。所有阻塞操作统一
//! 使用"带截止时间执行、到期强制终止"的原语，不允许各处自行
//! 实现超时循环。

pub mod command;
pub mod connection;

pub use command::{run_command, run_command_checked, CommandOutput};
pub use connection::{Connection, ProcessTransport, Transport};

use thiserror::Error;

/// 传输层错误
///
/// 超时与环境故障是不同的错误类别：到期的命令/读取返回
/// `Timeout`，进程无法启动或会话意外关闭属于环境故障，
/// 由上层判定为不可重试。
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("启动进程失败: {0}")]
    Spawn(String),

    #[error("命令执行失败 (退出码 {code:?}): {detail}")]
    CommandFailed { code: Option<i32>, detail: String },

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("连接已关闭")]
    Closed,

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
