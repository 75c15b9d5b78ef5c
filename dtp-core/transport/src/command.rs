//! 外部命令执行
//!
//! 引擎中所有外部进程（镜像打包、压缩、挂载检查等）都经由这里
//! 执行：调用方传入绝对截止时间，到期后进程被强制终止。

use std::process::Stdio;

use tokio::process::Command;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::{Result, TransportError};

/// 命令执行输出
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// 标准输出
    pub stdout: String,
    /// 标准错误
    pub stderr: String,
    /// 退出码
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// 检查命令是否成功执行
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// 获取合并的输出（stdout + stderr）
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// 执行外部命令，到达截止时间后强制终止进程
///
/// argv 的第一个元素为程序名。进程句柄设置了 kill_on_drop，
/// 超时分支丢弃句柄即触发 SIGKILL，不存在残留子进程。
pub async fn run_command(argv: &[String], deadline: Instant) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| TransportError::Spawn("空命令行".to_string()))?;

    debug!("执行命令: {}", argv.join(" "));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| TransportError::Spawn(format!("{}: {}", program, e)))?;

    let output = timeout_at(deadline, child.wait_with_output())
        .await
        .map_err(|_| TransportError::Timeout(format!("命令执行超时: {}", argv.join(" "))))??;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        exit_code: output.status.code(),
    };

    debug!(
        "命令执行完成, 退出码: {:?}, stdout 长度: {}, stderr 长度: {}",
        result.exit_code,
        result.stdout.len(),
        result.stderr.len()
    );

    Ok(result)
}

/// 执行命令并检查是否成功
pub async fn run_command_checked(argv: &[String], deadline: Instant) -> Result<CommandOutput> {
    let output = run_command(argv, deadline).await?;

    if !output.is_success() {
        return Err(TransportError::CommandFailed {
            code: output.exit_code,
            detail: if output.stderr.is_empty() {
                output.stdout
            } else {
                output.stderr
            },
        });
    }

    Ok(output)
}
