//! 设备交互会话
//!
//! `Connection` 包装一条到设备的活动会话（串口转发进程、
//! 网络终端等）。句柄同一时刻只有一个持有者，所有权通过
//! 动作的返回值传递，而不是共享可变状态。

use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Result, TransportError};

/// 会话传输 trait
///
/// 所有会话底层实现必须实现此 trait。
#[async_trait]
pub trait Transport: Send {
    /// 写入数据
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// 读取一段输出，截止时间到达后返回超时错误
    async fn read_chunk(&mut self, deadline: Instant) -> Result<Vec<u8>>;

    /// 关闭会话
    async fn close(&mut self) -> Result<()>;
}

/// 基于子进程的会话传输
///
/// 设备描述中的 `commands.connect` 命令被启动为子进程，
/// stdin/stdout 即为会话的双向字节流。
pub struct ProcessTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ProcessTransport {
    /// 启动连接命令并接管其标准输入输出
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TransportError::Spawn("空连接命令".to_string()))?;

        debug!("启动连接进程: {}", argv.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("无法获取连接进程 stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("无法获取连接进程 stdout".to_string()))?;

        Ok(Self { child, stdin, stdout })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stdin.write_all(data).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_chunk(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        let mut buf = [0u8; 4096];
        let n = timeout_at(deadline, self.stdout.read(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout("读取会话输出超时".to_string()))??;

        if n == 0 {
            return Err(TransportError::Closed);
        }

        Ok(buf[..n].to_vec())
    }

    async fn close(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

/// 设备会话句柄
pub struct Connection {
    id: Uuid,
    transport: Box<dyn Transport>,
    /// 已读取但尚未匹配的输出
    buffer: String,
}

impl Connection {
    /// 从已建立的传输创建会话
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let id = Uuid::new_v4();
        info!("建立连接: {}", id);
        Self {
            id,
            transport,
            buffer: String::new(),
        }
    }

    /// 启动连接命令并建立会话
    pub fn spawn(argv: &[String]) -> Result<Self> {
        Ok(Self::new(Box::new(ProcessTransport::spawn(argv)?)))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 发送一行命令（自动附加换行）
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        debug!("发送: {}", line);
        self.transport.write_all(line.as_bytes()).await?;
        self.transport.write_all(b"\n").await?;
        Ok(())
    }

    /// 持续读取输出直到匹配到模式，返回截至匹配位置的全部输出
    ///
    /// 截止时间到达时底层读取被取消并返回超时错误。
    pub async fn wait_for(&mut self, pattern: &Regex, deadline: Instant) -> Result<String> {
        loop {
            if let Some(m) = pattern.find(&self.buffer) {
                let end = m.end();
                let matched: String = self.buffer.drain(..end).collect();
                return Ok(matched);
            }

            let chunk = self.transport.read_chunk(deadline).await?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    /// 关闭会话
    ///
    /// 消耗句柄本身：关闭后的连接不可再被任何动作持有。
    pub async fn close(mut self) -> Result<()> {
        info!("关闭连接: {}", self.id);
        self.transport.close().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_connection_echo_roundtrip() {
        // cat 把 stdin 原样回显到 stdout，模拟交互会话
        let mut conn = Connection::spawn(&argv(&["cat"])).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);

        conn.send_line("hello-device").await.unwrap();
        let pattern = Regex::new("hello-device").unwrap();
        let output = conn.wait_for(&pattern, deadline).await.unwrap();

        assert!(output.contains("hello-device"));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let mut conn = Connection::spawn(&argv(&["cat"])).unwrap();
        let deadline = Instant::now() + Duration::from_millis(200);

        let pattern = Regex::new("never-appears").unwrap();
        let result = conn.wait_for(&pattern, deadline).await;

        assert!(matches!(result, Err(TransportError::Timeout(_))));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_consumes_only_up_to_match() {
        let mut conn = Connection::spawn(&argv(&["cat"])).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);

        conn.send_line("first second").await.unwrap();
        let first = Regex::new("first").unwrap();
        conn.wait_for(&first, deadline).await.unwrap();

        // "second" 仍留在缓冲区中，无需新输出即可匹配
        let second = Regex::new("second").unwrap();
        let output = conn.wait_for(&second, deadline).await.unwrap();
        assert!(output.contains("second"));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_session_reports_closed() {
        let mut conn = Connection::spawn(&argv(&["true"])).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);

        // true 立即退出，读取端应报告会话关闭而不是挂起
        let pattern = Regex::new("anything").unwrap();
        let result = conn.wait_for(&pattern, deadline).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
