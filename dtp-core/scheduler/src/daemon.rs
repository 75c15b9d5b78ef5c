//! 轮询守护
//!
//! 以固定间隔轮询任务来源：列出空闲设备，逐台尝试认领，
//! 把认领到的任务交给外部处理器。守护本身不运行任务。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{JobSource, QueuedJob};
use crate::DeviceId;

/// 调度轮询守护
pub struct SchedulerDaemon<S: JobSource> {
    source: Arc<S>,
    interval: Duration,
}

impl<S: JobSource> SchedulerDaemon<S> {
    pub fn new(source: Arc<S>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// 轮询一次，返回本轮认领到的 (设备, 任务) 列表
    pub async fn poll_once(&self) -> Vec<(DeviceId, QueuedJob)> {
        let mut claimed = Vec::new();

        for device in self.source.list_idle_devices().await {
            match self.source.claim(&device).await {
                Ok(Some(job)) => {
                    info!("轮询认领: 设备 {} <- 任务 {}", device, job.id);
                    claimed.push((device, job));
                }
                Ok(None) => debug!("设备 {} 无任务可认领", device),
                Err(e) => warn!("设备 {} 认领失败: {}", device, e),
            }
        }

        claimed
    }

    /// 以固定间隔持续轮询，直到取消令牌触发
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, mut handler: F)
    where
        F: FnMut(DeviceId, QueuedJob) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        info!("调度守护启动，轮询间隔 {:?}", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("调度守护退出");
                    break;
                }
                _ = ticker.tick() => {
                    for (device, job) in self.poll_once().await {
                        handler(device, job).await;
                    }
                }
            }
        }
    }
}
