//! 任务来源与设备认领
//!
//! `claim` 对同一设备的并发认领必须原子：实现采用带版本号的
//! 比较交换，发现并发修改就把任务放回队列并重试整个认领，
//! 与数据库实现里唯一约束冲突后回滚重试的做法同构。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use dtp_common::JobStatus;

use crate::{DeviceId, DeviceStatus, Result, SchedulerError};

/// 排队中的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    /// 任务 ID
    pub id: String,
    /// 目标设备类型
    pub device_type: String,
    /// 提交时间（Unix 毫秒时间戳）
    pub submitted_at_ms: i64,
    /// 任务参数树
    pub definition: Value,
}

impl QueuedJob {
    pub fn new(device_type: &str, definition: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_type: device_type.to_string(),
            submitted_at_ms: Utc::now().timestamp_millis(),
            definition,
        }
    }
}

/// 任务来源契约
///
/// 轮询守护只依赖这三个操作；认领对同一设备的并发调用者
/// 必须原子，设备非空闲或无排队任务时返回 None 而不是报错。
#[async_trait]
pub trait JobSource: Send + Sync {
    /// 列出当前空闲的设备
    async fn list_idle_devices(&self) -> Vec<DeviceId>;

    /// 尝试为设备认领一个任务
    async fn claim(&self, device: &str) -> Result<Option<QueuedJob>>;

    /// 标记任务终结，设备回到空闲
    async fn complete(&self, device: &str, status: JobStatus) -> Result<()>;
}

/// 单个设备的调度槽位
#[derive(Debug)]
struct DeviceSlot {
    device_type: String,
    status: DeviceStatus,
    current_job: Option<String>,
    /// 乐观并发版本号，每次状态变更递增
    version: u64,
}

/// 内存任务来源
///
/// 每个设备一把独立的锁，不同设备的认领互不阻塞；同一设备的
/// 竞争通过版本比较交换解决。
#[derive(Default)]
pub struct MemoryJobSource {
    devices: RwLock<HashMap<DeviceId, Arc<Mutex<DeviceSlot>>>>,
    queue: Mutex<Vec<QueuedJob>>,
}

impl MemoryJobSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一台设备
    pub async fn add_device(&self, id: &str, device_type: &str) -> Result<()> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(id) {
            return Err(SchedulerError::DeviceExists(id.to_string()));
        }
        info!("注册设备 {} (类型 {})", id, device_type);
        devices.insert(
            id.to_string(),
            Arc::new(Mutex::new(DeviceSlot {
                device_type: device_type.to_string(),
                status: DeviceStatus::Idle,
                current_job: None,
                version: 0,
            })),
        );
        Ok(())
    }

    /// 提交一个任务进队列
    pub async fn submit(&self, job: QueuedJob) {
        debug!("任务 {} 入队 (类型 {})", job.id, job.device_type);
        self.queue.lock().await.push(job);
    }

    /// 当前排队任务数
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn slot(&self, device: &str) -> Result<Arc<Mutex<DeviceSlot>>> {
        self.devices
            .read()
            .await
            .get(device)
            .cloned()
            .ok_or_else(|| SchedulerError::DeviceNotFound(device.to_string()))
    }
}

#[async_trait]
impl JobSource for MemoryJobSource {
    async fn list_idle_devices(&self) -> Vec<DeviceId> {
        let devices = self.devices.read().await;
        let mut idle = Vec::new();
        for (id, slot) in devices.iter() {
            if slot.lock().await.status == DeviceStatus::Idle {
                idle.push(id.clone());
            }
        }
        idle.sort();
        idle
    }

    async fn claim(&self, device: &str) -> Result<Option<QueuedJob>> {
        let slot = self.slot(device).await?;

        loop {
            // 乐观读：记录版本快照，不持锁做后续决策
            let (version, status, device_type) = {
                let slot = slot.lock().await;
                (slot.version, slot.status, slot.device_type.clone())
            };

            if status != DeviceStatus::Idle {
                return Ok(None);
            }

            // 按提交顺序取第一个匹配设备类型的任务
            let job = {
                let mut queue = self.queue.lock().await;
                match queue.iter().position(|j| j.device_type == device_type) {
                    Some(position) => queue.remove(position),
                    None => return Ok(None),
                }
            };

            // 比较交换：版本变了说明有并发认领抢先，放回任务
            // 重试整个认领
            {
                let mut slot = slot.lock().await;
                if slot.version == version && slot.status == DeviceStatus::Idle {
                    slot.status = DeviceStatus::Busy;
                    slot.current_job = Some(job.id.clone());
                    slot.version += 1;
                    info!("设备 {} 认领任务 {}", device, job.id);
                    return Ok(Some(job));
                }
            }

            debug!("设备 {} 认领冲突，重试", device);
            self.queue.lock().await.insert(0, job);
        }
    }

    async fn complete(&self, device: &str, status: JobStatus) -> Result<()> {
        let slot = self.slot(device).await?;
        let mut slot = slot.lock().await;

        info!(
            "设备 {} 的任务 {:?} 终结: {:?}",
            device, slot.current_job, status
        );
        slot.status = DeviceStatus::Idle;
        slot.current_job = None;
        slot.version += 1;
        Ok(())
    }
}
