//! 跨动作数据仓库
//!
//! 结构为 命名空间 -> 动作名 -> 键 -> 值。键名由协作的动作
//! 双方线下约定，仓库不做任何模式校验。读取缺失键返回
//! None，下游动作把缺失当作"无事可做"，保证可选输入缺席时
//! 的幂等性。

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::debug;

/// 一个命名空间内的数据：动作名 -> 键 -> 值
pub type NamespaceData = HashMap<String, HashMap<String, Value>>;

/// 命名空间快照，供重试动作回滚失败尝试的写入
#[derive(Debug, Clone)]
pub struct NamespaceSnapshot(NamespaceData);

/// 数据仓库
///
/// 同一任务内所有动作共享一个实例；命名空间隔离多设备任务中
/// 相互独立的设备/连接上下文。
#[derive(Debug, Default, Clone)]
pub struct DataStore {
    namespaces: HashMap<String, NamespaceData>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入一个值
    ///
    /// 值以写入方的动作名为坐标，写入后对其他动作只读；
    /// 同一坐标的覆盖写只可能来自写入方自身。
    pub fn set(&mut self, namespace: &str, action: &str, key: &str, value: Value) {
        let slot = self
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .entry(action.to_string())
            .or_default();

        if slot.insert(key.to_string(), value).is_some() {
            debug!("覆盖数据 {}/{}/{}", namespace, action, key);
        }
    }

    /// 读取一个值，缺失返回 None，从不惊慌
    pub fn get(&self, namespace: &str, action: &str, key: &str) -> Option<&Value> {
        self.namespaces
            .get(namespace)?
            .get(action)?
            .get(key)
    }

    /// 为某个命名空间建立快照
    pub fn snapshot(&self, namespace: &str) -> NamespaceSnapshot {
        NamespaceSnapshot(self.namespaces.get(namespace).cloned().unwrap_or_default())
    }

    /// 将命名空间恢复到快照状态
    pub fn restore(&mut self, namespace: &str, snapshot: NamespaceSnapshot) {
        self.namespaces.insert(namespace.to_string(), snapshot.0);
    }

    /// 导出命名空间内的全部数据为扁平的 `动作名.键 -> 值`
    ///
    /// 任务结束时交给结果接收方的元数据就来自这里。
    pub fn export(&self, namespace: &str) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        if let Some(data) = self.namespaces.get(namespace) {
            for (action, entries) in data {
                for (key, value) in entries {
                    out.insert(format!("{}.{}", action, key), value.clone());
                }
            }
        }
        out
    }
}
