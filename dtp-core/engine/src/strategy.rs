//! 策略选择
//!
//! 每个段落类型注册若干候选策略，组成一张封闭、可枚举的
//! 静态表。选择纯粹基于设备能力与段落参数，绝不触碰硬件或
//! 文件系统；没有策略匹配时整条流水线组装失败。

use serde_json::Value;
use tracing::warn;

use dtp_common::{DeviceDescriptor, StanzaKind};

use crate::action::{Action, JobContext};
use crate::{DispatchError, Result};

/// 一条策略注册项
///
/// `accepts` 必须是纯谓词；设计上要求同段落的谓词互斥，
/// 多个策略接受同一输入属于配置歧义，按优先级取舍并告警。
pub struct Strategy {
    /// 适用的段落类型
    pub kind: StanzaKind,
    /// 策略名称
    pub name: &'static str,
    /// 优先级，数值越小越优先
    pub priority: u32,
    /// 接受谓词：检查设备能力列表与段落参数
    pub accepts: fn(&DeviceDescriptor, &Value) -> bool,
    /// 构造对应的动作（含其内部流水线）
    pub build: fn(&JobContext, &Value) -> Result<Box<dyn Action>>,
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// 为一个段落选出唯一的策略
///
/// 按优先级顺序求值各候选的接受谓词，第一个接受者胜出；
/// 无人接受返回配置错误（指明段落类型），对流水线组装是
/// 致命的。
pub fn select<'a>(
    table: &'a [Strategy],
    kind: StanzaKind,
    device: &DeviceDescriptor,
    parameters: &Value,
) -> Result<&'a Strategy> {
    let mut candidates: Vec<&Strategy> = table
        .iter()
        .filter(|s| s.kind == kind && (s.accepts)(device, parameters))
        .collect();
    candidates.sort_by_key(|s| s.priority);

    if candidates.len() > 1 {
        let names: Vec<&str> = candidates.iter().map(|s| s.name).collect();
        warn!(
            "段落 {} 有多个策略接受当前参数: {:?}，按优先级选用 {}",
            kind, names, candidates[0].name
        );
    }

    candidates.into_iter().next().ok_or_else(|| {
        DispatchError::Configuration(format!("段落 {} 没有策略接受当前设备与参数", kind))
    })
}
