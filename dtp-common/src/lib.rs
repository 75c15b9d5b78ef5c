//! DTP 共享类型定义
//!
//! 此 crate 包含引擎、调度器与 CLI 之间共享的描述与报告类型。
//! 任务/设备描述文档在进入引擎之前已被解析为嵌套的 JSON 树，
//! 这里只提供只读的访问封装，不做任何模式校验。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务描述的顶层段落类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StanzaKind {
    /// 部署镜像
    Deploy,
    /// 启动设备
    Boot,
    /// 执行测试
    Test,
    /// 收尾清理
    Finalize,
}

impl StanzaKind {
    /// 从段落键名解析，未知键返回 None
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "deploy" => Some(Self::Deploy),
            "boot" => Some(Self::Boot),
            "test" => Some(Self::Test),
            "finalize" => Some(Self::Finalize),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Boot => "boot",
            Self::Test => "test",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// 所有动作成功完成
    Complete,
    /// 某个动作以致命错误结束
    Incomplete,
    /// 任务被取消
    Canceled,
}

/// 单个动作的执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    /// 尚未执行
    #[default]
    Pending,
    /// 成功
    Success,
    /// 失败
    Failed,
    /// 超时
    TimedOut,
    /// 被取消
    Canceled,
}

/// 任务参数树
///
/// 由任务描述文档解析而来的只读嵌套映射，引擎不读取原始文本。
#[derive(Debug, Clone)]
pub struct JobParameters(Value);

impl JobParameters {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    /// 任务名称，未指定时使用默认值
    pub fn job_name(&self) -> &str {
        self.0["job_name"].as_str().unwrap_or("unnamed-job")
    }

    /// 任务总超时（秒），`timeouts.job` 字段
    pub fn job_timeout_secs(&self) -> Option<u64> {
        self.0["timeouts"]["job"].as_u64()
    }

    /// 顶层段落列表，按文档顺序
    ///
    /// `actions:` 是一个单键映射的序列，每个元素形如 `{deploy: {...}}`。
    /// 返回 (段落键, 段落参数)，键名不在此处解析为 StanzaKind，
    /// 未知键由流水线组装方处理。
    pub fn stanzas(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        if let Some(entries) = self.0["actions"].as_array() {
            for entry in entries {
                if let Some(map) = entry.as_object() {
                    for (key, params) in map {
                        out.push((key.clone(), params.clone()));
                    }
                }
            }
        }
        out
    }

    /// 协议配置块（如多设备协同），缺失时为 None
    pub fn protocols(&self) -> Option<&Value> {
        let value = &self.0["protocols"];
        if value.is_null() {
            None
        } else {
            Some(value)
        }
    }

    /// 多设备协同的角色名（`protocols.multinode.role`）
    pub fn multinode_role(&self) -> Option<&str> {
        self.0["protocols"]["multinode"]["role"].as_str()
    }

    /// 多设备协同的角色表（`protocols.multinode.roles`）
    pub fn multinode_roles(&self) -> Option<&serde_json::Map<String, Value>> {
        self.0["protocols"]["multinode"]["roles"].as_object()
    }
}

/// 设备描述
///
/// 描述硬件能力、每类段落可用的策略方法以及各类常量
/// （提示符、连接命令、超时覆盖等）。构建流水线前创建，此后不再变化。
#[derive(Debug, Clone)]
pub struct DeviceDescriptor(Value);

impl DeviceDescriptor {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    pub fn device_type(&self) -> &str {
        self.0["device_type"].as_str().unwrap_or("unknown")
    }

    /// 某类段落支持的策略方法列表（`actions.<kind>.methods`）
    pub fn methods(&self, kind: StanzaKind) -> Vec<&str> {
        self.0["actions"][kind.as_str()]["methods"]
            .as_array()
            .map(|methods| methods.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn has_method(&self, kind: StanzaKind, method: &str) -> bool {
        self.methods(kind).contains(&method)
    }

    /// 建立交互会话的命令行（`commands.connect`）
    pub fn connect_command(&self) -> Option<Vec<String>> {
        command_argv(&self.0["commands"]["connect"])
    }

    /// 设备断电命令行（`commands.power_off`）
    pub fn power_off_command(&self) -> Option<Vec<String>> {
        command_argv(&self.0["commands"]["power_off"])
    }

    /// 登录后的 shell 提示符（`constants.shell_prompt`）
    pub fn shell_prompt(&self) -> Option<&str> {
        self.0["constants"]["shell_prompt"].as_str()
    }

    /// 目标设备上执行测试脚本用的 shell（`constants.test_shell_cmd`）
    pub fn test_shell_cmd(&self) -> &str {
        self.0["constants"]["test_shell_cmd"]
            .as_str()
            .unwrap_or("/bin/sh")
    }

    /// 单个动作的超时覆盖（`timeouts.actions.<name>`，秒）
    pub fn action_timeout_secs(&self, action_name: &str) -> Option<u64> {
        self.0["timeouts"]["actions"][action_name].as_u64()
    }
}

/// 将命令配置解析为 argv，支持字符串与数组两种写法
fn command_argv(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(line) => {
            let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                None
            } else {
                Some(argv)
            }
        }
        Value::Array(parts) => {
            let argv: Vec<String> = parts
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if argv.is_empty() {
                None
            } else {
                Some(argv)
            }
        }
        _ => None,
    }
}

/// 动作树描述节点
///
/// 任务结束后交给结果接收方的完整流水线描述。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribedAction {
    /// 动作名称
    pub name: String,
    /// 层级编号（如 "2.3.1"）
    pub level: String,
    /// 动作说明
    pub description: String,
    /// 摘要
    pub summary: String,
    /// 执行结果
    pub outcome: ActionOutcome,
    /// 执行耗时（毫秒），未执行时为 None
    pub duration_ms: Option<u64>,
    /// 校验/执行期间累积的错误
    #[serde(default)]
    pub errors: Vec<String>,
    /// 尝试次数（重试动作 > 1）
    pub attempts: u32,
    /// 内部流水线的子动作
    #[serde(default)]
    pub children: Vec<DescribedAction>,
}

/// 校验失败记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFailure {
    /// 动作层级编号
    pub level: String,
    /// 动作名称
    pub action: String,
    /// 错误文本
    pub error: String,
}

/// 任务执行报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// 任务名称
    pub job_name: String,
    /// 任务 ID
    pub job_id: String,
    /// 最终状态
    pub status: JobStatus,
    /// 结束时间（Unix 毫秒时间戳）
    pub finished_at_ms: i64,
    /// 总耗时（毫秒）
    pub duration_ms: u64,
    /// 完整的动作树描述
    pub actions: Vec<DescribedAction>,
    /// 从数据仓库收集的元数据（action.key -> value）
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// 校验阶段的失败记录（任务被拒绝时非空）
    #[serde(default)]
    pub validation_errors: Vec<ValidationFailure>,
}
