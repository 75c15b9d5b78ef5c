//! 测试支撑 overlay 的构建
//!
//! OverlayAction 在私有暂存目录里搭好固定的目录骨架并放入
//! 支撑脚本；嵌套的子动作各自幂等地扩充暂存树；最后
//! CompressOverlay 打包成单个产物并把路径写入数据仓库，
//! 由部署方式各异的应用动作稍后取出。构建与应用两阶段分离，
//! 因为打包时目标文件系统不一定可用。

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use dtp_engine::{
    Action, ActionMeta, Deadline, DispatchError, JobContext, Pipeline, Result, RunContext,
};
use dtp_transport::{run_command_checked, Connection, TransportError};

/// 通用支撑脚本，写入 overlay 的 bin/ 目录
const SUPPORT_SCRIPTS: &[(&str, &str)] = &[
    ("dtp-test-runner", include_str!("../../support/dtp-test-runner")),
    ("dtp-test-case", include_str!("../../support/dtp-test-case")),
    ("dtp-background", include_str!("../../support/dtp-background")),
];

/// 多设备协同脚本，仅在任务声明了角色时写入
const MULTINODE_SCRIPTS: &[(&str, &str)] = &[
    ("dtp-role", include_str!("../../support/multinode/dtp-role")),
    ("dtp-group", include_str!("../../support/multinode/dtp-group")),
    ("dtp-sync", include_str!("../../support/multinode/dtp-sync")),
];

/// 写入一个支撑脚本：解释器行改写为设备配置的 shell，权限 0755
pub(crate) fn write_script(
    path: &Path,
    shell: &str,
    prelude: Option<&str>,
    body: &str,
) -> std::io::Result<()> {
    let mut content = format!("#!{}\n\n", shell);
    if let Some(prelude) = prelude {
        content.push_str(prelude);
        content.push('\n');
    }
    content.push_str(body);

    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// 从数据仓库取出 overlay 暂存目录
///
/// 缺失说明上游顺序有错，必须大声失败而不是跳过。
fn overlay_location(ctx: &RunContext<'_>) -> Result<std::path::PathBuf> {
    let location = ctx
        .store
        .get(&ctx.job.namespace, "overlay", "location")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            DispatchError::Infrastructure("缺少 overlay 暂存目录记录，上游顺序错误".to_string())
        })?;

    let path = std::path::PathBuf::from(location);
    if !path.exists() {
        return Err(DispatchError::Infrastructure(format!(
            "overlay 暂存目录不存在: {}",
            path.display()
        )));
    }
    Ok(path)
}

/// overlay 构建的根复合动作
///
/// 自身负责目录骨架与通用脚本，内部流水线依次执行多设备
/// 脚本、测试定义与压缩三个子动作。
pub struct OverlayAction {
    meta: ActionMeta,
    pipeline: Pipeline,
}

impl OverlayAction {
    pub fn new(_job: &JobContext, _params: &Value) -> Self {
        let mut pipeline = Pipeline::new();
        pipeline.add_action(Box::new(MultinodeOverlayAction::new()));
        pipeline.add_action(Box::new(TestDefinitionAction::new()));
        pipeline.add_action(Box::new(CompressOverlay::new()));

        Self {
            meta: ActionMeta::new(
                "overlay",
                "部署期间加入测试支撑脚本",
                "构建测试支撑 overlay",
            ),
            pipeline,
        }
    }
}

#[async_trait]
impl Action for OverlayAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }
    fn internal_pipeline(&self) -> Option<&Pipeline> {
        Some(&self.pipeline)
    }
    fn internal_pipeline_mut(&mut self) -> Option<&mut Pipeline> {
        Some(&mut self.pipeline)
    }

    fn validate(&mut self, job: &JobContext) {
        if job.device.test_shell_cmd().is_empty() {
            self.meta.record_error("设备未配置测试 shell");
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let location = ctx
            .job
            .output_dir
            .join(format!("overlay-{}", self.meta.level));
        debug!("在 {} 准备 overlay", location.display());

        let shell = ctx.job.device.test_shell_cmd().to_string();

        for dir in ["bin", "tests", "results"] {
            let path = location.join(dir);
            fs::create_dir_all(&path).map_err(|e| {
                DispatchError::Infrastructure(format!(
                    "无法创建 overlay 目录 {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        for (name, body) in SUPPORT_SCRIPTS {
            let target = location.join("bin").join(name);
            debug!("写入支撑脚本 {}", target.display());
            write_script(&target, &shell, None, body).map_err(|e| {
                DispatchError::Infrastructure(format!("无法写入支撑脚本 {}: {}", name, e))
            })?;
        }

        ctx.store.set(
            &ctx.job.namespace,
            "overlay",
            "location",
            json!(location.to_string_lossy()),
        );

        self.pipeline.run_actions(connection, deadline, ctx).await
    }
}

/// 多设备协同脚本
///
/// 任务未声明角色时是空操作；声明了角色则把协同脚本连同
/// 角色环境一起写入 overlay。
pub struct MultinodeOverlayAction {
    meta: ActionMeta,
    role: Option<String>,
}

impl MultinodeOverlayAction {
    pub fn new() -> Self {
        Self {
            meta: ActionMeta::new(
                "multinode-overlay",
                "部署期间加入多设备协同脚本",
                "构建多设备协同 overlay",
            ),
            role: None,
        }
    }
}

impl Default for MultinodeOverlayAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for MultinodeOverlayAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, job: &JobContext) {
        // 幂等性：没有 protocols 块直接跳过
        if job.parameters.protocols().is_none() {
            return;
        }
        match job.parameters.multinode_role() {
            Some(role) => self.role = Some(role.to_string()),
            None => self.meta.record_error("多设备任务未指定角色"),
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        _deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let role = match &self.role {
            Some(role) => role.clone(),
            None => {
                debug!("跳过 {}", self.meta.name);
                return Ok(connection);
            }
        };

        let location = overlay_location(ctx)?;
        let shell = ctx.job.device.test_shell_cmd().to_string();

        // 角色环境前导，各脚本共享
        let mut prelude = String::from("DTP_GROUP=\"\n");
        if let Some(roles) = ctx.job.parameters.multinode_roles() {
            for (name, target) in roles {
                prelude.push_str(&format!("\t{}\t{}\n", name, target.as_str().unwrap_or("")));
            }
        }
        prelude.push_str("\"\n");
        prelude.push_str(&format!("TARGET_ROLE='{}'\n", role));

        for (name, body) in MULTINODE_SCRIPTS {
            let target = location.join("bin").join(name);
            debug!("写入协同脚本 {}", target.display());
            write_script(&target, &shell, Some(&prelude), body).map_err(|e| {
                DispatchError::Infrastructure(format!("无法写入协同脚本 {}: {}", name, e))
            })?;
        }

        Ok(connection)
    }
}

/// 测试定义的落盘
///
/// 把任务里 test 段落的各个测试定义物化成 tests/<名称>/run.sh；
/// 没有 test 段落时是空操作。
pub struct TestDefinitionAction {
    meta: ActionMeta,
}

impl TestDefinitionAction {
    pub fn new() -> Self {
        Self {
            meta: ActionMeta::new(
                "test-definition",
                "把测试定义写入 overlay",
                "物化测试定义",
            ),
        }
    }

    /// 从任务参数里收集 test 段落的全部测试定义
    fn definitions(job: &JobContext) -> Vec<(String, Vec<String>)> {
        let mut out = Vec::new();
        for (key, params) in job.parameters.stanzas() {
            if key != "test" {
                continue;
            }
            if let Some(defs) = params["definitions"].as_array() {
                for def in defs {
                    let name = def["name"].as_str().unwrap_or_default().to_string();
                    let steps = def["steps"]
                        .as_array()
                        .map(|steps| {
                            steps
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    out.push((name, steps));
                }
            }
        }
        out
    }
}

impl Default for TestDefinitionAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for TestDefinitionAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, job: &JobContext) {
        for (name, _steps) in Self::definitions(job) {
            if name.is_empty() {
                self.meta.record_error("测试定义缺少名称");
            }
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        _deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let definitions = Self::definitions(ctx.job);
        if definitions.is_empty() {
            debug!("跳过 {}", self.meta.name);
            return Ok(connection);
        }

        let location = overlay_location(ctx)?;
        let shell = ctx.job.device.test_shell_cmd().to_string();
        let mut names = Vec::new();

        for (name, steps) in definitions {
            let dir = location.join("tests").join(&name);
            fs::create_dir_all(&dir).map_err(|e| {
                DispatchError::Infrastructure(format!("无法创建测试目录 {}: {}", name, e))
            })?;

            let body = steps.join("\n");
            write_script(&dir.join("run.sh"), &shell, None, &body).map_err(|e| {
                DispatchError::Infrastructure(format!("无法写入测试定义 {}: {}", name, e))
            })?;

            names.push(name);
        }

        info!("已物化 {} 个测试定义", names.len());
        ctx.store.set(
            &ctx.job.namespace,
            "test-definition",
            "names",
            json!(names),
        );

        Ok(connection)
    }
}

/// 把完成的 overlay 打包成单个产物
///
/// 产物路径写入数据仓库的 `compress-overlay / output`，
/// 供稍后由策略选择器另行选出的应用动作读取。
pub struct CompressOverlay {
    meta: ActionMeta,
}

impl CompressOverlay {
    pub fn new() -> Self {
        Self {
            meta: ActionMeta::new(
                "compress-overlay",
                "打包 overlay 并记录产物路径",
                "压缩 overlay",
            ),
        }
    }
}

impl Default for CompressOverlay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for CompressOverlay {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, _job: &JobContext) {
        if which::which("tar").is_err() {
            self.meta.record_error("找不到 tar，无法打包 overlay");
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let location = overlay_location(ctx)?;

        let output = ctx
            .job
            .output_dir
            .join(format!("overlay-{}.tar.gz", self.meta.level));

        let argv = vec![
            "tar".to_string(),
            "-czf".to_string(),
            output.to_string_lossy().into_owned(),
            "-C".to_string(),
            location.to_string_lossy().into_owned(),
            ".".to_string(),
        ];

        run_command_checked(&argv, deadline)
            .await
            .map_err(|e| match e {
                TransportError::Timeout(msg) => DispatchError::Timeout(msg),
                other => DispatchError::Job(format!("无法创建 overlay 压缩包: {}", other)),
            })?;

        info!("overlay 压缩包已生成: {}", output.display());
        ctx.store.set(
            &ctx.job.namespace,
            "compress-overlay",
            "output",
            json!(output.to_string_lossy()),
        );

        Ok(connection)
    }
}
