//! overlay 的应用
//!
//! 打包好的 overlay 由部署方式各异的动作取出并释放到目标
//! 文件系统：挂载点方式要求目标确实已挂载，tftp 方式释放到
//! 已解包的 ramdisk 或 NFS 根。缺少预期的目标一律报错，
//! 绝不静默跳过。

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use dtp_engine::{
    Action, ActionMeta, Deadline, DispatchError, JobContext, Pipeline, Result, RunContext,
};
use dtp_transport::{run_command_checked, Connection};

use super::overlay::OverlayAction;

/// 解包后的 ramdisk 压缩文件名
const RAMDISK_COMPRESSED_FNAME: &str = "ramdisk.cpio.gz";

/// 解压后的 ramdisk 文件名
const RAMDISK_FNAME: &str = "ramdisk.cpio";

/// 判断路径是否是一个挂载点
///
/// 读取 /proc/mounts 对比挂载目标；路径不存在视为未挂载。
fn is_mounted(path: &Path) -> Result<bool> {
    let canonical = match fs::canonicalize(path) {
        Ok(canonical) => canonical,
        Err(_) => return Ok(false),
    };

    let mounts = fs::read_to_string("/proc/mounts")
        .map_err(|e| DispatchError::Infrastructure(format!("无法读取 /proc/mounts: {}", e)))?;

    Ok(mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|target| Path::new(target) == canonical))
}

/// 从数据仓库取出 overlay 压缩包路径
fn overlay_artifact(ctx: &RunContext<'_>) -> Result<PathBuf> {
    ctx.store
        .get(&ctx.job.namespace, "compress-overlay", "output")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| DispatchError::Infrastructure("找不到 overlay 压缩包记录".to_string()))
}

/// 把 overlay 释放到已挂载的镜像上
pub struct ApplyOverlayImage {
    meta: ActionMeta,
    params: Value,
}

impl ApplyOverlayImage {
    pub fn new(params: &Value) -> Self {
        Self {
            meta: ActionMeta::new(
                "apply-overlay-image",
                "把 overlay 释放到镜像挂载点",
                "应用 overlay 到镜像",
            ),
            params: params.clone(),
        }
    }
}

#[async_trait]
impl Action for ApplyOverlayImage {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, _job: &JobContext) {
        if self.params["mountpoint"].as_str().is_none() {
            self.meta.record_error("缺少必要参数 mountpoint");
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let overlay = overlay_artifact(ctx)?;
        let mountpoint = PathBuf::from(self.params["mountpoint"].as_str().unwrap_or_default());

        if !is_mounted(&mountpoint)? {
            return Err(DispatchError::Infrastructure(format!(
                "要求把 overlay 应用到 {}，但它不是挂载点",
                mountpoint.display()
            )));
        }

        let argv = vec![
            "tar".to_string(),
            "-xzf".to_string(),
            overlay.to_string_lossy().into_owned(),
            "-C".to_string(),
            mountpoint.to_string_lossy().into_owned(),
        ];

        run_command_checked(&argv, deadline)
            .await
            .map_err(|e| DispatchError::Job(format!("无法解包 overlay: {}", e)))?;

        info!("overlay 已应用到 {}", mountpoint.display());
        Ok(connection)
    }
}

/// tftp 部署的 overlay 准备链
///
/// 解包 ramdisk 或 NFS 根、构建 overlay、释放 overlay、
/// 重建 ramdisk，各子动作对触发参数缺席时均为空操作。
pub struct PrepareOverlayTftp {
    meta: ActionMeta,
    pipeline: Pipeline,
}

impl PrepareOverlayTftp {
    pub fn new(job: &JobContext, params: &Value) -> Self {
        let mut pipeline = Pipeline::new();
        pipeline.add_action(Box::new(ExtractNfsRootfs::new(params)));
        pipeline.add_action(Box::new(OverlayAction::new(job, params)));
        pipeline.add_action(Box::new(ExtractRamdisk::new(params)));
        pipeline.add_action(Box::new(ApplyOverlayTftp::new(params)));
        pipeline.add_action(Box::new(CompressRamdisk::new(params)));

        Self {
            meta: ActionMeta::new(
                "prepare-tftp-overlay",
                "为 tftp 部署解包并应用 overlay",
                "准备 tftp overlay",
            ),
            pipeline,
        }
    }
}

#[async_trait]
impl Action for PrepareOverlayTftp {
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

    fn validate(&mut self, _job: &JobContext) {}

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        self.pipeline.run_actions(connection, deadline, ctx).await
    }
}

/// 解包 NFS 根文件系统
pub struct ExtractNfsRootfs {
    meta: ActionMeta,
    params: Value,
}

impl ExtractNfsRootfs {
    pub fn new(params: &Value) -> Self {
        Self {
            meta: ActionMeta::new(
                "extract-nfsrootfs",
                "解包 nfsrootfs 以便应用 overlay",
                "解包 nfsrootfs",
            ),
            params: params.clone(),
        }
    }
}

#[async_trait]
impl Action for ExtractNfsRootfs {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, _job: &JobContext) {
        // 幂等性：没有 nfsrootfs 参数直接跳过
        let Some(nfsrootfs) = self.params["nfsrootfs"].as_str() else {
            return;
        };
        if !Path::new(nfsrootfs).exists() {
            self.meta
                .record_error(format!("找不到 nfsrootfs 文件: {}", nfsrootfs));
        }
        if which::which("exportfs").is_err() {
            self.meta
                .record_error("NFS 任务需要 exportfs，请安装 nfs-kernel-server");
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let Some(nfsrootfs) = self.params["nfsrootfs"].as_str() else {
            debug!("跳过 {}", self.meta.name);
            return Ok(connection);
        };

        let nfsroot_dir = ctx
            .job
            .output_dir
            .join(format!("nfsroot-{}", self.meta.level));
        fs::create_dir_all(&nfsroot_dir).map_err(|e| {
            DispatchError::Infrastructure(format!("无法创建 nfsroot 目录: {}", e))
        })?;

        let argv = vec![
            "tar".to_string(),
            "-xf".to_string(),
            nfsrootfs.to_string(),
            "-C".to_string(),
            nfsroot_dir.to_string_lossy().into_owned(),
        ];

        run_command_checked(&argv, deadline)
            .await
            .map_err(|e| DispatchError::Job(format!("无法解包 nfsroot: {}", e)))?;

        debug!("nfsroot 已解包到 {}", nfsroot_dir.display());
        ctx.store.set(
            &ctx.job.namespace,
            "extract-nfsrootfs",
            "nfsroot",
            json!(nfsroot_dir.to_string_lossy()),
        );

        Ok(connection)
    }
}

/// 解包 ramdisk
///
/// 按需剥离 u-boot 头部，解压并用 cpio 展开内容，展开后的
/// 目录保持打开状态供后续动作修改，由 CompressRamdisk 重建。
pub struct ExtractRamdisk {
    meta: ActionMeta,
    params: Value,
}

impl ExtractRamdisk {
    pub fn new(params: &Value) -> Self {
        Self {
            meta: ActionMeta::new(
                "extract-overlay-ramdisk",
                "把 ramdisk 解包到临时目录",
                "解包 ramdisk",
            ),
            params: params.clone(),
        }
    }
}

#[async_trait]
impl Action for ExtractRamdisk {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, _job: &JobContext) {
        let Some(ramdisk) = self.params["ramdisk"].as_str() else {
            return;
        };
        if !Path::new(ramdisk).exists() {
            self.meta
                .record_error(format!("找不到 ramdisk 文件: {}", ramdisk));
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let Some(ramdisk) = self.params["ramdisk"].as_str() else {
            debug!("跳过 {}", self.meta.name);
            return Ok(connection);
        };

        let ramdisk_dir = ctx
            .job
            .output_dir
            .join(format!("ramdisk-{}", self.meta.level));
        let extracted = ramdisk_dir.join("ramdisk");
        fs::create_dir_all(&extracted).map_err(|e| {
            DispatchError::Infrastructure(format!("无法创建 ramdisk 目录: {}", e))
        })?;

        let compressed = ramdisk_dir.join(RAMDISK_COMPRESSED_FNAME);

        if self.params["ramdisk-type"].as_str() == Some("u-boot") {
            // 64 字节头部是经验值
            let argv = vec![
                "dd".to_string(),
                format!("if={}", ramdisk),
                format!("of={}", compressed.display()),
                "ibs=64".to_string(),
                "skip=1".to_string(),
            ];
            run_command_checked(&argv, deadline)
                .await
                .map_err(|e| DispatchError::Job(format!("无法移除 u-boot 头部: {}", e)))?;
        } else {
            fs::copy(ramdisk, &compressed)
                .map_err(|e| DispatchError::Job(format!("无法读取 ramdisk: {}", e)))?;
        }

        let argv = vec![
            "gzip".to_string(),
            "-d".to_string(),
            "-f".to_string(),
            compressed.to_string_lossy().into_owned(),
        ];
        run_command_checked(&argv, deadline)
            .await
            .map_err(|e| DispatchError::Job(format!("无法解压 ramdisk: {}", e)))?;

        let ramdisk_data = ramdisk_dir.join(RAMDISK_FNAME);
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "cd {} && cpio -i -F {}",
                extracted.display(),
                ramdisk_data.display()
            ),
        ];
        run_command_checked(&argv, deadline)
            .await
            .map_err(|e| DispatchError::Job(format!("无法展开 ramdisk 内容: {}", e)))?;

        // 告诉后续动作解包后的 ramdisk 在哪里
        ctx.store.set(
            &ctx.job.namespace,
            "extract-overlay-ramdisk",
            "extracted_ramdisk",
            json!(extracted.to_string_lossy()),
        );
        ctx.store.set(
            &ctx.job.namespace,
            "extract-overlay-ramdisk",
            "ramdisk_file",
            json!(ramdisk_data.to_string_lossy()),
        );

        Ok(connection)
    }
}

/// 把 overlay 释放到 ramdisk 或 NFS 根
pub struct ApplyOverlayTftp {
    meta: ActionMeta,
    params: Value,
}

impl ApplyOverlayTftp {
    pub fn new(params: &Value) -> Self {
        Self {
            meta: ActionMeta::new(
                "apply-overlay-tftp",
                "把 overlay 释放到 nfsrootfs 或 ramdisk",
                "应用 overlay 测试文件",
            ),
            params: params.clone(),
        }
    }
}

#[async_trait]
impl Action for ApplyOverlayTftp {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, _job: &JobContext) {}

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let directory = if self.params["ramdisk"].as_str().is_some() {
            ctx.store
                .get(&ctx.job.namespace, "extract-overlay-ramdisk", "extracted_ramdisk")
                .and_then(Value::as_str)
                .map(PathBuf::from)
                .ok_or_else(|| {
                    DispatchError::Infrastructure(
                        "要求应用 ramdisk overlay，但找不到已解包的 ramdisk".to_string(),
                    )
                })?
        } else if self.params["nfsrootfs"].as_str().is_some() {
            ctx.store
                .get(&ctx.job.namespace, "extract-nfsrootfs", "nfsroot")
                .and_then(Value::as_str)
                .map(PathBuf::from)
                .ok_or_else(|| {
                    DispatchError::Infrastructure(
                        "要求应用 nfsrootfs overlay，但找不到已解包的 nfsroot".to_string(),
                    )
                })?
        } else {
            debug!("跳过 {}", self.meta.name);
            return Ok(connection);
        };

        let overlay = overlay_artifact(ctx)?;

        let argv = vec![
            "tar".to_string(),
            "-xzf".to_string(),
            overlay.to_string_lossy().into_owned(),
            "-C".to_string(),
            directory.to_string_lossy().into_owned(),
        ];

        run_command_checked(&argv, deadline)
            .await
            .map_err(|e| DispatchError::Job(format!("无法解包 overlay: {}", e)))?;

        info!("overlay 已释放到 {}", directory.display());
        Ok(connection)
    }
}

/// 重建带 overlay 的 ramdisk
pub struct CompressRamdisk {
    meta: ActionMeta,
    params: Value,
}

impl CompressRamdisk {
    pub fn new(params: &Value) -> Self {
        Self {
            meta: ActionMeta::new(
                "compress-ramdisk",
                "应用 overlay 后重建 ramdisk",
                "压缩 ramdisk",
            ),
            params: params.clone(),
        }
    }
}

#[async_trait]
impl Action for CompressRamdisk {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }

    fn validate(&mut self, _job: &JobContext) {
        if self.params["ramdisk"].as_str().is_none() {
            return;
        }
        if self.params["ramdisk-type"].as_str() == Some("u-boot")
            && which::which("mkimage").is_err()
        {
            self.meta
                .record_error("找不到 mkimage，请安装 u-boot-tools");
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        if self.params["ramdisk"].as_str().is_none() {
            debug!("跳过 {}", self.meta.name);
            return Ok(connection);
        }

        let extracted = ctx
            .store
            .get(&ctx.job.namespace, "extract-overlay-ramdisk", "extracted_ramdisk")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| {
                DispatchError::Infrastructure("找不到已解包的 ramdisk 目录".to_string())
            })?;
        let ramdisk_data = ctx
            .store
            .get(&ctx.job.namespace, "extract-overlay-ramdisk", "ramdisk_file")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| {
                DispatchError::Infrastructure("找不到 ramdisk 数据文件".to_string())
            })?;

        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "cd {} && find . | cpio --create --format=newc > {}",
                extracted.display(),
                ramdisk_data.display()
            ),
        ];
        run_command_checked(&argv, deadline)
            .await
            .map_err(|e| DispatchError::Job(format!("无法重建 cpio 文件系统: {}", e)))?;

        let argv = vec![
            "gzip".to_string(),
            "-f".to_string(),
            ramdisk_data.to_string_lossy().into_owned(),
        ];
        run_command_checked(&argv, deadline)
            .await
            .map_err(|e| DispatchError::Job(format!("无法压缩 cpio 文件系统: {}", e)))?;

        let mut final_file = PathBuf::from(format!("{}.gz", ramdisk_data.display()));

        if self.params["ramdisk-type"].as_str() == Some("u-boot") {
            let uboot_file = PathBuf::from(format!("{}.uboot", final_file.display()));
            debug!("为 ramdisk 添加 u-boot 头部");
            let argv = vec![
                "mkimage".to_string(),
                "-A".to_string(),
                "arm".to_string(),
                "-T".to_string(),
                "ramdisk".to_string(),
                "-C".to_string(),
                "none".to_string(),
                "-d".to_string(),
                final_file.to_string_lossy().into_owned(),
                uboot_file.to_string_lossy().into_owned(),
            ];
            run_command_checked(&argv, deadline)
                .await
                .map_err(|e| DispatchError::Job(format!("无法添加 u-boot 头部: {}", e)))?;
            final_file = uboot_file;
        }

        ctx.store.set(
            &ctx.job.namespace,
            "compress-ramdisk",
            "ramdisk",
            json!(final_file.to_string_lossy()),
        );

        Ok(connection)
    }
}
