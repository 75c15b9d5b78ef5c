//! 部署段落的策略动作

pub mod apply;
pub mod overlay;

pub use apply::{
    ApplyOverlayImage, ApplyOverlayTftp, CompressRamdisk, ExtractNfsRootfs, ExtractRamdisk,
    PrepareOverlayTftp,
};
pub use overlay::{CompressOverlay, MultinodeOverlayAction, OverlayAction, TestDefinitionAction};

use async_trait::async_trait;
use serde_json::Value;

use dtp_engine::{Action, ActionMeta, Deadline, JobContext, Pipeline, Result, RunContext};
use dtp_transport::Connection;

/// 镜像方式部署
///
/// 先构建 overlay 产物，再把它释放到已挂载的镜像上。
pub struct DeployImageAction {
    meta: ActionMeta,
    pipeline: Pipeline,
    params: Value,
}

impl DeployImageAction {
    pub fn new(job: &JobContext, params: &Value) -> Self {
        let mut pipeline = Pipeline::new();
        pipeline.add_action(Box::new(OverlayAction::new(job, params)));
        pipeline.add_action(Box::new(ApplyOverlayImage::new(params)));

        Self {
            meta: ActionMeta::new("deploy-image", "通过挂载点部署镜像", "镜像部署"),
            pipeline,
            params: params.clone(),
        }
    }
}

#[async_trait]
impl Action for DeployImageAction {
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

    fn validate(&mut self, _job: &JobContext) {
        if self.params["image"].as_str().is_none() {
            self.meta.record_error("缺少必要参数 image");
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        self.pipeline.run_actions(connection, deadline, ctx).await
    }
}

/// tftp 方式部署
///
/// overlay 的构建与应用都发生在 ramdisk / NFS 根的解包树上。
pub struct DeployTftpAction {
    meta: ActionMeta,
    pipeline: Pipeline,
    params: Value,
}

impl DeployTftpAction {
    pub fn new(job: &JobContext, params: &Value) -> Self {
        let mut pipeline = Pipeline::new();
        pipeline.add_action(Box::new(PrepareOverlayTftp::new(job, params)));

        Self {
            meta: ActionMeta::new("deploy-tftp", "通过 tftp 根部署", "tftp 部署"),
            pipeline,
            params: params.clone(),
        }
    }
}

#[async_trait]
impl Action for DeployTftpAction {
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

    fn validate(&mut self, _job: &JobContext) {
        // ramdisk 与 nfsrootfs 至少要有一个，否则整条链都是空操作
        if self.params["ramdisk"].as_str().is_none()
            && self.params["nfsrootfs"].as_str().is_none()
        {
            self.meta
                .record_error("tftp 部署需要 ramdisk 或 nfsrootfs 参数之一");
        }
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        self.pipeline.run_actions(connection, deadline, ctx).await
    }
}
