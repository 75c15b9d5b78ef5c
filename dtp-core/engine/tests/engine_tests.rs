//! 引擎行为测试
//!
//! 使用脚本化的模拟动作验证执行契约：遍历顺序、整树校验、
//! 重试语义、超时预算与连接贯穿。

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use dtp_common::{ActionOutcome, DeviceDescriptor, JobParameters, JobStatus};
use dtp_engine::{
    Action, ActionMeta, Deadline, DispatchError, Job, JobContext, Pipeline, Result, RetryAction,
    RunContext,
};
use dtp_transport::{Connection, Transport, TransportError};

// ============================================
// 模拟动作与传输
// ============================================

struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn write_all(&mut self, _data: &[u8]) -> dtp_transport::Result<()> {
        Ok(())
    }

    async fn read_chunk(&mut self, _deadline: Instant) -> dtp_transport::Result<Vec<u8>> {
        Err(TransportError::Closed)
    }

    async fn close(&mut self) -> dtp_transport::Result<()> {
        Ok(())
    }
}

fn null_connection() -> Connection {
    Connection::new(Box::new(NullTransport))
}

/// 把自己的名字写进执行日志，连接原样返回
struct RecordingAction {
    meta: ActionMeta,
    journal: Arc<Mutex<Vec<String>>>,
}

impl RecordingAction {
    fn boxed(name: &str, journal: &Arc<Mutex<Vec<String>>>) -> Box<dyn Action> {
        Box::new(Self {
            meta: ActionMeta::new(name, "记录执行顺序", name),
            journal: Arc::clone(journal),
        })
    }
}

#[async_trait]
impl Action for RecordingAction {
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
        _deadline: Deadline,
        _ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        self.journal.lock().unwrap().push(self.meta.name.clone());
        Ok(connection)
    }
}

/// 持有内部流水线的复合动作
struct CompositeAction {
    meta: ActionMeta,
    pipeline: Pipeline,
}

impl CompositeAction {
    fn boxed(name: &str, pipeline: Pipeline) -> Box<dyn Action> {
        Box::new(Self {
            meta: ActionMeta::new(name, "复合动作", name),
            pipeline,
        })
    }
}

#[async_trait]
impl Action for CompositeAction {
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

/// 前 succeed_after 次失败，之后成功；记录总尝试次数
struct FlakyAction {
    meta: ActionMeta,
    attempts: Arc<AtomicU32>,
    succeed_after: Option<u32>,
}

impl FlakyAction {
    fn boxed(name: &str, attempts: &Arc<AtomicU32>, succeed_after: Option<u32>) -> Box<dyn Action> {
        Box::new(Self {
            meta: ActionMeta::new(name, "模拟不稳定操作", name),
            attempts: Arc::clone(attempts),
            succeed_after,
        })
    }
}

#[async_trait]
impl Action for FlakyAction {
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
        _deadline: Deadline,
        _ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.succeed_after {
            Some(k) if n > k => Ok(connection),
            _ => Err(DispatchError::Job(format!("第 {} 次模拟失败", n))),
        }
    }
}

/// 校验阶段记录一个错误
struct InvalidAction {
    meta: ActionMeta,
    error: String,
}

impl InvalidAction {
    fn boxed(name: &str, error: &str) -> Box<dyn Action> {
        Box::new(Self {
            meta: ActionMeta::new(name, "校验必然失败", name),
            error: error.to_string(),
        })
    }
}

#[async_trait]
impl Action for InvalidAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }
    fn validate(&mut self, _job: &JobContext) {
        let error = self.error.clone();
        self.meta.record_error(error);
    }

    async fn run(
        &mut self,
        connection: Option<Connection>,
        _deadline: Deadline,
        _ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        Ok(connection)
    }
}

/// 永不返回的动作，用于验证截止时间强制终止
struct NeverendingAction {
    meta: ActionMeta,
}

impl NeverendingAction {
    fn boxed(name: &str, timeout: Duration) -> Box<dyn Action> {
        let mut meta = ActionMeta::new(name, "永不返回", name);
        meta.timeout = timeout;
        Box::new(Self { meta })
    }
}

#[async_trait]
impl Action for NeverendingAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ActionMeta {
        &mut self.meta
    }
    fn validate(&mut self, _job: &JobContext) {}

    async fn run(
        &mut self,
        _connection: Option<Connection>,
        _deadline: Deadline,
        _ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        tokio::time::sleep(Duration::from_secs(1_000_000)).await;
        unreachable!("永不返回的动作不应执行到这里")
    }
}

/// 启动类动作：关闭旧连接并建立新连接
struct BootMockAction {
    meta: ActionMeta,
}

impl BootMockAction {
    fn boxed(name: &str) -> Box<dyn Action> {
        Box::new(Self {
            meta: ActionMeta::new(name, "模拟启动", name),
        })
    }
}

#[async_trait]
impl Action for BootMockAction {
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
        _deadline: Deadline,
        _ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        // 断电/复位必须先关闭旧连接，再建立新连接
        if let Some(old) = connection {
            old.close().await.map_err(DispatchError::from)?;
        }
        Ok(Some(null_connection()))
    }
}

/// 每次尝试写入一个带序号的键再失败，用于验证重试回滚
struct LeakyWriterAction {
    meta: ActionMeta,
    attempts: Arc<AtomicU32>,
}

impl LeakyWriterAction {
    fn boxed(name: &str, attempts: &Arc<AtomicU32>) -> Box<dyn Action> {
        Box::new(Self {
            meta: ActionMeta::new(name, "写入后失败", name),
            attempts: Arc::clone(attempts),
        })
    }
}

#[async_trait]
impl Action for LeakyWriterAction {
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
        _deadline: Deadline,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<Connection>> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.store.set(
            &ctx.job.namespace,
            &self.meta.name,
            &format!("attempt-{}", n),
            json!(n),
        );
        if n < 3 {
            Err(DispatchError::Job(format!("第 {} 次模拟失败", n)))
        } else {
            Ok(connection)
        }
    }
}

fn job_context() -> JobContext {
    JobContext {
        parameters: JobParameters::from_value(json!({"job_name": "engine-test"})),
        device: DeviceDescriptor::from_value(json!({})),
        namespace: "common".to_string(),
        output_dir: PathBuf::from("/tmp"),
    }
}

fn make_job(pipeline: Pipeline) -> Job {
    Job::new(job_context(), pipeline)
}

// ============================================
// 测试
// ============================================

#[tokio::test]
async fn test_run_visits_children_in_build_order() {
    let journal = Arc::new(Mutex::new(Vec::new()));

    let mut inner = Pipeline::new();
    inner.add_action(RecordingAction::boxed("b", &journal));
    inner.add_action(RecordingAction::boxed("c", &journal));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(RecordingAction::boxed("a", &journal));
    pipeline.add_action(CompositeAction::boxed("nested", inner));
    pipeline.add_action(RecordingAction::boxed("d", &journal));

    let names_before = pipeline.child_names();

    let mut job = make_job(pipeline);
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Complete);
    assert_eq!(*journal.lock().unwrap(), vec!["a", "b", "c", "d"]);
    // 子动作名称序列在构建与执行之间保持不变
    assert_eq!(
        job.pipeline().child_names(),
        names_before
    );
}

#[tokio::test]
async fn test_levels_follow_tree_position() {
    let journal = Arc::new(Mutex::new(Vec::new()));

    let mut retry_inner = Pipeline::new();
    retry_inner.add_action(RecordingAction::boxed("wget", &journal));

    let mut deploy_inner = Pipeline::new();
    deploy_inner.add_action(CompositeAction::boxed("downloader", retry_inner));
    deploy_inner.add_action(RecordingAction::boxed("checksum", &journal));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(CompositeAction::boxed("deploy", deploy_inner));
    pipeline.add_action(RecordingAction::boxed("boot", &journal));

    let job = make_job(pipeline);
    let described = job.pipeline().describe();

    assert_eq!(described[0].level, "1");
    assert_eq!(described[0].children[0].level, "1.1");
    assert_eq!(described[0].children[0].children[0].level, "1.1.1");
    assert_eq!(described[0].children[1].level, "1.2");
    assert_eq!(described[1].level, "2");
}

#[tokio::test]
async fn test_validation_collects_all_errors() {
    let mut inner = Pipeline::new();
    inner.add_action(InvalidAction::boxed("extract", "缺少必要参数 ramdisk"));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(InvalidAction::boxed("download", "缺少必要参数 image"));
    pipeline.add_action(CompositeAction::boxed("prepare", inner));

    let mut job = make_job(pipeline);
    let failures = job.validate();

    // 两个独立动作的错误都在，一个不少
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|f| f.action == "download"));
    assert!(failures.iter().any(|f| f.action == "extract"));
}

#[tokio::test]
async fn test_invalid_job_is_rejected_before_run() {
    let journal = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(InvalidAction::boxed("bad", "缺少必要参数"));
    pipeline.add_action(RecordingAction::boxed("never-runs", &journal));

    let mut job = make_job(pipeline);
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Incomplete);
    assert!(!report.validation_errors.is_empty());
    // 校验失败时任何动作都不会执行
    assert!(journal.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_sibling_names_fail_validation() {
    let journal = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(RecordingAction::boxed("twin", &journal));
    pipeline.add_action(RecordingAction::boxed("twin", &journal));

    let mut job = make_job(pipeline);
    let failures = job.validate();

    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.contains("重复"));
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhausts_exactly_max_attempts() {
    let attempts = Arc::new(AtomicU32::new(0));

    let mut inner = Pipeline::new();
    inner.add_action(FlakyAction::boxed("always-fails", &attempts, None));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(Box::new(
        RetryAction::new("retry-op", "带重试的操作", "retry", inner).with_max_retries(3),
    ));

    let mut job = make_job(pipeline);
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Incomplete);
    // 恰好尝试 max_retries 次
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(report.actions[0].attempts, 3);
    // 每次尝试的错误都被记录
    assert!(report.actions[0].errors.len() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_after_transient_failures() {
    let attempts = Arc::new(AtomicU32::new(0));

    let mut inner = Pipeline::new();
    inner.add_action(FlakyAction::boxed("fails-twice", &attempts, Some(2)));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(Box::new(
        RetryAction::new("retry-op", "带重试的操作", "retry", inner).with_max_retries(3),
    ));

    let mut job = make_job(pipeline);
    let report = job.run().await;

    // 失败两次后第三次成功，任务整体完成
    assert_eq!(report.status, JobStatus::Complete);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(report.actions[0].attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_is_not_retried() {
    struct FatalAction {
        meta: ActionMeta,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Action for FatalAction {
        fn meta(&self) -> &ActionMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut ActionMeta {
            &mut self.meta
        }
        fn validate(&mut self, _job: &JobContext) {}

        async fn run(
            &mut self,
            _connection: Option<Connection>,
            _deadline: Deadline,
            _ctx: &mut RunContext<'_>,
        ) -> Result<Option<Connection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError::Infrastructure("挂载点不存在".to_string()))
        }
    }

    let attempts = Arc::new(AtomicU32::new(0));
    let mut inner = Pipeline::new();
    inner.add_action(Box::new(FatalAction {
        meta: ActionMeta::new("broken-env", "环境损坏", "broken"),
        attempts: Arc::clone(&attempts),
    }));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(Box::new(
        RetryAction::new("retry-op", "带重试的操作", "retry", inner).with_max_retries(3),
    ));

    let mut job = make_job(pipeline);
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Incomplete);
    // 基础设施错误绝不重试
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_terminates_neverending_action() {
    let before = Instant::now();

    let mut pipeline = Pipeline::new();
    pipeline.add_action(NeverendingAction::boxed("hang", Duration::from_secs(5)));

    let mut job = make_job(pipeline);
    let report = job.run().await;

    let elapsed = Instant::now() - before;

    assert_eq!(report.status, JobStatus::Incomplete);
    assert_eq!(report.actions[0].outcome, ActionOutcome::TimedOut);
    // 在预算到期后立刻终止，而不是等动作自然结束
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_parent_budget_bounds_descendants() {
    let mut inner = Pipeline::new();
    // 子动作自己声称可以跑 1000 秒
    inner.add_action(NeverendingAction::boxed("hang", Duration::from_secs(1000)));

    let mut composite = CompositeAction::boxed("parent", inner);
    // 父预算只有 5 秒
    composite.meta_mut().timeout = Duration::from_secs(5);

    let before = Instant::now();
    let mut pipeline = Pipeline::new();
    pipeline.add_action(composite);

    let mut job = make_job(pipeline);
    let report = job.run().await;

    let elapsed = Instant::now() - before;

    assert_eq!(report.status, JobStatus::Incomplete);
    // 后代不能超出祖先的预算
    assert!(elapsed < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_retry_rolls_back_failed_attempt_writes() {
    let attempts = Arc::new(AtomicU32::new(0));

    let mut inner = Pipeline::new();
    inner.add_action(LeakyWriterAction::boxed("leaky-writer", &attempts));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(Box::new(
        RetryAction::new("retry-op", "带重试的操作", "retry", inner).with_max_retries(3),
    ));

    let mut job = make_job(pipeline);
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Complete);
    // 失败尝试的写入被回滚，只有成功尝试的键保留
    assert!(report.metadata.contains_key("leaky-writer.attempt-3"));
    assert!(!report.metadata.contains_key("leaky-writer.attempt-1"));
    assert!(!report.metadata.contains_key("leaky-writer.attempt-2"));
}

#[tokio::test]
async fn test_failure_aborts_remaining_siblings() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicU32::new(0));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(RecordingAction::boxed("first", &journal));
    pipeline.add_action(FlakyAction::boxed("fails", &attempts, None));
    pipeline.add_action(RecordingAction::boxed("never-runs", &journal));

    let mut job = make_job(pipeline);
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Incomplete);
    assert_eq!(*journal.lock().unwrap(), vec!["first"]);
    // 失败节点之后的兄弟保持未执行状态
    assert_eq!(report.actions[2].outcome, ActionOutcome::Pending);
}

#[tokio::test]
async fn test_boot_action_replaces_connection() {
    struct AssertsConnection {
        meta: ActionMeta,
    }

    #[async_trait]
    impl Action for AssertsConnection {
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
            _deadline: Deadline,
            _ctx: &mut RunContext<'_>,
        ) -> Result<Option<Connection>> {
            // 启动动作之后必须拿到活动连接
            assert!(connection.is_some());
            Ok(connection)
        }
    }

    struct ClosesConnection {
        meta: ActionMeta,
    }

    #[async_trait]
    impl Action for ClosesConnection {
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
            _deadline: Deadline,
            _ctx: &mut RunContext<'_>,
        ) -> Result<Option<Connection>> {
            if let Some(conn) = connection {
                conn.close().await.map_err(DispatchError::from)?;
            }
            Ok(None)
        }
    }

    let mut pipeline = Pipeline::new();
    pipeline.add_action(BootMockAction::boxed("boot"));
    pipeline.add_action(Box::new(AssertsConnection {
        meta: ActionMeta::new("uses-connection", "使用连接", "use"),
    }));
    pipeline.add_action(Box::new(ClosesConnection {
        meta: ActionMeta::new("finalize", "收尾", "finalize"),
    }));

    let mut job = make_job(pipeline);
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Complete);
}

#[tokio::test]
async fn test_cancellation_yields_canceled_status() {
    let journal = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = Pipeline::new();
    pipeline.add_action(RecordingAction::boxed("never-runs", &journal));

    let mut job = make_job(pipeline);
    job.cancel_token().cancel();
    let report = job.run().await;

    assert_eq!(report.status, JobStatus::Canceled);
    assert!(journal.lock().unwrap().is_empty());
}
