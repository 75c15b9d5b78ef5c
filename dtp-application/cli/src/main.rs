//! DTP CLI 应用

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};

mod commands;

#[derive(Parser)]
#[command(name = "dtp")]
#[command(about = "OCloudView DTP - 硬件测试任务调度流水线", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 校验任务描述，报告全部问题
    Validate {
        /// 任务描述文件 (YAML)
        #[arg(long)]
        job: String,
        /// 设备描述文件 (YAML)
        #[arg(long)]
        device: String,
    },

    /// 组装流水线并打印动作树
    Describe {
        /// 任务描述文件 (YAML)
        #[arg(long)]
        job: String,
        /// 设备描述文件 (YAML)
        #[arg(long)]
        device: String,
    },

    /// 执行任务并输出报告
    Run {
        /// 任务描述文件 (YAML)
        #[arg(long)]
        job: String,
        /// 设备描述文件 (YAML)
        #[arg(long)]
        device: String,
        /// 产物输出目录
        #[arg(long, default_value = "./dtp-output")]
        output_dir: String,
    },

    /// 调度演示：入队任务并按认领契约轮询执行
    Daemon {
        /// 任务描述文件 (YAML)，可重复指定
        #[arg(long = "job", required = true)]
        jobs: Vec<String>,
        /// 设备描述文件 (YAML)
        #[arg(long)]
        device: String,
        /// 产物输出目录
        #[arg(long, default_value = "./dtp-output")]
        output_dir: String,
        /// 轮询间隔（秒）
        #[arg(long, default_value = "2")]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt().with_max_level(log_level).init();

    info!("DTP CLI 启动");

    // 处理命令
    match cli.command {
        Commands::Validate { job, device } => commands::validate::handle(&job, &device).await?,
        Commands::Describe { job, device } => commands::describe::handle(&job, &device).await?,
        Commands::Run {
            job,
            device,
            output_dir,
        } => commands::run::handle(&job, &device, &output_dir).await?,
        Commands::Daemon {
            jobs,
            device,
            output_dir,
            interval,
        } => commands::daemon::handle(&jobs, &device, &output_dir, interval).await?,
    }

    Ok(())
}
