//! DTP 策略目录
//!
//! 部署/启动/测试/收尾各段落的具体动作实现，以及把任务描述
//! 组装成可执行流水线的策略注册表。新增设备能力只需注册新的
//! 策略项，不需要修改引擎。

pub mod boot;
pub mod deploy;
pub mod finalize;
pub mod registry;
pub mod test;

pub use registry::{assemble, strategies};
