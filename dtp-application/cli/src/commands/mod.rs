//! CLI 子命令

pub mod common;
pub mod daemon;
pub mod describe;
pub mod run;
pub mod validate;
