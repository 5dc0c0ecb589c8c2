// 该文件是 Qianli （千里眼） 项目的一部分。
// src/lib.rs - 库主文件
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! # Qianli
//!
//! 多核 NPU 推理任务调度与检测结果解码。
//!
//! - [`slot::TaskPool`] 管理固定数量、绑定 NPU 核的推理任务槽；
//! - [`executor::InferenceExecutor`] 执行推理、等待完成并在控制参数被拒绝时重试；
//! - [`node::DnnNode`] 是调度入口，支持同步与异步队列两种执行方式；
//! - [`parser::Yolo5Parser`] 将量化输出张量解码为检测框。

pub mod accel;
pub mod config;
pub mod error;
pub mod executor;
pub mod frame;
pub mod input;
pub mod node;
pub mod parser;
pub mod shutdown;
pub mod slot;
pub mod stat;
pub mod tensor;
pub mod worker;
pub mod workflow;

pub use crate::error::{DnnError, HwError};

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}
