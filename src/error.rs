// 该文件是 Qianli （千里眼） 项目的一部分。
// src/error.rs - 错误定义
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

use std::time::Duration;

use thiserror::Error;

/// 发生超时的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  /// 等待空闲任务槽
  Allocate,
  /// 等待 NPU 推理完成
  InferDone,
}

impl std::fmt::Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Stage::Allocate => write!(f, "申请任务"),
      Stage::InferDone => write!(f, "等待推理完成"),
    }
  }
}

/// 硬件（NPU 运行时）边界上的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
  /// 任务控制参数被拒绝
  #[error("控制参数无效, 错误码: {0}")]
  InvalidParameter(i32),
  /// 等待时间片用完，推理尚未完成
  #[error("推理尚未完成")]
  Pending,
  /// 其它执行失败
  #[error("执行失败, 错误码: {0}")]
  Failed(i32),
}

#[derive(Error, Debug)]
pub enum DnnError {
  #[error("参数无效: {0}")]
  InvalidArgument(String),
  #[error("资源不足: {0}")]
  ResourceExhausted(String),
  #[error("控制参数被 NPU 拒绝, 错误码: {0}")]
  HardwareInvalidParameter(i32),
  #[error("推理执行失败, 错误码: {0}")]
  HardwareExecution(i32),
  #[error("{stage}超时: {after:?}")]
  Timeout { stage: Stage, after: Duration },
  #[error("系统正在退出")]
  Shutdown,
  #[error("配置错误: {0}")]
  Config(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

impl DnnError {
  /// 过载类错误，调用方稍后可以重试
  pub fn is_overload(&self) -> bool {
    matches!(
      self,
      DnnError::ResourceExhausted(_)
        | DnnError::Timeout {
          stage: Stage::Allocate,
          ..
        }
    )
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, DnnError::Timeout { .. })
  }
}

impl From<HwError> for DnnError {
  fn from(err: HwError) -> Self {
    match err {
      HwError::InvalidParameter(code) => DnnError::HardwareInvalidParameter(code),
      HwError::Failed(code) => DnnError::HardwareExecution(code),
      // 单独的 Pending 不应该越过执行器，这里按执行失败处理
      HwError::Pending => DnnError::HardwareExecution(-1),
    }
  }
}
