// 该文件是 Qianli （千里眼） 项目的一部分。
// src/accel.rs - NPU 运行时接口
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

use serde::{Deserialize, Serialize};

use crate::{
  error::HwError,
  frame::{ModelInput, Roi},
  tensor::Tensor,
};

mod sim;
pub use self::sim::{RejectPolicy, SimAccelerator, SimAcceleratorBuilder, SimStats, SimTask};

/// NPU 核编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreId {
  Core0,
  Core1,
  /// 由运行时自行选择
  Any,
}

impl CoreId {
  /// 在两个核之间交替；`Any` 之后总是 `Core0`
  pub fn alternate(self) -> CoreId {
    match self {
      CoreId::Core0 => CoreId::Core1,
      CoreId::Core1 => CoreId::Core0,
      CoreId::Any => CoreId::Core0,
    }
  }
}

/// 推理控制参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlParam {
  pub core: CoreId,
  pub priority: i32,
}

impl Default for CtrlParam {
  fn default() -> Self {
    Self {
      core: CoreId::Any,
      priority: 0,
    }
  }
}

impl CtrlParam {
  pub fn on_core(core: CoreId) -> Self {
    Self {
      core,
      ..Default::default()
    }
  }
}

/// 模型任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
  /// 整帧推理
  Infer,
  /// 按 ROI 推理
  RoiInfer,
}

/// 一个绑定到模型的 NPU 推理任务
pub trait HardwareTask: Send {
  fn set_ctrl_param(&mut self, param: CtrlParam);
  fn set_inputs(&mut self, input: &ModelInput) -> Result<(), HwError>;
  fn set_rois(&mut self, rois: &[Roi]) -> Result<(), HwError>;
  /// 对图像帧输入做 NPU 侧的预处理
  fn process_input(&mut self) -> Result<(), HwError>;
  fn run_infer(&mut self) -> Result<(), HwError>;
  /// 最多等待 `timeout`，未完成时返回 [`HwError::Pending`]
  fn wait_infer_done(&mut self, timeout: Duration) -> Result<(), HwError>;
  fn output_tensors(&mut self) -> Result<Vec<Tensor>, HwError>;
  /// 清除本次推理的输入输出和控制参数，任务放回空闲列表后可以再次使用
  fn reset(&mut self);
}

/// 已加载模型的 NPU 设备
pub trait Accelerator: Send + Sync + 'static {
  type Task: HardwareTask + 'static;

  fn core_num(&self) -> usize;
  fn create_task(&self, kind: TaskKind) -> Result<Self::Task, HwError>;
}
