// 该文件是 Qianli （千里眼） 项目的一部分。
// src/slot.rs - 推理任务槽
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

use std::time::Instant;

use crate::{
  accel::{CoreId, HardwareTask, TaskKind},
  error::HwError,
  frame::Roi,
};

mod pool;
pub use self::pool::{TaskLease, TaskPool};

/// 任务槽编号，取值范围 `[0, task_num)`
pub type TaskId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
  Idle,
  Running,
}

/// 绑定到某个 NPU 核的可复用任务槽
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSlot {
  pub id: TaskId,
  pub core: CoreId,
  pub alloc_at: Option<Instant>,
  pub state: SlotState,
}

impl TaskSlot {
  pub(crate) fn new(id: TaskId, core: CoreId) -> Self {
    Self {
      id,
      core,
      alloc_at: None,
      state: SlotState::Idle,
    }
  }
}

/// 正在运行的任务槽所持有的推理上下文
pub enum TaskContext<T> {
  Infer(T),
  RoiInfer { task: T, rois: Vec<Roi> },
}

impl<T: HardwareTask> TaskContext<T> {
  pub(crate) fn new(kind: TaskKind, task: T) -> Self {
    match kind {
      TaskKind::Infer => TaskContext::Infer(task),
      TaskKind::RoiInfer => TaskContext::RoiInfer {
        task,
        rois: Vec::new(),
      },
    }
  }

  pub fn kind(&self) -> TaskKind {
    match self {
      TaskContext::Infer(_) => TaskKind::Infer,
      TaskContext::RoiInfer { .. } => TaskKind::RoiInfer,
    }
  }

  pub fn task_mut(&mut self) -> &mut T {
    match self {
      TaskContext::Infer(task) => task,
      TaskContext::RoiInfer { task, .. } => task,
    }
  }

  /// 设置 ROI；整帧推理任务忽略 ROI
  pub fn set_rois(&mut self, input_rois: &[Roi]) -> Result<(), HwError> {
    match self {
      TaskContext::Infer(_) => Ok(()),
      TaskContext::RoiInfer { task, rois } => {
        task.set_rois(input_rois)?;
        rois.clear();
        rois.extend_from_slice(input_rois);
        Ok(())
      }
    }
  }

  pub(crate) fn into_task(self) -> T {
    match self {
      TaskContext::Infer(task) => task,
      TaskContext::RoiInfer { task, .. } => task,
    }
  }
}
