// 该文件是 Qianli （千里眼） 项目的一部分。
// src/accel/sim.rs - 软件模拟的 NPU 设备
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

//! # 模拟设备
//!
//! 没有 NPU 的机器上用于基准测试和单元测试。推理耗时固定，
//! 可以配置拒绝控制参数、周期性失败或永不完成，并统计并发峰值。
//!
//! ```
//! use std::time::Duration;
//! use qianli::accel::{Accelerator, SimAccelerator, TaskKind};
//!
//! let accel = SimAccelerator::builder()
//!   .core_num(2)
//!   .latency(Duration::from_millis(5))
//!   .build();
//! assert_eq!(accel.core_num(), 2);
//! let _task = accel.create_task(TaskKind::Infer).unwrap();
//! ```

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use tracing::debug;

use crate::{
  accel::{Accelerator, CoreId, CtrlParam, HardwareTask, TaskKind},
  error::HwError,
  frame::{ModelInput, Roi},
  tensor::Tensor,
};

pub const SIM_INVALID_ARGUMENT: i32 = -6_000_001;
pub const SIM_INVALID_INPUT: i32 = -6_000_002;
pub const SIM_RUN_FAILED: i32 = -6_000_005;

/// 控制参数拒绝策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectPolicy {
  Never,
  /// 拒绝任何非默认的控制参数
  CustomParams,
  Always,
}

type OutputFn = dyn Fn(&ModelInput, &[Roi]) -> Vec<Tensor> + Send + Sync;

#[derive(Default)]
struct Counters {
  created: AtomicUsize,
  runs: AtomicUsize,
  active: AtomicUsize,
  max_active: AtomicUsize,
  rejected: AtomicUsize,
  core0: AtomicUsize,
  core1: AtomicUsize,
  any: AtomicUsize,
}

/// 模拟设备的运行统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
  pub created: usize,
  pub runs: usize,
  pub max_active: usize,
  pub rejected: usize,
  pub core0: usize,
  pub core1: usize,
  pub any: usize,
}

struct Shared {
  core_num: usize,
  latency: Duration,
  reject: RejectPolicy,
  fail_every: Option<usize>,
  hang: bool,
  outputs: Option<Arc<OutputFn>>,
  counters: Counters,
}

pub struct SimAcceleratorBuilder {
  core_num: usize,
  latency: Duration,
  reject: RejectPolicy,
  fail_every: Option<usize>,
  hang: bool,
  outputs: Option<Arc<OutputFn>>,
}

impl Default for SimAcceleratorBuilder {
  fn default() -> Self {
    Self {
      core_num: 2,
      latency: Duration::from_millis(10),
      reject: RejectPolicy::Never,
      fail_every: None,
      hang: false,
      outputs: None,
    }
  }
}

impl SimAcceleratorBuilder {
  pub fn core_num(mut self, core_num: usize) -> Self {
    self.core_num = core_num;
    self
  }

  pub fn latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn reject(mut self, reject: RejectPolicy) -> Self {
    self.reject = reject;
    self
  }

  /// 每第 `n` 次推理失败
  pub fn fail_every(mut self, n: usize) -> Self {
    self.fail_every = Some(n.max(1));
    self
  }

  /// 推理永远不会完成
  pub fn hang(mut self, hang: bool) -> Self {
    self.hang = hang;
    self
  }

  pub fn outputs(
    mut self,
    outputs: impl Fn(&ModelInput, &[Roi]) -> Vec<Tensor> + Send + Sync + 'static,
  ) -> Self {
    self.outputs = Some(Arc::new(outputs));
    self
  }

  pub fn build(self) -> SimAccelerator {
    SimAccelerator {
      shared: Arc::new(Shared {
        core_num: self.core_num,
        latency: self.latency,
        reject: self.reject,
        fail_every: self.fail_every,
        hang: self.hang,
        outputs: self.outputs,
        counters: Counters::default(),
      }),
    }
  }
}

#[derive(Clone)]
pub struct SimAccelerator {
  shared: Arc<Shared>,
}

impl SimAccelerator {
  pub fn builder() -> SimAcceleratorBuilder {
    SimAcceleratorBuilder::default()
  }

  pub fn stats(&self) -> SimStats {
    let c = &self.shared.counters;
    SimStats {
      created: c.created.load(Ordering::SeqCst),
      runs: c.runs.load(Ordering::SeqCst),
      max_active: c.max_active.load(Ordering::SeqCst),
      rejected: c.rejected.load(Ordering::SeqCst),
      core0: c.core0.load(Ordering::SeqCst),
      core1: c.core1.load(Ordering::SeqCst),
      any: c.any.load(Ordering::SeqCst),
    }
  }
}

impl Accelerator for SimAccelerator {
  type Task = SimTask;

  fn core_num(&self) -> usize {
    self.shared.core_num
  }

  fn create_task(&self, kind: TaskKind) -> Result<Self::Task, HwError> {
    self.shared.counters.created.fetch_add(1, Ordering::SeqCst);
    Ok(SimTask {
      kind,
      ctrl: CtrlParam::default(),
      input: None,
      rois: Vec::new(),
      started: None,
      done: false,
      shared: self.shared.clone(),
    })
  }
}

pub struct SimTask {
  kind: TaskKind,
  ctrl: CtrlParam,
  input: Option<ModelInput>,
  rois: Vec<Roi>,
  started: Option<Instant>,
  done: bool,
  shared: Arc<Shared>,
}

impl SimTask {
  pub fn kind(&self) -> TaskKind {
    self.kind
  }

  fn finish(&mut self) {
    if !self.done {
      self.done = true;
      self.shared.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
  }
}

impl HardwareTask for SimTask {
  fn set_ctrl_param(&mut self, param: CtrlParam) {
    self.ctrl = param;
  }

  fn set_inputs(&mut self, input: &ModelInput) -> Result<(), HwError> {
    if input.is_empty() {
      return Err(HwError::Failed(SIM_INVALID_INPUT));
    }
    self.input = Some(input.clone());
    Ok(())
  }

  fn set_rois(&mut self, rois: &[Roi]) -> Result<(), HwError> {
    if rois.iter().any(|r| !r.is_valid()) {
      return Err(HwError::Failed(SIM_INVALID_INPUT));
    }
    self.rois = rois.to_vec();
    Ok(())
  }

  fn process_input(&mut self) -> Result<(), HwError> {
    match self.input {
      Some(_) => Ok(()),
      None => Err(HwError::Failed(SIM_INVALID_INPUT)),
    }
  }

  fn run_infer(&mut self) -> Result<(), HwError> {
    if self.input.is_none() {
      return Err(HwError::Failed(SIM_INVALID_INPUT));
    }
    let counters = &self.shared.counters;
    let rejected = match self.shared.reject {
      RejectPolicy::Never => false,
      RejectPolicy::CustomParams => self.ctrl != CtrlParam::default(),
      RejectPolicy::Always => true,
    };
    if rejected {
      counters.rejected.fetch_add(1, Ordering::SeqCst);
      return Err(HwError::InvalidParameter(SIM_INVALID_ARGUMENT));
    }

    let run = counters.runs.fetch_add(1, Ordering::SeqCst) + 1;
    if self.shared.fail_every.is_some_and(|n| run % n == 0) {
      return Err(HwError::Failed(SIM_RUN_FAILED));
    }

    match self.ctrl.core {
      CoreId::Core0 => counters.core0.fetch_add(1, Ordering::SeqCst),
      CoreId::Core1 => counters.core1.fetch_add(1, Ordering::SeqCst),
      CoreId::Any => counters.any.fetch_add(1, Ordering::SeqCst),
    };
    let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
    counters.max_active.fetch_max(active, Ordering::SeqCst);
    debug!("模拟推理开始, 核: {:?}, 并发: {}", self.ctrl.core, active);

    self.started = Some(Instant::now());
    self.done = false;
    Ok(())
  }

  fn wait_infer_done(&mut self, timeout: Duration) -> Result<(), HwError> {
    let started = self.started.ok_or(HwError::Failed(SIM_INVALID_INPUT))?;
    if self.done {
      return Ok(());
    }
    if self.shared.hang {
      thread::sleep(timeout);
      return Err(HwError::Pending);
    }

    let remaining = self.shared.latency.saturating_sub(started.elapsed());
    if remaining <= timeout {
      thread::sleep(remaining);
      self.finish();
      Ok(())
    } else {
      thread::sleep(timeout);
      Err(HwError::Pending)
    }
  }

  fn output_tensors(&mut self) -> Result<Vec<Tensor>, HwError> {
    if !self.done {
      return Err(HwError::Failed(SIM_RUN_FAILED));
    }
    let input = self.input.as_ref().ok_or(HwError::Failed(SIM_INVALID_INPUT))?;
    Ok(match &self.shared.outputs {
      Some(outputs) => outputs(input, &self.rois),
      None => Vec::new(),
    })
  }

  fn reset(&mut self) {
    if self.started.is_some() {
      self.finish();
    }
    self.ctrl = CtrlParam::default();
    self.input = None;
    self.rois.clear();
    self.started = None;
    self.done = false;
  }
}
