// 该文件是 Qianli （千里眼） 项目的一部分。
// src/executor.rs - 推理执行
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

use std::{
  sync::atomic::{AtomicBool, Ordering},
  time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::{
  accel::{CoreId, CtrlParam, HardwareTask},
  error::{DnnError, HwError, Stage},
  parser::{DetectResult, OutputParser},
  shutdown::ShutdownSignal,
  stat::RunTimeStat,
  tensor::Tensor,
};

/// 一次推理的原始输出和（可选的）解析结果
#[derive(Debug, Default)]
pub struct InferOutput {
  pub tensors: Vec<Tensor>,
  pub result: Option<DetectResult>,
}

pub struct InferenceExecutor {
  /// 控制参数被 NPU 拒绝过一次后永久关闭
  ctrl_param_enabled: AtomicBool,
  wait_tick: Duration,
  shutdown: ShutdownSignal,
}

impl InferenceExecutor {
  pub fn new(ctrl_param_enabled: bool, wait_tick: Duration, shutdown: ShutdownSignal) -> Self {
    Self {
      ctrl_param_enabled: AtomicBool::new(ctrl_param_enabled),
      wait_tick: wait_tick.max(Duration::from_millis(1)),
      shutdown,
    }
  }

  pub fn ctrl_param_enabled(&self) -> bool {
    self.ctrl_param_enabled.load(Ordering::Acquire)
  }

  /// 允许配置控制参数时，把任务绑定到指定核
  pub fn configure<T: HardwareTask>(&self, id: usize, task: &mut T, core: CoreId) {
    if self.ctrl_param_enabled() {
      debug!("任务 {} 设置 NPU 核: {:?}", id, core);
      task.set_ctrl_param(CtrlParam::on_core(core));
    }
  }

  /// 启动推理。控制参数被拒绝时使用默认参数重试一次，
  /// 重试成功后不再配置控制参数。
  pub fn run_infer<T: HardwareTask>(&self, task: &mut T) -> Result<(), DnnError> {
    match task.run_infer() {
      Ok(()) => Ok(()),
      Err(HwError::InvalidParameter(code)) => {
        error!("推理失败, 错误码: {}", code);
        warn!("尝试使用默认控制参数重新推理");
        task.set_ctrl_param(CtrlParam::default());
        match task.run_infer() {
          Ok(()) => {
            warn!("使用默认控制参数推理成功，此后不再配置任务控制参数");
            self.ctrl_param_enabled.store(false, Ordering::Release);
            Ok(())
          }
          Err(e) => {
            error!("使用默认控制参数重试失败: {}", e);
            Err(e.into())
          }
        }
      }
      Err(e) => {
        error!("推理失败: {}", e);
        Err(e.into())
      }
    }
  }

  /// 分片等待推理完成，每个时间片之间检查退出信号
  pub fn wait_infer_done<T: HardwareTask>(
    &self,
    task: &mut T,
    timeout: Option<Duration>,
  ) -> Result<(), DnnError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
      if self.shutdown.is_triggered() {
        return Err(DnnError::Shutdown);
      }
      let slice = match deadline {
        Some(deadline) => {
          let remaining = deadline.saturating_duration_since(Instant::now());
          if remaining.is_zero() {
            error!("等待推理完成超时: {:?}", timeout);
            return Err(DnnError::Timeout {
              stage: Stage::InferDone,
              after: timeout.unwrap_or_default(),
            });
          }
          remaining.min(self.wait_tick)
        }
        None => self.wait_tick,
      };
      match task.wait_infer_done(slice) {
        Ok(()) => return Ok(()),
        Err(HwError::Pending) => continue,
        Err(e) => {
          error!("等待推理完成失败: {}", e);
          return Err(e.into());
        }
      }
    }
  }

  /// 执行推理并取出输出张量，有解析器时一并解析。
  ///
  /// 推理阶段与解析阶段的耗时无论成功与否都写入 `stat`。
  pub fn execute<T: HardwareTask>(
    &self,
    task: &mut T,
    timeout: Option<Duration>,
    parser: Option<&dyn OutputParser>,
    stat: &mut RunTimeStat,
  ) -> Result<InferOutput, DnnError> {
    let started = Instant::now();
    stat.infer_start = Some(Utc::now());
    let inferred = self
      .run_infer(task)
      .and_then(|()| self.wait_infer_done(task, timeout));
    stat.infer_time = started.elapsed();
    stat.infer_end = Some(Utc::now());
    inferred?;
    debug!("推理完成, 耗时: {:.2?}", stat.infer_time);

    let started = Instant::now();
    stat.parse_start = Some(Utc::now());
    let parsed = task
      .output_tensors()
      .map_err(DnnError::from)
      .and_then(|tensors| {
        let result = match parser {
          Some(parser) => Some(parser.parse(&tensors)?),
          None => None,
        };
        Ok(InferOutput { tensors, result })
      });
    stat.parse_time = started.elapsed();
    stat.parse_end = Some(Utc::now());
    if let Err(e) = &parsed {
      error!("获取或解析输出失败: {}", e);
    }
    parsed
  }
}
