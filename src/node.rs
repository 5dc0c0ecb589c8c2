// 该文件是 Qianli （千里眼） 项目的一部分。
// src/node.rs - 推理节点
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

//! # 推理节点
//!
//! [`DnnNode`] 串起一次推理的完整流程：
//! 申请任务槽、写入输入、执行推理、解析输出、释放任务槽，最后调用回调。
//!
//! 每次提交都恰好调用一次回调，包括 ROI 为空被跳过、申请超时和推理失败的情况，
//! 保证输入和输出一一对应。

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
  accel::{Accelerator, CoreId, HardwareTask, TaskKind},
  config::NodeConfig,
  error::DnnError,
  executor::{InferOutput, InferenceExecutor},
  frame::{InputType, ModelInput, Roi},
  parser::{DetectResult, OutputParser},
  shutdown::ShutdownSignal,
  slot::{TaskContext, TaskId, TaskPool},
  stat::{FpsStat, RunTimeStat},
  tensor::Tensor,
  worker::{Job, PostError, WorkerPool},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
  /// 在调用线程上执行，回调返回后才返回
  Sync,
  /// 放入工作线程队列，队列满时拒绝
  Async,
}

#[derive(Debug)]
pub enum Outcome {
  Completed,
  /// ROI 推理任务没有收到 ROI，未执行推理
  Skipped,
  Failed(DnnError),
}

/// 每次提交对应的输出，通过回调交给调用者
#[derive(Debug)]
pub struct NodeOutput<M> {
  pub context: M,
  pub rois: Option<Vec<Roi>>,
  pub stat: RunTimeStat,
  pub tensors: Vec<Tensor>,
  pub result: Option<DetectResult>,
  pub outcome: Outcome,
}

impl<M> NodeOutput<M> {
  pub fn is_completed(&self) -> bool {
    matches!(self.outcome, Outcome::Completed)
  }

  pub fn error(&self) -> Option<&DnnError> {
    match &self.outcome {
      Outcome::Failed(e) => Some(e),
      _ => None,
    }
  }
}

struct Inner<A: Accelerator> {
  config: NodeConfig,
  pool: TaskPool<A>,
  executor: InferenceExecutor,
  parser: Option<Box<dyn OutputParser>>,
  input_stat: FpsStat,
  output_stat: FpsStat,
}

pub struct DnnNodeBuilder<A: Accelerator> {
  accel: Arc<A>,
  config: NodeConfig,
  parser: Option<Box<dyn OutputParser>>,
  shutdown: ShutdownSignal,
}

impl<A: Accelerator> DnnNodeBuilder<A> {
  pub fn config(mut self, config: NodeConfig) -> Self {
    self.config = config;
    self
  }

  pub fn parser(mut self, parser: impl OutputParser + 'static) -> Self {
    self.parser = Some(Box::new(parser));
    self
  }

  pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
    self.shutdown = shutdown;
    self
  }

  pub fn build(self) -> Result<DnnNode<A>, DnnError> {
    let config = self.config;
    config.validate()?;

    let pool = TaskPool::new(
      self.accel,
      config.task_type,
      config.task_num,
      &config.core_ids,
      self.shutdown.clone(),
    )?;
    let executor = InferenceExecutor::new(
      config.ctrl_param_enabled,
      config.wait_tick(),
      self.shutdown.clone(),
    );
    let workers = WorkerPool::new(config.worker_num(), config.queue_limit)?;

    info!(
      "推理节点初始化完成, 任务类型: {:?}, 任务数: {}, 解析器: {}",
      config.task_type,
      config.task_num,
      if self.parser.is_some() { "有" } else { "无" }
    );
    Ok(DnnNode {
      inner: Arc::new(Inner {
        config,
        pool,
        executor,
        parser: self.parser,
        input_stat: FpsStat::new(),
        output_stat: FpsStat::new(),
      }),
      workers,
      shutdown: self.shutdown,
    })
  }
}

pub struct DnnNode<A: Accelerator> {
  inner: Arc<Inner<A>>,
  workers: WorkerPool,
  shutdown: ShutdownSignal,
}

impl<A: Accelerator> DnnNode<A> {
  pub fn builder(accel: Arc<A>) -> DnnNodeBuilder<A> {
    DnnNodeBuilder {
      accel,
      config: NodeConfig::default(),
      parser: None,
      shutdown: ShutdownSignal::new(),
    }
  }

  pub fn config(&self) -> &NodeConfig {
    &self.inner.config
  }

  pub fn pool(&self) -> &TaskPool<A> {
    &self.inner.pool
  }

  pub fn input_fps(&self) -> f32 {
    self.inner.input_stat.get()
  }

  pub fn output_fps(&self) -> f32 {
    self.inner.output_stat.get()
  }

  /// 异步队列中等待执行的提交数
  pub fn pending(&self) -> usize {
    self.workers.pending()
  }

  pub fn shutdown_signal(&self) -> &ShutdownSignal {
    &self.shutdown
  }

  /// 提交一次推理。
  ///
  /// 返回值只表示提交是否被接受，推理结果通过回调送达。
  /// 异步队列已满时回调立即以 [`DnnError::ResourceExhausted`] 失败，
  /// 同时返回同类错误。
  pub fn run<M, F>(
    &self,
    input: ModelInput,
    rois: Option<Vec<Roi>>,
    context: M,
    mode: RunMode,
    callback: F,
  ) -> Result<(), DnnError>
  where
    M: Send + 'static,
    F: FnOnce(NodeOutput<M>) + Send + 'static,
  {
    self.inner.input_stat.update();
    match mode {
      RunMode::Sync => {
        self.inner.run_impl(input, rois, context, callback);
        Ok(())
      }
      RunMode::Async => {
        let submission = Submission {
          inner: self.inner.clone(),
          input,
          rois,
          context,
          callback,
        };
        match self.workers.try_post(submission) {
          Ok(()) => Ok(()),
          Err(e) => {
            let reason = match &e {
              PostError::Full(_) => format!("异步队列已满, 上限: {}", self.workers.limit()),
              PostError::Closed(_) => "推理节点已关闭".to_string(),
            };
            warn!("拒绝推理请求: {}", reason);
            e.into_inner()
              .reject(DnnError::ResourceExhausted(reason.clone()));
            Err(DnnError::ResourceExhausted(reason))
          }
        }
      }
    }
  }

  /// 发送退出信号并等待工作线程处理完已入队的提交
  pub fn shutdown(&self) {
    info!("推理节点退出");
    self.shutdown.trigger();
    self.workers.shutdown();
  }
}

/// 放入异步队列的一次提交
struct Submission<A: Accelerator, M, F> {
  inner: Arc<Inner<A>>,
  input: ModelInput,
  rois: Option<Vec<Roi>>,
  context: M,
  callback: F,
}

impl<A, M, F> Submission<A, M, F>
where
  A: Accelerator,
  F: FnOnce(NodeOutput<M>),
{
  fn reject(self, err: DnnError) {
    let stat = RunTimeStat {
      input_fps: self.inner.input_stat.get(),
      output_fps: self.inner.output_stat.get(),
      ..Default::default()
    };
    (self.callback)(NodeOutput {
      context: self.context,
      rois: self.rois,
      stat,
      tensors: Vec::new(),
      result: None,
      outcome: Outcome::Failed(err),
    });
  }
}

impl<A, M, F> Job for Submission<A, M, F>
where
  A: Accelerator,
  M: Send + 'static,
  F: FnOnce(NodeOutput<M>) + Send + 'static,
{
  fn run(self: Box<Self>) {
    let Submission {
      inner,
      input,
      rois,
      context,
      callback,
    } = *self;
    inner.run_impl(input, rois, context, callback);
  }
}

impl<A: Accelerator> Inner<A> {
  fn run_impl<M, F>(&self, input: ModelInput, rois: Option<Vec<Roi>>, context: M, callback: F)
  where
    F: FnOnce(NodeOutput<M>),
  {
    let mut stat = RunTimeStat {
      input_fps: self.input_stat.get(),
      ..Default::default()
    };

    let (tensors, result, outcome) = match self.infer(&input, rois.as_deref(), &mut stat) {
      Ok(Some(output)) => (output.tensors, output.result, Outcome::Completed),
      Ok(None) => (Vec::new(), None, Outcome::Skipped),
      Err(e) => {
        error!("推理失败: {}", e);
        (Vec::new(), None, Outcome::Failed(e))
      }
    };
    if !matches!(outcome, Outcome::Failed(_)) {
      stat.fps_updated = self.output_stat.update();
    }
    stat.output_fps = self.output_stat.get();

    callback(NodeOutput {
      context,
      rois,
      stat,
      tensors,
      result,
      outcome,
    });
  }

  /// ROI 推理没有 ROI 时返回 `Ok(None)`
  fn infer(
    &self,
    input: &ModelInput,
    rois: Option<&[Roi]>,
    stat: &mut RunTimeStat,
  ) -> Result<Option<InferOutput>, DnnError> {
    if input.is_empty() {
      return Err(DnnError::InvalidArgument("输入为空".to_string()));
    }
    if self.pool.kind() == TaskKind::RoiInfer && rois.is_none_or(|rois| rois.is_empty()) {
      debug!("当前帧没有 ROI, 跳过推理");
      return Ok(None);
    }

    let mut lease = self.pool.allocate(self.config.alloc_timeout())?;
    let (id, core) = (lease.id(), lease.core());
    let inferred = match lease.context_mut() {
      Some(context) => self.infer_on(id, core, context, input, rois, stat),
      None => Err(DnnError::InvalidArgument(format!(
        "任务 {} 没有推理上下文",
        id
      ))),
    };

    // 推理失败也要归还任务槽
    let released = lease.release();
    let output = inferred?;
    released?;
    Ok(Some(output))
  }

  fn infer_on(
    &self,
    id: TaskId,
    core: CoreId,
    context: &mut TaskContext<A::Task>,
    input: &ModelInput,
    rois: Option<&[Roi]>,
    stat: &mut RunTimeStat,
  ) -> Result<InferOutput, DnnError> {
    if let Some(rois) = rois {
      context.set_rois(rois)?;
    }
    let task = context.task_mut();
    self.executor.configure(id, task, core);
    task.set_inputs(input)?;
    if input.input_type() == InputType::Frame {
      task.process_input()?;
    }
    self.executor.execute(
      task,
      self.config.infer_timeout(),
      self.parser.as_deref(),
      stat,
    )
  }
}
