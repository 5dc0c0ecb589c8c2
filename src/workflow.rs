// 该文件是 Qianli （千里眼） 项目的一部分。
// src/workflow.rs - 压测工作流
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
  sync::{Arc, mpsc},
  thread,
  time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
  accel::Accelerator,
  frame::{InputFrame, ModelInput},
  input::{DataIterator, InputProducer},
  node::{DnnNode, NodeOutput, Outcome, RunMode},
  shutdown::ShutdownSignal,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

pub trait Workflow<A: Accelerator>: Sized {
  type Error;
  fn run_workflow(
    self,
    input: Box<dyn DataIterator>,
    node: Arc<DnnNode<A>>,
  ) -> Result<WorkflowReport, Self::Error>;
}

/// 一次工作流的汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowReport {
  pub frames: usize,
  pub completed: usize,
  pub skipped: usize,
  pub failed: usize,
  pub detections: usize,
  /// 已完成帧从提交到回调的平均耗时
  pub average_latency: Option<Duration>,
  pub elapsed: Duration,
}

impl WorkflowReport {
  pub fn fps(&self) -> f32 {
    if self.elapsed.is_zero() {
      0.0
    } else {
      self.frames as f32 / self.elapsed.as_secs_f32()
    }
  }
}

#[derive(Default)]
struct Tally {
  frames: usize,
  completed: usize,
  skipped: usize,
  failed: usize,
  detections: usize,
  latencies: Vec<Duration>,
}

impl Tally {
  fn record<M>(&mut self, output: &NodeOutput<M>, latency: Duration) {
    self.frames += 1;
    match &output.outcome {
      Outcome::Completed => {
        self.completed += 1;
        self.latencies.push(latency);
      }
      Outcome::Skipped => self.skipped += 1,
      Outcome::Failed(_) => self.failed += 1,
    }
    self.detections += output.result.as_ref().map_or(0, |r| r.len());
  }

  /// 丢弃前 `warmup` 个样本后求平均
  fn report(&self, elapsed: Duration, warmup: usize) -> WorkflowReport {
    let samples = if self.latencies.len() > warmup {
      &self.latencies[warmup..]
    } else {
      &self.latencies[..]
    };
    let average_latency = if samples.is_empty() {
      None
    } else {
      Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    };
    WorkflowReport {
      frames: self.frames,
      completed: self.completed,
      skipped: self.skipped,
      failed: self.failed,
      detections: self.detections,
      average_latency,
      elapsed,
    }
  }
}

/// 同步推理一帧，返回回调收到的输出
fn run_sync<A: Accelerator>(
  node: &DnnNode<A>,
  frame: InputFrame,
) -> anyhow::Result<(NodeOutput<()>, Duration)> {
  let (tx, rx) = mpsc::channel();
  let now = Instant::now();
  node.run(
    ModelInput::Frames(vec![frame]),
    None,
    (),
    RunMode::Sync,
    move |output| {
      let _ = tx.send(output);
    },
  )?;
  let output = rx.recv()?;
  Ok((output, now.elapsed()))
}

fn first_frame(input: &mut dyn DataIterator) -> anyhow::Result<InputFrame> {
  while input.has_next() {
    if let Some(frame) = input.next_frame() {
      return Ok(frame);
    }
    thread::sleep(Duration::from_millis(1));
  }
  Err(anyhow::anyhow!("没有输入帧"))
}

pub struct OneShotWorkflow;

impl<A: Accelerator> Workflow<A> for OneShotWorkflow {
  type Error = anyhow::Error;

  fn run_workflow(
    self,
    mut input: Box<dyn DataIterator>,
    node: Arc<DnnNode<A>>,
  ) -> Result<WorkflowReport, Self::Error> {
    info!("开始任务...");
    let frame = first_frame(input.as_mut())?;
    info!("输入帧获取成功，开始推理...");
    let (output, elapsed) = run_sync(&node, frame)?;
    if let Some(e) = output.error() {
      warn!("推理失败: {}", e);
    }
    info!(
      "推理完成，耗时: {:.2?}, 推理: {:.2?}, 解析: {:.2?}",
      elapsed, output.stat.infer_time, output.stat.parse_time
    );

    let mut tally = Tally::default();
    tally.record(&output, elapsed);
    Ok(tally.report(elapsed, 0))
  }
}

#[derive(Debug)]
pub struct RepeatShotWorkflow {
  times: usize,
}

impl Default for RepeatShotWorkflow {
  fn default() -> Self {
    Self { times: 1000 }
  }
}

impl RepeatShotWorkflow {
  pub fn with_times(mut self, times: usize) -> Self {
    self.times = times.max(1);
    self
  }
}

impl<A: Accelerator> Workflow<A> for RepeatShotWorkflow {
  type Error = anyhow::Error;

  fn run_workflow(
    self,
    mut input: Box<dyn DataIterator>,
    node: Arc<DnnNode<A>>,
  ) -> Result<WorkflowReport, Self::Error> {
    info!("开始任务...");
    let frame = first_frame(input.as_mut())?;
    info!("输入帧获取成功，开始推理...");

    let started = Instant::now();
    let mut tally = Tally::default();
    for i in 0..self.times {
      let (output, elapsed) = run_sync(&node, frame.clone())?;
      info!("({})推理完成，耗时: {:.2?}", i, elapsed);
      tally.record(&output, elapsed);
    }

    // 前两次包含预热，不计入平均
    let report = tally.report(started.elapsed(), 2);
    if let Some(average) = report.average_latency {
      warn!("平均推理时间: {:.2?}", average);
    }
    Ok(report)
  }
}

/// 跑满给定帧数后停止
struct TakeFrames {
  inner: Box<dyn DataIterator>,
  remaining: usize,
}

impl DataIterator for TakeFrames {
  fn next_frame(&mut self) -> Option<InputFrame> {
    if self.remaining == 0 {
      return None;
    }
    let frame = self.inner.next_frame();
    if frame.is_some() {
      self.remaining -= 1;
    }
    frame
  }

  fn has_next(&self) -> bool {
    self.remaining > 0 && self.inner.has_next()
  }
}

/// 由输入生产者持续送帧，直到输入耗尽、达到帧数上限或收到停止信号
#[derive(Debug)]
pub struct ContinuousWorkflow {
  frame_number: Option<usize>,
  limit: usize,
  statistic_cycle: usize,
  mode: RunMode,
  stop: ShutdownSignal,
}

impl Default for ContinuousWorkflow {
  fn default() -> Self {
    Self {
      frame_number: None,
      limit: 4,
      statistic_cycle: 100,
      mode: RunMode::Async,
      stop: ShutdownSignal::new(),
    }
  }
}

impl ContinuousWorkflow {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 输入生产者的背压上限
  pub fn with_limit(mut self, limit: usize) -> Self {
    self.limit = limit;
    self
  }

  pub fn with_statistic_cycle(mut self, statistic_cycle: usize) -> Self {
    self.statistic_cycle = statistic_cycle.max(1);
    self
  }

  pub fn with_mode(mut self, mode: RunMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_stop(mut self, stop: ShutdownSignal) -> Self {
    self.stop = stop;
    self
  }
}

impl<A: Accelerator> Workflow<A> for ContinuousWorkflow {
  type Error = anyhow::Error;

  fn run_workflow(
    self,
    input: Box<dyn DataIterator>,
    node: Arc<DnnNode<A>>,
  ) -> Result<WorkflowReport, Self::Error> {
    info!("开始任务...");
    let input: Box<dyn DataIterator> = match self.frame_number {
      Some(remaining) => Box::new(TakeFrames { inner: input, remaining }),
      None => input,
    };

    let tally = Arc::new(Mutex::new(Tally::default()));
    let mut producer = InputProducer::new(self.limit);
    let releaser = producer.releaser();
    let feed_tally = tally.clone();
    let cycle = self.statistic_cycle;
    let mode = self.mode;
    let feed_node = node.clone();
    producer.start(input, move |id, frame| {
      let submitted = Instant::now();
      let tally = feed_tally.clone();
      let releaser = releaser.clone();
      let res = feed_node.run(
        ModelInput::Frames(vec![frame]),
        None,
        id,
        mode,
        move |output: NodeOutput<u64>| {
          {
            let mut tally = tally.lock();
            tally.record(&output, submitted.elapsed());
            if tally.frames % cycle == 0 {
              info!(
                "已处理 {} 帧, 输入帧率: {:.2}, 输出帧率: {:.2}, 推理耗时: {:.2?}",
                tally.frames,
                output.stat.input_fps,
                output.stat.output_fps,
                output.stat.infer_time
              );
            }
          }
          releaser.release();
        },
      );
      if let Err(e) = res {
        warn!("第 {} 帧提交失败: {}", id, e);
      }
    })?;

    let started = Instant::now();
    while producer.is_running() && !self.stop.is_triggered() {
      thread::sleep(POLL_INTERVAL);
    }
    if self.stop.is_triggered() {
      warn!("中断信号接收，退出任务循环");
    }
    producer.stop();

    let report = tally.lock().report(started.elapsed(), 0);
    info!(
      "任务完成: {} 帧, 成功 {}, 跳过 {}, 失败 {}, 帧率 {:.2}, 平均延迟 {:.2?}",
      report.frames,
      report.completed,
      report.skipped,
      report.failed,
      report.fps(),
      report.average_latency
    );
    Ok(report)
  }
}

/// Ctrl-C 触发 `stop`；30 秒内没有退出则强制结束进程
pub fn install_interrupt_handler(stop: ShutdownSignal) -> Result<(), ctrlc::Error> {
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    stop.trigger();
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    accel::SimAccelerator,
    config::NodeConfig,
    frame::PixelLayout,
    input::RepeatIterator,
  };

  fn node() -> Arc<DnnNode<SimAccelerator>> {
    let accel = Arc::new(
      SimAccelerator::builder()
        .latency(Duration::from_millis(2))
        .build(),
    );
    Arc::new(
      DnnNode::builder(accel)
        .config(NodeConfig::default())
        .build()
        .unwrap(),
    )
  }

  fn frames(count: Option<usize>) -> Box<dyn DataIterator> {
    Box::new(RepeatIterator::new(
      InputFrame::zeroed(PixelLayout::Nv12, 4, 4),
      count,
    ))
  }

  #[test]
  fn one_shot() {
    let report = OneShotWorkflow.run_workflow(frames(Some(1)), node()).unwrap();
    assert_eq!(report.frames, 1);
    assert_eq!(report.completed, 1);
    assert!(report.average_latency.is_some());
  }

  #[test]
  fn one_shot_without_input() {
    assert!(OneShotWorkflow.run_workflow(frames(Some(0)), node()).is_err());
  }

  #[test]
  fn repeat_shot_skips_warmup() {
    let report = RepeatShotWorkflow::default()
      .with_times(5)
      .run_workflow(frames(Some(1)), node())
      .unwrap();
    assert_eq!(report.frames, 5);
    assert_eq!(report.completed, 5);
    assert!(report.average_latency.is_some());
  }

  #[test]
  fn continuous_stops_at_frame_number() {
    let report = ContinuousWorkflow::default()
      .with_frame_number(Some(20))
      .with_statistic_cycle(5)
      .run_workflow(frames(None), node())
      .unwrap();
    assert_eq!(report.frames, 20);
    assert_eq!(report.completed + report.failed, 20);
  }

  #[test]
  fn continuous_stops_on_signal() {
    let stop = ShutdownSignal::new();
    let trigger = stop.clone();
    let handle = thread::spawn(move || {
      thread::sleep(Duration::from_millis(50));
      trigger.trigger();
    });
    let report = ContinuousWorkflow::default()
      .with_mode(RunMode::Sync)
      .with_stop(stop)
      .run_workflow(frames(None), node())
      .unwrap();
    handle.join().unwrap();
    assert!(report.frames > 0);
    assert_eq!(report.frames, report.completed);
  }
}
