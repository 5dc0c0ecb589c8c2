// 该文件是 Qianli （千里眼） 项目的一部分。
// src/bin/benchmark.rs - 推理调度压测程序
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

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use qianli::{
  FromUrl,
  accel::SimAccelerator,
  config::{NodeConfig, Yolo5Config},
  input::IteratorRegistry,
  node::{DnnNode, RunMode},
  parser::Yolo5Parser,
  shutdown::ShutdownSignal,
  tensor::{Quantization, Shape, Tensor, TensorData, TensorLayout, TensorMeta},
  workflow::{
    ContinuousWorkflow, OneShotWorkflow, RepeatShotWorkflow, Workflow, WorkflowReport,
    install_interrupt_handler,
  },
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WorkflowKind {
  OneShot,
  Repeat,
  Continuous,
}

/// Qianli 推理调度压测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// 推理节点配置，如 file:///etc/qianli/node.json
  #[arg(long, value_name = "CONFIG")]
  config: Option<Url>,
  /// 检测输出解析配置
  #[arg(long, value_name = "CONFIG")]
  parser_config: Option<Url>,
  /// 输入来源，如 repeat://nv12?width=640&height=640 或 rawdir:///data/frames?width=640&height=640
  #[arg(long, value_name = "SOURCE", default_value = "repeat://nv12?width=640&height=640")]
  input: Url,
  #[arg(long, value_enum, default_value = "continuous")]
  workflow: WorkflowKind,
  /// 连续模式下处理的最大帧数
  #[arg(long, value_name = "FRAME_NUMBER")]
  frame_number: Option<usize>,
  /// repeat 模式的重复次数
  #[arg(long, default_value = "1000")]
  repeat_times: usize,
  /// 每处理多少帧输出一次统计
  #[arg(long, default_value = "100")]
  statistic_cycle: usize,
  /// 输入生产者的背压上限
  #[arg(long, default_value = "4")]
  limit: usize,
  /// 使用同步推理
  #[arg(long)]
  sync: bool,
  /// 模型输入宽度
  #[arg(long, default_value = "640")]
  model_width: usize,
  /// 模型输入高度
  #[arg(long, default_value = "640")]
  model_height: usize,
  /// 模拟设备的 NPU 核数
  #[arg(long, default_value = "2")]
  sim_cores: usize,
  /// 模拟设备单次推理耗时（毫秒）
  #[arg(long, default_value = "20")]
  sim_latency_ms: u64,
}

/// 每个分支中心放一个目标，其余位置 objectness 很低
fn synthetic_outputs(config: &Yolo5Config, width: usize, height: usize) -> Result<Vec<Tensor>> {
  const LOW: f32 = -8.0;
  const HIGH: f32 = 4.0;

  let per_anchor = 5 + config.class_num;
  let mut tensors = Vec::with_capacity(config.strides.len());
  for (branch, (&stride, anchors)) in config.strides.iter().zip(&config.anchors).enumerate() {
    let (h, w) = (height / stride as usize, width / stride as usize);
    let c = anchors.len() * per_anchor;
    let mut data = vec![LOW; h * w * c];
    for cell in data.chunks_mut(per_anchor) {
      cell[..4].fill(0.0);
    }
    if h > 0 && w > 0 && config.class_num > 0 {
      let base = ((h / 2) * w + w / 2) * c;
      data[base + 4] = HIGH;
      data[base + 5 + branch % config.class_num] = HIGH;
    }
    let meta = TensorMeta::new(TensorLayout::Nhwc, Shape::new(1, h, w, c), Quantization::None);
    tensors.push(Tensor::new(meta, TensorData::F32(data.into_boxed_slice()))?);
  }
  Ok(tensors)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  info!("输入来源: {}", args.input);

  let node_config = match &args.config {
    Some(url) => NodeConfig::from_url(url)?,
    None => NodeConfig::default(),
  };
  let parser_config = match &args.parser_config {
    Some(url) => Yolo5Config::from_url(url)?,
    None => Yolo5Config::default(),
  };
  info!("{}", parser_config.describe());

  let registry = IteratorRegistry::with_builtin();
  info!(
    "可用输入类型: {}",
    registry.schemes().collect::<Vec<_>>().join(", ")
  );
  let input = registry.open(&args.input)?;

  let outputs = synthetic_outputs(&parser_config, args.model_width, args.model_height)?;
  let accel = Arc::new(
    SimAccelerator::builder()
      .core_num(args.sim_cores)
      .latency(Duration::from_millis(args.sim_latency_ms))
      .outputs(move |_, _| outputs.clone())
      .build(),
  );

  let shutdown = ShutdownSignal::new();
  let node = Arc::new(
    DnnNode::builder(accel.clone())
      .config(node_config)
      .parser(Yolo5Parser::new(parser_config)?)
      .shutdown(shutdown.clone())
      .build()?,
  );

  let stop = ShutdownSignal::new();
  install_interrupt_handler(stop.clone())?;
  let mode = if args.sync {
    RunMode::Sync
  } else {
    RunMode::Async
  };

  let report: WorkflowReport = match args.workflow {
    WorkflowKind::OneShot => OneShotWorkflow.run_workflow(input, node.clone())?,
    WorkflowKind::Repeat => RepeatShotWorkflow::default()
      .with_times(args.repeat_times)
      .run_workflow(input, node.clone())?,
    WorkflowKind::Continuous => ContinuousWorkflow::default()
      .with_frame_number(args.frame_number)
      .with_limit(args.limit)
      .with_statistic_cycle(args.statistic_cycle)
      .with_mode(mode)
      .with_stop(stop)
      .run_workflow(input, node.clone())?,
  };

  node.shutdown();
  info!("压测结果: {:?}", report);
  info!("模拟设备统计: {:?}", accel.stats());
  Ok(())
}
