// 该文件是 Qianli （千里眼） 项目的一部分。
// tests/scheduler.rs - 推理节点调度测试
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
  sync::{
    Arc, mpsc,
    atomic::{AtomicUsize, Ordering},
  },
  thread,
  time::Duration,
};

use qianli::{
  DnnError,
  accel::{RejectPolicy, SimAccelerator, TaskKind},
  config::{BoxCoding, NodeConfig, Yolo5Config},
  error::Stage,
  frame::{InputFrame, ModelInput, PixelLayout, Roi},
  node::{DnnNode, NodeOutput, Outcome, RunMode},
  parser::Yolo5Parser,
  tensor::{Quantization, Shape, Tensor, TensorData, TensorLayout, TensorMeta},
};

fn frame() -> ModelInput {
  ModelInput::Frames(vec![InputFrame::zeroed(PixelLayout::Nv12, 4, 4)])
}

fn node(accel: &Arc<SimAccelerator>, config: NodeConfig) -> DnnNode<SimAccelerator> {
  DnnNode::builder(accel.clone())
    .config(config)
    .build()
    .unwrap()
}

/// 同步执行一次并取回回调输出
fn run_sync(node: &DnnNode<SimAccelerator>, rois: Option<Vec<Roi>>) -> NodeOutput<()> {
  let (tx, rx) = mpsc::channel();
  node
    .run(frame(), rois, (), RunMode::Sync, move |output| {
      tx.send(output).unwrap();
    })
    .unwrap();
  let output = rx.recv().unwrap();
  assert!(rx.try_recv().is_err());
  output
}

#[test]
fn concurrency_never_exceeds_task_num() {
  let accel = Arc::new(
    SimAccelerator::builder()
      .latency(Duration::from_millis(20))
      .build(),
  );
  let node = node(
    &accel,
    NodeConfig {
      task_num: 2,
      worker_num: Some(6),
      queue_limit: 64,
      alloc_timeout_ms: 0,
      ..NodeConfig::default()
    },
  );

  let (tx, rx) = mpsc::channel();
  for i in 0..16 {
    let tx = tx.clone();
    node
      .run(frame(), None, i, RunMode::Async, move |output| {
        tx.send((output.context, output.is_completed())).unwrap();
      })
      .unwrap();
  }
  drop(tx);

  let mut seen: Vec<usize> = rx
    .iter()
    .map(|(id, completed)| {
      assert!(completed);
      id
    })
    .collect();
  seen.sort();
  assert_eq!(seen, (0..16).collect::<Vec<_>>());

  let stats = accel.stats();
  assert_eq!(stats.runs, 16);
  assert!(stats.max_active <= 2, "max_active = {}", stats.max_active);
  assert_eq!(node.pool().running_count(), 0);
  assert_eq!(node.pool().idle_count(), 2);
}

#[test]
fn cores_alternate_across_submissions() {
  let accel = Arc::new(
    SimAccelerator::builder()
      .latency(Duration::from_millis(1))
      .build(),
  );
  let node = node(
    &accel,
    NodeConfig {
      task_num: 1,
      ..NodeConfig::default()
    },
  );
  for _ in 0..4 {
    assert!(run_sync(&node, None).is_completed());
  }
  let stats = accel.stats();
  assert_eq!(stats.core0, 2);
  assert_eq!(stats.core1, 2);
}

#[test]
fn empty_roi_list_skips_inference() {
  let accel = Arc::new(SimAccelerator::builder().build());
  let node = node(
    &accel,
    NodeConfig {
      task_type: TaskKind::RoiInfer,
      ..NodeConfig::default()
    },
  );

  let skipped = run_sync(&node, None);
  assert!(matches!(skipped.outcome, Outcome::Skipped));
  assert!(skipped.tensors.is_empty());

  let skipped = run_sync(&node, Some(Vec::new()));
  assert!(matches!(skipped.outcome, Outcome::Skipped));
  assert_eq!(skipped.rois, Some(Vec::new()));
  assert_eq!(accel.stats().created, 0);

  let done = run_sync(&node, Some(vec![Roi::new(0, 0, 2, 2)]));
  assert!(done.is_completed());
  assert_eq!(accel.stats().runs, 1);
}

#[test]
fn allocation_timeout_still_calls_back() {
  let accel = Arc::new(
    SimAccelerator::builder()
      .latency(Duration::from_millis(300))
      .build(),
  );
  let node = Arc::new(node(
    &accel,
    NodeConfig {
      task_num: 1,
      alloc_timeout_ms: 30,
      ..NodeConfig::default()
    },
  ));

  let calls = Arc::new(AtomicUsize::new(0));
  let holder = {
    let node = node.clone();
    let calls = calls.clone();
    thread::spawn(move || {
      node
        .run(frame(), None, (), RunMode::Sync, move |output| {
          assert!(output.is_completed());
          calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    })
  };
  while node.pool().running_count() == 0 {
    thread::sleep(Duration::from_millis(1));
  }

  let output = run_sync(&node, None);
  match output.error() {
    Some(e @ DnnError::Timeout {
      stage: Stage::Allocate,
      ..
    }) => assert!(e.is_overload()),
    other => panic!("unexpected outcome: {:?}", other),
  }
  assert!(output.stat.infer_start.is_none());

  holder.join().unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(accel.stats().runs, 1);
}

#[test]
fn async_queue_rejects_at_limit() {
  let accel = Arc::new(
    SimAccelerator::builder()
      .latency(Duration::from_millis(100))
      .build(),
  );
  let node = node(
    &accel,
    NodeConfig {
      task_num: 1,
      worker_num: Some(1),
      queue_limit: 1,
      alloc_timeout_ms: 0,
      ..NodeConfig::default()
    },
  );

  let (tx, rx) = mpsc::channel();
  let submit = |id: usize| {
    let tx = tx.clone();
    node.run(frame(), None, id, RunMode::Async, move |output| {
      tx.send((output.context, output.outcome)).unwrap();
    })
  };

  submit(0).unwrap();
  while node.pending() > 0 {
    thread::sleep(Duration::from_millis(1));
  }
  submit(1).unwrap();
  let rejected = submit(2);
  assert!(matches!(&rejected, Err(e) if e.is_overload()));

  // 被拒绝的提交立即回调
  let (id, outcome) = rx.recv_timeout(Duration::from_millis(50)).unwrap();
  assert_eq!(id, 2);
  assert!(matches!(outcome, Outcome::Failed(DnnError::ResourceExhausted(_))));

  drop(tx);
  let mut rest: Vec<usize> = rx
    .iter()
    .map(|(id, outcome)| {
      assert!(matches!(outcome, Outcome::Completed));
      id
    })
    .collect();
  rest.sort();
  assert_eq!(rest, vec![0, 1]);
}

#[test]
fn rejected_ctrl_param_is_retried_once() {
  let accel = Arc::new(
    SimAccelerator::builder()
      .reject(RejectPolicy::CustomParams)
      .latency(Duration::from_millis(1))
      .build(),
  );
  let node = node(&accel, NodeConfig::default());

  assert!(run_sync(&node, None).is_completed());
  assert!(run_sync(&node, None).is_completed());
  let stats = accel.stats();
  assert_eq!(stats.rejected, 1);
  assert_eq!(stats.any, 2);
  assert_eq!(stats.runs, 2);
}

#[test]
fn disabled_ctrl_params_are_never_sent() {
  let accel = Arc::new(
    SimAccelerator::builder()
      .reject(RejectPolicy::CustomParams)
      .latency(Duration::from_millis(1))
      .build(),
  );
  let node = node(
    &accel,
    NodeConfig {
      ctrl_param_enabled: false,
      ..NodeConfig::default()
    },
  );
  assert!(run_sync(&node, None).is_completed());
  assert_eq!(accel.stats().rejected, 0);
}

#[test]
fn hardware_failure_releases_slot() {
  let accel = Arc::new(SimAccelerator::builder().fail_every(1).build());
  let node = node(
    &accel,
    NodeConfig {
      task_num: 1,
      ..NodeConfig::default()
    },
  );

  for _ in 0..3 {
    let output = run_sync(&node, None);
    assert!(matches!(
      output.error(),
      Some(DnnError::HardwareExecution(_))
    ));
    assert!(output.stat.infer_end.is_some());
  }
  assert_eq!(node.pool().running_count(), 0);
  assert_eq!(node.pool().idle_count(), 1);
  assert_eq!(node.output_fps(), 0.0);
}

#[test]
fn infer_timeout_is_reported() {
  let accel = Arc::new(SimAccelerator::builder().hang(true).build());
  let node = node(
    &accel,
    NodeConfig {
      infer_timeout_ms: 30,
      ..NodeConfig::default()
    },
  );
  let output = run_sync(&node, None);
  assert!(matches!(
    output.error(),
    Some(DnnError::Timeout {
      stage: Stage::InferDone,
      ..
    })
  ));
  assert!(output.stat.infer_time >= Duration::from_millis(30));
  assert_eq!(node.pool().idle_count(), 2);
}

#[test]
fn shutdown_fails_in_flight_work() {
  let accel = Arc::new(SimAccelerator::builder().hang(true).build());
  let node = node(
    &accel,
    NodeConfig {
      infer_timeout_ms: 0,
      ..NodeConfig::default()
    },
  );

  let (tx, rx) = mpsc::channel();
  node
    .run(frame(), None, (), RunMode::Async, move |output| {
      tx.send(output.outcome).unwrap();
    })
    .unwrap();
  while node.pool().running_count() == 0 {
    thread::sleep(Duration::from_millis(1));
  }

  node.shutdown();
  let outcome = rx.recv_timeout(Duration::from_secs(1)).unwrap();
  assert!(matches!(outcome, Outcome::Failed(DnnError::Shutdown)));
}

#[test]
fn parser_decodes_device_outputs() {
  let config = Yolo5Config {
    strides: vec![16],
    anchors: vec![vec![[10.0, 20.0]]],
    class_num: 2,
    class_names: vec!["a".to_string(), "b".to_string()],
    dequantize_scale: Some(vec![vec![0.05; 7]]),
    score_threshold: 0.4,
    nms_threshold: 0.5,
    nms_top_k: 10,
    box_coding: BoxCoding::LogScale,
  };
  // 2x2 特征图，(1, 1) 处有一个类别 1 的目标
  let mut data = vec![-100i8; 4 * 7];
  let cell = 3 * 7;
  data[cell..cell + 4].fill(0);
  data[cell + 4] = 60;
  data[cell + 6] = 80;
  let tensor = Tensor::new(
    TensorMeta::new(TensorLayout::Nhwc, Shape::new(1, 2, 2, 7), Quantization::None),
    TensorData::I8(data.into_boxed_slice()),
  )
  .unwrap();

  let accel = Arc::new(
    SimAccelerator::builder()
      .latency(Duration::from_millis(1))
      .outputs(move |_, _| vec![tensor.clone()])
      .build(),
  );
  let node = DnnNode::builder(accel)
    .parser(Yolo5Parser::new(config).unwrap())
    .build()
    .unwrap();

  let output = run_sync(&node, None);
  assert!(output.is_completed());
  assert_eq!(output.tensors.len(), 1);
  let result = output.result.unwrap();
  assert_eq!(result.len(), 1);
  let item = &result.items[0];
  assert_eq!(item.class_id, 1);
  // 中心 (1.5, 1.5) * 16 = (24, 24)
  assert!((item.bbox[0] - 19.0).abs() < 1e-3);
  assert!((item.bbox[1] - 14.0).abs() < 1e-3);
  assert!(output.stat.parse_end.is_some());
}

#[test]
fn undecodable_outputs_fail_through_callback() {
  let config = Yolo5Config {
    strides: vec![16],
    anchors: vec![vec![[10.0, 20.0]]],
    class_num: 2,
    class_names: vec!["a".to_string(), "b".to_string()],
    dequantize_scale: None,
    score_threshold: 0.4,
    nms_threshold: 0.5,
    nms_top_k: 10,
    box_coding: BoxCoding::LogScale,
  };
  // 一个锚框两个类别需要 7 个通道，设备只给了 6 个
  let tensor = Tensor::new(
    TensorMeta::new(
      TensorLayout::Nhwc,
      Shape::new(1, 1, 1, 6),
      Quantization::Shift(vec![4]),
    ),
    TensorData::I8(vec![0; 6].into_boxed_slice()),
  )
  .unwrap();

  let accel = Arc::new(
    SimAccelerator::builder()
      .latency(Duration::from_millis(1))
      .outputs(move |_, _| vec![tensor.clone()])
      .build(),
  );
  let node = DnnNode::builder(accel)
    .parser(Yolo5Parser::new(config).unwrap())
    .build()
    .unwrap();

  for _ in 0..3 {
    let output = run_sync(&node, None);
    assert!(matches!(output.error(), Some(DnnError::InvalidArgument(_))));
    assert!(output.result.is_none());
  }
  assert_eq!(node.pool().running_count(), 0);
}
