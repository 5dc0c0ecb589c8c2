// 该文件是 Qianli （千里眼） 项目的一部分。
// src/config.rs - 节点与解析器配置
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

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  accel::{CoreId, TaskKind},
  error::DnnError,
};

const CONFIG_FILE_SCHEME: &str = "file";

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

fn load_json<T: DeserializeOwned>(url: &Url) -> Result<T, DnnError> {
  if url.scheme() != CONFIG_FILE_SCHEME {
    return Err(DnnError::SchemeMismatch);
  }
  info!("加载配置文件: {}", url.path());
  let text = std::fs::read_to_string(url.path())?;
  Ok(serde_json::from_str(&text)?)
}

fn millis(ms: u64) -> Option<Duration> {
  if ms > 0 {
    Some(Duration::from_millis(ms))
  } else {
    None
  }
}

/// 推理节点配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
  /// 并发推理任务数
  pub task_num: usize,
  /// 为空，或与 `task_num` 等长、按任务槽固定 NPU 核
  pub core_ids: Vec<CoreId>,
  pub task_type: TaskKind,
  /// 异步队列的准入上限
  pub queue_limit: usize,
  /// 异步工作线程数，缺省与 `task_num` 相同
  pub worker_num: Option<usize>,
  /// 申请任务的超时时间，0 表示一直等待
  pub alloc_timeout_ms: u64,
  /// 等待推理完成的超时时间，0 表示一直等待
  pub infer_timeout_ms: u64,
  /// 等待推理完成时检查退出信号的间隔
  pub wait_tick_ms: u64,
  /// 是否允许配置任务控制参数
  pub ctrl_param_enabled: bool,
}

impl Default for NodeConfig {
  fn default() -> Self {
    Self {
      task_num: 2,
      core_ids: Vec::new(),
      task_type: TaskKind::Infer,
      queue_limit: 10,
      worker_num: None,
      alloc_timeout_ms: 100,
      infer_timeout_ms: 1000,
      wait_tick_ms: 10,
      ctrl_param_enabled: true,
    }
  }
}

impl NodeConfig {
  pub fn validate(&self) -> Result<(), DnnError> {
    if self.task_num < 1 {
      return Err(DnnError::Config(format!(
        "task_num 必须大于 0, 实际为 {}",
        self.task_num
      )));
    }
    if !self.core_ids.is_empty() && self.core_ids.len() != self.task_num {
      return Err(DnnError::Config(format!(
        "core_ids 长度 {} 应为 0 或等于 task_num {}",
        self.core_ids.len(),
        self.task_num
      )));
    }
    if self.worker_num == Some(0) {
      return Err(DnnError::Config("worker_num 必须大于 0".to_string()));
    }
    Ok(())
  }

  pub fn worker_num(&self) -> usize {
    self.worker_num.unwrap_or(self.task_num)
  }

  pub fn alloc_timeout(&self) -> Option<Duration> {
    millis(self.alloc_timeout_ms)
  }

  pub fn infer_timeout(&self) -> Option<Duration> {
    millis(self.infer_timeout_ms)
  }

  pub fn wait_tick(&self) -> Duration {
    Duration::from_millis(self.wait_tick_ms.max(1))
  }
}

impl FromUrl for NodeConfig {
  type Error = DnnError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let config: NodeConfig = load_json(url)?;
    config.validate()?;
    debug!("节点配置: {:?}", config);
    Ok(config)
  }
}

impl FromUrlWithScheme for NodeConfig {
  const SCHEME: &'static str = CONFIG_FILE_SCHEME;
}

/// 边界框编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxCoding {
  /// 中心偏移 `sigmoid(t) + grid`，宽高 `anchor * exp(t)`
  LogScale,
  /// 中心偏移 `2 * sigmoid(t) - 0.5 + grid`，宽高 `anchor * (2 * sigmoid(t))^2`
  Yolov5,
}

/// YOLOv5 输出解析配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Yolo5Config {
  /// 每个输出分支的步长
  pub strides: Vec<u32>,
  /// 每个输出分支的锚框 `[w, h]`，单位为模型输入像素
  pub anchors: Vec<Vec<[f32; 2]>>,
  pub class_num: usize,
  pub class_names: Vec<String>,
  /// 每个输出分支按通道的反量化系数；缺省时使用张量自带的量化参数
  pub dequantize_scale: Option<Vec<Vec<f32>>>,
  pub score_threshold: f32,
  pub nms_threshold: f32,
  pub nms_top_k: usize,
  pub box_coding: BoxCoding,
}

impl Default for Yolo5Config {
  fn default() -> Self {
    Self {
      strides: vec![8, 16, 32],
      anchors: vec![
        vec![[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]],
        vec![[30.0, 61.0], [62.0, 45.0], [59.0, 119.0]],
        vec![[116.0, 90.0], [156.0, 198.0], [373.0, 326.0]],
      ],
      class_num: COCO_CLASSES.len(),
      class_names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
      dequantize_scale: None,
      score_threshold: 0.4,
      nms_threshold: 0.5,
      nms_top_k: 5000,
      box_coding: BoxCoding::LogScale,
    }
  }
}

impl Yolo5Config {
  pub fn validate(&self) -> Result<(), DnnError> {
    if self.strides.is_empty() || self.strides.len() != self.anchors.len() {
      return Err(DnnError::Config(format!(
        "strides 数量 {} 与 anchors 分支数 {} 不匹配",
        self.strides.len(),
        self.anchors.len()
      )));
    }
    if self.strides.contains(&0) {
      return Err(DnnError::Config("stride 不能为 0".to_string()));
    }
    if self.anchors.iter().any(|a| a.is_empty()) {
      return Err(DnnError::Config("每个分支至少需要一个锚框".to_string()));
    }
    if self.class_num == 0 {
      return Err(DnnError::Config("class_num 必须大于 0".to_string()));
    }
    if !self.class_names.is_empty() && self.class_names.len() != self.class_num {
      return Err(DnnError::Config(format!(
        "class_names 数量 {} 与 class_num {} 不匹配",
        self.class_names.len(),
        self.class_num
      )));
    }
    if let Some(scales) = &self.dequantize_scale {
      if scales.len() != self.strides.len() {
        return Err(DnnError::Config(format!(
          "dequantize_scale 分支数 {} 与 strides 数量 {} 不匹配",
          scales.len(),
          self.strides.len()
        )));
      }
      for (branch, (scale, anchors)) in scales.iter().zip(&self.anchors).enumerate() {
        let channels = anchors.len() * (5 + self.class_num);
        if scale.len() != channels {
          return Err(DnnError::Config(format!(
            "分支 {} 的 dequantize_scale 长度 {} 应为 {}",
            branch,
            scale.len(),
            channels
          )));
        }
      }
    }
    if !(0.0..=1.0).contains(&self.score_threshold) || !(0.0..=1.0).contains(&self.nms_threshold) {
      return Err(DnnError::Config(format!(
        "阈值必须在 [0, 1] 内: score {}, nms {}",
        self.score_threshold, self.nms_threshold
      )));
    }
    if self.nms_top_k == 0 {
      return Err(DnnError::Config("nms_top_k 必须大于 0".to_string()));
    }
    Ok(())
  }

  /// 类别名称，未配置或越界时返回 `None`
  pub fn class_name(&self, class_id: u32) -> Option<&str> {
    self.class_names.get(class_id as usize).map(String::as_str)
  }

  pub fn describe(&self) -> String {
    let anchors: Vec<String> = self
      .anchors
      .iter()
      .flatten()
      .map(|[w, h]| format!("[{},{}]", w, h))
      .collect();
    format!(
      "strides: {:?}; anchors_table: {}; class_num: {}",
      self.strides,
      anchors.join(" "),
      self.class_num
    )
  }
}

impl FromUrl for Yolo5Config {
  type Error = DnnError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let config: Yolo5Config = load_json(url)?;
    config.validate()?;
    info!("解析器配置: {}", config.describe());
    Ok(config)
  }
}

impl FromUrlWithScheme for Yolo5Config {
  const SCHEME: &'static str = CONFIG_FILE_SCHEME;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    NodeConfig::default().validate().unwrap();
    Yolo5Config::default().validate().unwrap();
    assert_eq!(Yolo5Config::default().class_name(0), Some("person"));
  }

  #[test]
  fn zero_timeouts_mean_wait_forever() {
    let config = NodeConfig {
      alloc_timeout_ms: 0,
      infer_timeout_ms: 0,
      ..Default::default()
    };
    assert_eq!(config.alloc_timeout(), None);
    assert_eq!(config.infer_timeout(), None);
    assert_eq!(NodeConfig::default().worker_num(), 2);
  }

  #[test]
  fn core_ids_must_match_task_num() {
    let config = NodeConfig {
      task_num: 3,
      core_ids: vec![CoreId::Core0, CoreId::Core1],
      ..Default::default()
    };
    assert!(matches!(config.validate(), Err(DnnError::Config(_))));
  }

  #[test]
  fn parses_partial_json() {
    let config: NodeConfig = serde_json::from_str(
      r#"{ "task_num": 4, "core_ids": ["core0", "any", "core1", "any"], "task_type": "roi_infer" }"#,
    )
    .unwrap();
    config.validate().unwrap();
    assert_eq!(config.task_type, TaskKind::RoiInfer);
    assert_eq!(config.core_ids[1], CoreId::Any);
    assert_eq!(config.queue_limit, 10);

    let yolo: Yolo5Config = serde_json::from_str(
      r#"{ "strides": [16], "anchors": [[[10, 20]]], "class_num": 1, "class_names": ["obj"], "box_coding": "yolov5" }"#,
    )
    .unwrap();
    yolo.validate().unwrap();
    assert_eq!(yolo.box_coding, BoxCoding::Yolov5);
    assert_eq!(yolo.nms_top_k, 5000);
  }

  #[test]
  fn rejects_mismatched_scale_table() {
    let config = Yolo5Config {
      dequantize_scale: Some(vec![vec![1.0; 3]; 3]),
      ..Default::default()
    };
    assert!(matches!(config.validate(), Err(DnnError::Config(_))));
  }

  #[test]
  fn loads_from_file_url() {
    let path = std::env::temp_dir().join(format!("qianli-node-{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "task_num": 1, "queue_limit": 3 }"#).unwrap();
    let url = Url::from_file_path(&path).unwrap();
    let config = NodeConfig::from_url(&url).unwrap();
    assert_eq!(config.queue_limit, 3);
    std::fs::remove_file(&path).unwrap();

    let other = Url::parse("http://example.com/node.json").unwrap();
    assert!(matches!(
      NodeConfig::from_url(&other),
      Err(DnnError::SchemeMismatch)
    ));
  }
}
