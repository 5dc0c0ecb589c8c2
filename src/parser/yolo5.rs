// 该文件是 Qianli （千里眼） 项目的一部分。
// src/parser/yolo5.rs - YOLOv5 输出解析
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

use tracing::{debug, error};

use crate::{
  config::{BoxCoding, Yolo5Config},
  error::DnnError,
  parser::{DetectItem, DetectResult, OutputParser, nms},
  tensor::Tensor,
};

/// 每个锚框的通道：x, y, w, h, objectness，之后是各类别分数
const BOX_CHANNELS: usize = 5;

/// 基于锚框的多分支检测输出解析器。
///
/// 每个分支的输出张量形状为 `[1, H, W, anchors * (5 + class_num)]`，
/// 解码出的边界框单位为模型输入像素。
pub struct Yolo5Parser {
  config: Yolo5Config,
}

impl Yolo5Parser {
  pub fn new(config: Yolo5Config) -> Result<Self, DnnError> {
    config.validate()?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &Yolo5Config {
    &self.config
  }

  fn decode_branch(
    &self,
    branch: usize,
    tensor: &Tensor,
    items: &mut Vec<DetectItem>,
  ) -> Result<(), DnnError> {
    let config = &self.config;
    let shape = tensor.shape();
    let anchors = &config.anchors[branch];
    let per_anchor = BOX_CHANNELS + config.class_num;
    if shape.c < anchors.len() * per_anchor {
      error!(
        "分支 {}: 通道数 {} 小于期望的 {}",
        branch,
        shape.c,
        anchors.len() * per_anchor
      );
      return Err(DnnError::InvalidArgument(format!(
        "分支 {} 的通道数 {} 小于期望的 {}",
        branch,
        shape.c,
        anchors.len() * per_anchor
      )));
    }

    let stride = config.strides[branch] as f32;
    let scales = config
      .dequantize_scale
      .as_ref()
      .map(|scales| scales[branch].as_slice());
    let value = |h: usize, w: usize, c: usize| match scales {
      Some(scales) => tensor.value_scaled(0, h, w, c, scales),
      None => tensor.value(0, h, w, c),
    };

    debug!(
      "分支 {}: 特征图 {}x{}, 步长 {}, 锚框数 {}",
      branch,
      shape.h,
      shape.w,
      stride,
      anchors.len()
    );

    for h in 0..shape.h {
      for w in 0..shape.w {
        for (k, &[anchor_w, anchor_h]) in anchors.iter().enumerate() {
          let base = k * per_anchor;

          // 置信度不会超过 objectness，先用它过滤
          let objectness = sigmoid(value(h, w, base + 4));
          if !passes(objectness, config.score_threshold) {
            continue;
          }

          let (class_id, max_logit) = {
            let mut max_logit = f32::MIN;
            let mut cls_idx = 0usize;
            for c in 0..config.class_num {
              let logit = value(h, w, base + BOX_CHANNELS + c);
              if logit > max_logit {
                max_logit = logit;
                cls_idx = c;
              }
            }
            (cls_idx as u32, max_logit)
          };
          let score = objectness * sigmoid(max_logit);
          if !passes(score, config.score_threshold) {
            continue;
          }

          let tx = value(h, w, base);
          let ty = value(h, w, base + 1);
          let tw = value(h, w, base + 2);
          let th = value(h, w, base + 3);

          // 特征图坐标系下的中心与宽高
          let (cx, cy, bw, bh) = match config.box_coding {
            BoxCoding::LogScale => (
              sigmoid(tx) + w as f32,
              sigmoid(ty) + h as f32,
              anchor_w / stride * tw.exp(),
              anchor_h / stride * th.exp(),
            ),
            BoxCoding::Yolov5 => (
              sigmoid(tx) * 2.0 - 0.5 + w as f32,
              sigmoid(ty) * 2.0 - 0.5 + h as f32,
              anchor_w / stride * (sigmoid(tw) * 2.0).powi(2),
              anchor_h / stride * (sigmoid(th) * 2.0).powi(2),
            ),
          };

          items.push(DetectItem {
            class_id,
            score,
            bbox: [
              (cx - bw / 2.0) * stride,
              (cy - bh / 2.0) * stride,
              (cx + bw / 2.0) * stride,
              (cy + bh / 2.0) * stride,
            ],
          });
        }
      }
    }
    Ok(())
  }
}

impl OutputParser for Yolo5Parser {
  fn parse(&self, tensors: &[Tensor]) -> Result<DetectResult, DnnError> {
    let branches = self.config.strides.len();
    if tensors.len() < branches {
      error!("输出张量数量 {} 少于分支数 {}", tensors.len(), branches);
      return Err(DnnError::InvalidArgument(format!(
        "输出张量数量 {} 少于分支数 {}",
        tensors.len(),
        branches
      )));
    }

    let mut items = Vec::new();
    for (branch, tensor) in tensors.iter().take(branches).enumerate() {
      self.decode_branch(branch, tensor, &mut items)?;
    }
    debug!("过滤后候选框数量: {}", items.len());

    let items = nms(items, self.config.nms_threshold, self.config.nms_top_k);
    debug!("检测到 {} 个物体", items.len());
    Ok(DetectResult::from(items))
  }
}

/// NaN 不算达到阈值
fn passes(score: f32, threshold: f32) -> bool {
  score >= threshold
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
