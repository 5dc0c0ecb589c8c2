// 该文件是 Qianli （千里眼） 项目的一部分。
// src/parser/nms.rs - 非极大值抑制
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

use std::collections::BTreeMap;

use crate::parser::DetectItem;

/// 计算两个边界框的 IoU
pub fn iou(a: &DetectItem, b: &DetectItem) -> f32 {
  let x1 = a.bbox[0].max(b.bbox[0]);
  let y1 = a.bbox[1].max(b.bbox[1]);
  let x2 = a.bbox[2].min(b.bbox[2]);
  let y2 = a.bbox[3].min(b.bbox[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = a.area() + b.area() - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 按类别做非极大值抑制。
///
/// 每个类别内按置信度稳定降序排列（同分保持输入顺序），
/// 依次保留最高分的框并丢弃与其 IoU 大于 `nms_threshold` 的框，
/// 每个类别最多保留 `top_k` 个。输出按类别编号升序、类别内按置信度降序。
pub fn nms(detections: Vec<DetectItem>, nms_threshold: f32, top_k: usize) -> Vec<DetectItem> {
  let mut by_class: BTreeMap<u32, Vec<DetectItem>> = BTreeMap::new();
  for det in detections {
    by_class.entry(det.class_id).or_default().push(det);
  }

  let mut result = Vec::new();
  for (_, mut dets) in by_class {
    dets.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<DetectItem> = Vec::new();
    for det in dets {
      if kept.len() >= top_k {
        break;
      }
      if kept.iter().all(|k| iou(k, &det) <= nms_threshold) {
        kept.push(det);
      }
    }
    result.extend(kept);
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item(class_id: u32, score: f32, bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      class_id,
      score,
      bbox,
    }
  }

  #[test]
  fn iou_of_identical_and_disjoint_boxes() {
    let a = item(0, 0.9, [0.0, 0.0, 10.0, 10.0]);
    let b = item(0, 0.8, [20.0, 20.0, 30.0, 30.0]);
    assert_eq!(iou(&a, &a), 1.0);
    assert_eq!(iou(&a, &b), 0.0);
    let c = item(0, 0.8, [5.0, 0.0, 15.0, 10.0]);
    assert!((iou(&a, &c) - 50.0 / 150.0).abs() < 1e-6);
  }

  #[test]
  fn suppresses_overlaps_within_class_only() {
    let dets = vec![
      item(0, 0.6, [1.0, 1.0, 11.0, 11.0]),
      item(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
      item(1, 0.7, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.5, [50.0, 50.0, 60.0, 60.0]),
    ];
    let kept = nms(dets, 0.5, 100);
    assert_eq!(kept.len(), 3);
    assert_eq!(kept[0].score, 0.9);
    assert_eq!(kept[1].score, 0.5);
    assert_eq!(kept[2].class_id, 1);
  }

  #[test]
  fn threshold_one_keeps_everything_up_to_top_k() {
    let dets: Vec<_> = (0..5).map(|i| item(0, 0.5 + i as f32 * 0.01, [0.0, 0.0, 10.0, 10.0])).collect();
    assert_eq!(nms(dets.clone(), 1.0, 100).len(), 5);
    assert_eq!(nms(dets, 1.0, 3).len(), 3);
  }

  #[test]
  fn ties_keep_input_order() {
    let dets = vec![
      item(0, 0.8, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.8, [100.0, 0.0, 110.0, 10.0]),
      item(0, 0.8, [200.0, 0.0, 210.0, 10.0]),
    ];
    let kept = nms(dets, 0.5, 2);
    assert_eq!(kept[0].bbox[0], 0.0);
    assert_eq!(kept[1].bbox[0], 100.0);
  }

  #[test]
  fn retained_boxes_do_not_overlap_beyond_threshold() {
    let mut dets = Vec::new();
    for i in 0..40 {
      let x = (i % 7) as f32 * 3.0;
      let y = (i % 5) as f32 * 4.0;
      dets.push(item(i % 3, 0.3 + (i as f32 * 0.37) % 0.6, [x, y, x + 12.0, y + 12.0]));
    }
    let threshold = 0.45;
    let kept = nms(dets, threshold, 4);
    for a in &kept {
      let same: Vec<_> = kept.iter().filter(|b| b.class_id == a.class_id).collect();
      assert!(same.len() <= 4);
      for b in same {
        if !std::ptr::eq(a, b) {
          assert!(iou(a, b) <= threshold);
        }
      }
    }
  }
}
