// 该文件是 Qianli （千里眼） 项目的一部分。
// src/stat.rs - 运行时统计
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

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

const FPS_WINDOW: Duration = Duration::from_secs(1);

struct FpsWindow {
  start: Option<Instant>,
  count: u32,
  fps: f32,
}

/// 以 1 秒为窗口的帧率统计，拥有独立的锁
pub struct FpsStat {
  window: Mutex<FpsWindow>,
}

impl Default for FpsStat {
  fn default() -> Self {
    Self::new()
  }
}

impl FpsStat {
  pub fn new() -> Self {
    Self {
      window: Mutex::new(FpsWindow {
        start: None,
        count: 0,
        fps: 0.0,
      }),
    }
  }

  /// 记录一帧；窗口结束、帧率被刷新时返回 `true`
  pub fn update(&self) -> bool {
    self.update_at(Instant::now())
  }

  fn update_at(&self, now: Instant) -> bool {
    let mut window = self.window.lock();
    let start = *window.start.get_or_insert(now);
    window.count += 1;
    let interval = now.saturating_duration_since(start);
    if interval >= FPS_WINDOW {
      window.fps = window.count as f32 / interval.as_secs_f32();
      window.count = 0;
      window.start = Some(now);
      true
    } else {
      false
    }
  }

  pub fn get(&self) -> f32 {
    self.window.lock().fps
  }
}

/// 一次推理的运行时统计
#[derive(Debug, Clone, Default)]
pub struct RunTimeStat {
  pub input_fps: f32,
  pub output_fps: f32,
  /// 本次输出是否刷新了输出帧率
  pub fps_updated: bool,
  pub infer_time: Duration,
  pub parse_time: Duration,
  pub infer_start: Option<DateTime<Utc>>,
  pub infer_end: Option<DateTime<Utc>>,
  pub parse_start: Option<DateTime<Utc>>,
  pub parse_end: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fps_updates_after_one_second() {
    let stat = FpsStat::new();
    let t0 = Instant::now();
    assert!(!stat.update_at(t0));
    for i in 1..30 {
      assert!(!stat.update_at(t0 + Duration::from_millis(i * 30)));
    }
    // 第 31 帧落在 1 秒边界上
    assert!(stat.update_at(t0 + Duration::from_millis(1000)));
    assert!((stat.get() - 31.0).abs() < 1e-3);
  }

  #[test]
  fn window_restarts() {
    let stat = FpsStat::new();
    let t0 = Instant::now();
    stat.update_at(t0);
    assert!(stat.update_at(t0 + Duration::from_millis(2000)));
    assert!((stat.get() - 1.0).abs() < 1e-3);
    assert!(!stat.update_at(t0 + Duration::from_millis(2500)));
    assert!(stat.update_at(t0 + Duration::from_millis(4000)));
    assert!((stat.get() - 1.0).abs() < 1e-3);
  }

  #[test]
  fn starts_at_zero() {
    assert_eq!(FpsStat::default().get(), 0.0);
  }
}
