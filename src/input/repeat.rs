// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/repeat.rs - 合成帧输入
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

use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{InputFrame, PixelLayout},
  input::{DataIterator, InputError, query_param},
};

const REPEAT_SCHEME: &str = "repeat";
const DEFAULT_WIDTH: u32 = 960;
const DEFAULT_HEIGHT: u32 = 544;

/// 重复产生同一帧，用于压测。
///
/// URL 形如 `repeat://nv12?width=960&height=544&count=1000`，
/// 不指定 `count` 时无限产生。
pub struct RepeatIterator {
  frame: InputFrame,
  remaining: Option<usize>,
}

impl RepeatIterator {
  pub fn new(frame: InputFrame, count: Option<usize>) -> Self {
    Self {
      frame,
      remaining: count,
    }
  }
}

impl FromUrl for RepeatIterator {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != REPEAT_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        REPEAT_SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch);
    }

    let layout = match url.host_str() {
      Some(host) if !host.is_empty() => host.parse::<PixelLayout>()?,
      _ => PixelLayout::Nv12,
    };
    let width = query_param(url, "width")?.unwrap_or(DEFAULT_WIDTH);
    let height = query_param(url, "height")?.unwrap_or(DEFAULT_HEIGHT);
    let count = query_param(url, "count")?;

    info!(
      "合成输入: {:?} {}x{}, 帧数: {}",
      layout,
      width,
      height,
      count.map_or_else(|| "无限".to_string(), |c: usize| c.to_string())
    );
    Ok(Self::new(InputFrame::zeroed(layout, width, height), count))
  }
}

impl FromUrlWithScheme for RepeatIterator {
  const SCHEME: &'static str = REPEAT_SCHEME;
}

impl DataIterator for RepeatIterator {
  fn next_frame(&mut self) -> Option<InputFrame> {
    match &mut self.remaining {
      Some(0) => None,
      Some(remaining) => {
        *remaining -= 1;
        Some(self.frame.clone())
      }
      None => Some(self.frame.clone()),
    }
  }

  fn has_next(&self) -> bool {
    self.remaining != Some(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_to_nv12() {
    let url = Url::parse("repeat://?count=1").unwrap();
    let mut iter = RepeatIterator::from_url(&url).unwrap();
    let frame = iter.next_frame().unwrap();
    assert_eq!(frame.layout(), PixelLayout::Nv12);
    assert_eq!(frame.width(), DEFAULT_WIDTH);
    assert!(!iter.has_next());
    assert!(iter.next_frame().is_none());
  }

  #[test]
  fn unbounded_without_count() {
    let url = Url::parse("repeat://rgb_nhwc?width=2&height=2").unwrap();
    let mut iter = RepeatIterator::from_url(&url).unwrap();
    for _ in 0..100 {
      assert_eq!(iter.next_frame().unwrap().as_bytes().len(), 12);
    }
    assert!(iter.has_next());
  }

  #[test]
  fn wrong_scheme() {
    let url = Url::parse("rawdir:///tmp").unwrap();
    assert!(matches!(
      RepeatIterator::from_url(&url),
      Err(InputError::SchemeMismatch)
    ));
  }
}
