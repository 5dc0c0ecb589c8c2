// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/raw_dir.rs - 原始帧目录输入
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

use std::{fs, path::PathBuf};

use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{InputFrame, PixelLayout},
  input::{DataIterator, InputError, query_param},
};

const RAW_DIR_SCHEME: &str = "rawdir";

/// 依次读取目录下的原始帧文件（按文件名排序）。
///
/// URL 形如 `rawdir:///data/frames?layout=nv12&width=960&height=544&loop=true`，
/// 长度与帧尺寸不符的文件会被跳过。
pub struct RawDirIterator {
  files: Vec<PathBuf>,
  cursor: usize,
  layout: PixelLayout,
  width: u32,
  height: u32,
  looping: bool,
}

impl FromUrl for RawDirIterator {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != RAW_DIR_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        RAW_DIR_SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch);
    }

    let layout = query_param(url, "layout")?.unwrap_or(PixelLayout::Nv12);
    let width = query_param(url, "width")?
      .ok_or_else(|| InputError::InvalidQuery("缺少 width".to_string()))?;
    let height = query_param(url, "height")?
      .ok_or_else(|| InputError::InvalidQuery("缺少 height".to_string()))?;
    let looping = query_param(url, "loop")?.unwrap_or(false);

    let mut files = Vec::new();
    for entry in fs::read_dir(url.path())? {
      let path = entry?.path();
      if path.is_file() {
        files.push(path);
      }
    }
    files.sort();
    info!("从 {} 读取 {} 个原始帧文件", url.path(), files.len());

    Ok(Self {
      files,
      cursor: 0,
      layout,
      width,
      height,
      looping,
    })
  }
}

impl FromUrlWithScheme for RawDirIterator {
  const SCHEME: &'static str = RAW_DIR_SCHEME;
}

impl DataIterator for RawDirIterator {
  fn next_frame(&mut self) -> Option<InputFrame> {
    if !self.has_next() {
      return None;
    }
    if self.cursor >= self.files.len() {
      self.cursor = 0;
    }
    let path = &self.files[self.cursor];
    self.cursor += 1;

    let data = match fs::read(path) {
      Ok(data) => data,
      Err(e) => {
        warn!("读取 {} 失败: {}", path.display(), e);
        return None;
      }
    };
    match InputFrame::new(self.layout, self.width, self.height, data) {
      Ok(frame) => Some(frame),
      Err(e) => {
        warn!("跳过 {}: {}", path.display(), e);
        None
      }
    }
  }

  fn has_next(&self) -> bool {
    !self.files.is_empty() && (self.looping || self.cursor < self.files.len())
  }
}
