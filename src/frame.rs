// 该文件是 Qianli （千里眼） 项目的一部分。
// src/frame.rs - 模型输入帧定义
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

use serde::{Deserialize, Serialize};

use crate::{error::DnnError, tensor::Tensor};

const RGB_CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelLayout {
  Nv12,
  RgbNhwc,
  RgbNchw,
}

impl PixelLayout {
  pub fn frame_len(&self, width: u32, height: u32) -> usize {
    let pixels = width as usize * height as usize;
    match self {
      PixelLayout::Nv12 => pixels * 3 / 2,
      PixelLayout::RgbNhwc | PixelLayout::RgbNchw => pixels * RGB_CHANNELS,
    }
  }
}

impl std::str::FromStr for PixelLayout {
  type Err = DnnError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "nv12" => Ok(PixelLayout::Nv12),
      "rgb_nhwc" => Ok(PixelLayout::RgbNhwc),
      "rgb_nchw" => Ok(PixelLayout::RgbNchw),
      other => Err(DnnError::InvalidArgument(format!("未知像素格式: {}", other))),
    }
  }
}

/// 已经缩放到模型输入尺寸的图像帧，推理前还需要 NPU 做一次输入处理
#[derive(Debug, Clone)]
pub struct InputFrame {
  layout: PixelLayout,
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl InputFrame {
  pub fn new(layout: PixelLayout, width: u32, height: u32, data: Vec<u8>) -> Result<Self, DnnError> {
    let expected = layout.frame_len(width, height);
    if data.len() != expected {
      return Err(DnnError::InvalidArgument(format!(
        "数据长度不匹配: 期望长度 {}, 实际长度 {}",
        expected,
        data.len()
      )));
    }
    Ok(Self {
      layout,
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  pub fn zeroed(layout: PixelLayout, width: u32, height: u32) -> Self {
    let data = vec![0u8; layout.frame_len(width, height)].into_boxed_slice();
    Self {
      layout,
      width,
      height,
      data,
    }
  }

  pub fn layout(&self) -> PixelLayout {
    self.layout
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for InputFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

/// 感兴趣区域，坐标为模型输入图像上的像素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
  pub left: i32,
  pub top: i32,
  pub right: i32,
  pub bottom: i32,
}

impl Roi {
  pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
    Self {
      left,
      top,
      right,
      bottom,
    }
  }

  pub fn is_valid(&self) -> bool {
    self.right > self.left && self.bottom > self.top
  }
}

/// 输入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
  /// 图像帧，需要 NPU 处理输入
  Frame,
  /// 已准备好的张量，直接送入模型
  Tensor,
}

/// 一次推理的模型输入
#[derive(Debug, Clone)]
pub enum ModelInput {
  Frames(Vec<InputFrame>),
  Tensors(Vec<Tensor>),
}

impl ModelInput {
  pub fn input_type(&self) -> InputType {
    match self {
      ModelInput::Frames(_) => InputType::Frame,
      ModelInput::Tensors(_) => InputType::Tensor,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      ModelInput::Frames(frames) => frames.len(),
      ModelInput::Tensors(tensors) => tensors.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
