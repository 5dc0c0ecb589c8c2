// 该文件是 Qianli （千里眼） 项目的一部分。
// src/tensor.rs - 张量定义
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

use crate::error::DnnError;

/// 张量在内存中的排布
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
  Nhwc,
  Nchw,
}

/// 逻辑形状，总是按 N、H、W、C 的顺序给出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
  pub n: usize,
  pub h: usize,
  pub w: usize,
  pub c: usize,
}

impl Shape {
  pub fn new(n: usize, h: usize, w: usize, c: usize) -> Self {
    Self { n, h, w, c }
  }

  pub fn volume(&self) -> usize {
    self.n * self.h * self.w * self.c
  }

  fn covers(&self, other: &Shape) -> bool {
    self.n >= other.n && self.h >= other.h && self.w >= other.w && self.c >= other.c
  }
}

/// 位移量化允许的最大位数
const MAX_SHIFT: u8 = 63;

/// 量化方式
#[derive(Debug, Clone, PartialEq)]
pub enum Quantization {
  /// 浮点张量，或模型内已有反量化节点
  None,
  /// `value * scale`；长度为 1 时整个张量共用，否则按通道
  Scale(Vec<f32>),
  /// `value / 2^shift`；长度规则同上
  Shift(Vec<u8>),
}

impl Quantization {
  fn check(&self, channels: usize) -> Result<(), DnnError> {
    let len = match self {
      Quantization::None => return Ok(()),
      Quantization::Scale(s) => s.len(),
      Quantization::Shift(s) => {
        if let Some(&shift) = s.iter().find(|&&shift| shift > MAX_SHIFT) {
          return Err(DnnError::InvalidArgument(format!(
            "量化位移 {} 超过上限 {}",
            shift, MAX_SHIFT
          )));
        }
        s.len()
      }
    };
    if len == 1 || len == channels {
      Ok(())
    } else {
      Err(DnnError::InvalidArgument(format!(
        "量化参数长度 {} 与通道数 {} 不匹配",
        len, channels
      )))
    }
  }

  fn factor(&self, channel: usize) -> f32 {
    match self {
      Quantization::None => 1.0,
      Quantization::Scale(s) => {
        if s.len() == 1 {
          s[0]
        } else {
          s[channel]
        }
      }
      Quantization::Shift(s) => {
        let shift = if s.len() == 1 { s[0] } else { s[channel] };
        2f32.powi(-i32::from(shift))
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  U8(Box<[u8]>),
  I8(Box<[i8]>),
  I16(Box<[i16]>),
  I32(Box<[i32]>),
  F32(Box<[f32]>),
}

impl TensorData {
  pub fn len(&self) -> usize {
    match self {
      TensorData::U8(d) => d.len(),
      TensorData::I8(d) => d.len(),
      TensorData::I16(d) => d.len(),
      TensorData::I32(d) => d.len(),
      TensorData::F32(d) => d.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn raw(&self, index: usize) -> f32 {
    match self {
      TensorData::U8(d) => d[index] as f32,
      TensorData::I8(d) => d[index] as f32,
      TensorData::I16(d) => d[index] as f32,
      TensorData::I32(d) => d[index] as f32,
      TensorData::F32(d) => d[index],
    }
  }

  pub fn is_float(&self) -> bool {
    matches!(self, TensorData::F32(_))
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorMeta {
  pub layout: TensorLayout,
  /// 有效数据的形状
  pub valid_shape: Shape,
  /// 带对齐填充的内存形状
  pub aligned_shape: Shape,
  pub quant: Quantization,
}

impl TensorMeta {
  pub fn new(layout: TensorLayout, shape: Shape, quant: Quantization) -> Self {
    Self {
      layout,
      valid_shape: shape,
      aligned_shape: shape,
      quant,
    }
  }

  pub fn with_aligned_shape(mut self, aligned: Shape) -> Self {
    self.aligned_shape = aligned;
    self
  }
}

/// 一个模型输入或输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  meta: TensorMeta,
  data: TensorData,
}

impl Tensor {
  pub fn new(meta: TensorMeta, data: TensorData) -> Result<Self, DnnError> {
    if !meta.aligned_shape.covers(&meta.valid_shape) {
      return Err(DnnError::InvalidArgument(format!(
        "对齐形状 {:?} 小于有效形状 {:?}",
        meta.aligned_shape, meta.valid_shape
      )));
    }
    if data.len() != meta.aligned_shape.volume() {
      return Err(DnnError::InvalidArgument(format!(
        "张量数据长度 {} 与形状 {:?} 不匹配",
        data.len(),
        meta.aligned_shape
      )));
    }
    meta.quant.check(meta.valid_shape.c)?;
    Ok(Self { meta, data })
  }

  pub fn meta(&self) -> &TensorMeta {
    &self.meta
  }

  pub fn data(&self) -> &TensorData {
    &self.data
  }

  pub fn shape(&self) -> Shape {
    self.meta.valid_shape
  }

  fn offset(&self, n: usize, h: usize, w: usize, c: usize) -> usize {
    let a = &self.meta.aligned_shape;
    match self.meta.layout {
      TensorLayout::Nhwc => ((n * a.h + h) * a.w + w) * a.c + c,
      TensorLayout::Nchw => ((n * a.c + c) * a.h + h) * a.w + w,
    }
  }

  /// 读取一个元素并按张量自带的量化参数反量化
  pub fn value(&self, n: usize, h: usize, w: usize, c: usize) -> f32 {
    let raw = self.data.raw(self.offset(n, h, w, c));
    if self.data.is_float() {
      return raw;
    }
    raw * self.meta.quant.factor(c)
  }

  /// 读取一个元素，使用外部提供的按通道缩放表反量化
  pub fn value_scaled(&self, n: usize, h: usize, w: usize, c: usize, scales: &[f32]) -> f32 {
    let raw = self.data.raw(self.offset(n, h, w, c));
    if self.data.is_float() {
      return raw;
    }
    raw * scales[c]
  }
}
