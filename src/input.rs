// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input.rs - 输入数据迭代器与生产者
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

use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, error::DnnError, frame::InputFrame};

mod producer;
mod repeat;
pub use self::producer::{InputProducer, ProducerReleaser};
pub use self::repeat::RepeatIterator;

#[cfg(feature = "raw_dir_input")]
mod raw_dir;
#[cfg(feature = "raw_dir_input")]
pub use self::raw_dir::RawDirIterator;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("未注册的输入类型: {0}")]
  UnknownScheme(String),
  #[error("输入参数错误: {0}")]
  InvalidQuery(String),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("{0}")]
  Dnn(#[from] DnnError),
}

/// 逐帧产生模型输入
pub trait DataIterator: Send {
  /// 暂时取不到数据时返回 `None`，由调用者稍后重试
  fn next_frame(&mut self) -> Option<InputFrame>;

  fn has_next(&self) -> bool;
}

pub type IteratorCreator = fn(&Url) -> Result<Box<dyn DataIterator>, InputError>;

fn create<T>(url: &Url) -> Result<Box<dyn DataIterator>, InputError>
where
  T: FromUrl<Error = InputError> + DataIterator + 'static,
{
  Ok(Box::new(T::from_url(url)?))
}

/// 按 URL scheme 选择数据迭代器。
///
/// 注册表由组装入口显式构造并传递，不存在全局注册。
#[derive(Default)]
pub struct IteratorRegistry {
  creators: BTreeMap<String, IteratorCreator>,
}

impl IteratorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册本项目内置的所有迭代器
  pub fn with_builtin() -> Self {
    let mut registry = Self::new();
    registry.register_scheme::<RepeatIterator>();
    #[cfg(feature = "raw_dir_input")]
    registry.register_scheme::<RawDirIterator>();
    registry
  }

  /// 同名 scheme 重复注册时覆盖之前的构造函数
  pub fn register(&mut self, scheme: &str, creator: IteratorCreator) {
    if self.creators.insert(scheme.to_string(), creator).is_some() {
      debug!("输入类型 {} 已注册, 覆盖", scheme);
    }
  }

  pub fn register_scheme<T>(&mut self)
  where
    T: FromUrlWithScheme<Error = InputError> + DataIterator + 'static,
  {
    self.register(T::SCHEME, create::<T>);
  }

  pub fn schemes(&self) -> impl Iterator<Item = &str> {
    self.creators.keys().map(String::as_str)
  }

  pub fn open(&self, url: &Url) -> Result<Box<dyn DataIterator>, InputError> {
    match self.creators.get(url.scheme()) {
      Some(creator) => creator(url),
      None => {
        error!("输入类型 {} 未注册", url.scheme());
        Err(InputError::UnknownScheme(url.scheme().to_string()))
      }
    }
  }
}

/// 读取 URL 查询参数
pub(crate) fn query_param<T: std::str::FromStr>(
  url: &Url,
  key: &str,
) -> Result<Option<T>, InputError> {
  match url.query_pairs().find(|(k, _)| k == key) {
    Some((_, value)) => value
      .parse()
      .map(Some)
      .map_err(|_| InputError::InvalidQuery(format!("{}={}", key, value))),
    None => Ok(None),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builtin_registry_opens_repeat() {
    let registry = IteratorRegistry::with_builtin();
    assert!(registry.schemes().any(|s| s == "repeat"));
    let url = Url::parse("repeat://nv12?width=4&height=2&count=3").unwrap();
    let mut iter = registry.open(&url).unwrap();
    let mut frames = 0;
    while iter.has_next() {
      if iter.next_frame().is_some() {
        frames += 1;
      }
    }
    assert_eq!(frames, 3);
  }

  #[test]
  fn unknown_scheme_is_reported() {
    let registry = IteratorRegistry::new();
    let url = Url::parse("camera://0").unwrap();
    assert!(matches!(
      registry.open(&url),
      Err(InputError::UnknownScheme(s)) if s == "camera"
    ));
  }

  #[test]
  fn bad_query_value() {
    let url = Url::parse("repeat://nv12?width=abc").unwrap();
    assert!(matches!(
      query_param::<u32>(&url, "width"),
      Err(InputError::InvalidQuery(_))
    ));
    assert_eq!(query_param::<u32>(&url, "height").unwrap(), None);
  }
}
