// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/producer.rs - 带背压的输入生产者
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
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::{
  frame::InputFrame,
  input::{DataIterator, InputError},
};

const RETRY_INTERVAL: Duration = Duration::from_millis(1);
const STOP_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Counts {
  produced: u64,
  released: u64,
}

struct Shared {
  counts: Mutex<Counts>,
  cv: Condvar,
  limit: u64,
  stop: AtomicBool,
  finished: AtomicBool,
}

/// 在独立线程上从 [`DataIterator`] 取帧并交给消费者。
///
/// 未释放的帧数达到 `limit` 时生产线程阻塞，
/// 消费者处理完一帧后调用 [`ProducerReleaser::release`]。
pub struct InputProducer {
  shared: Arc<Shared>,
  handle: Option<JoinHandle<()>>,
}

/// 可在回调线程中使用的释放句柄
#[derive(Clone)]
pub struct ProducerReleaser {
  shared: Arc<Shared>,
}

impl ProducerReleaser {
  pub fn release(&self) {
    let mut counts = self.shared.counts.lock();
    if counts.released >= counts.produced {
      warn!("没有待释放的输入帧, 忽略本次释放");
      return;
    }
    counts.released += 1;
    self.shared.cv.notify_all();
  }
}

impl InputProducer {
  pub fn new(limit: usize) -> Self {
    Self {
      shared: Arc::new(Shared {
        counts: Mutex::new(Counts::default()),
        cv: Condvar::new(),
        limit: limit.max(1) as u64,
        stop: AtomicBool::new(false),
        finished: AtomicBool::new(false),
      }),
      handle: None,
    }
  }

  pub fn releaser(&self) -> ProducerReleaser {
    ProducerReleaser {
      shared: self.shared.clone(),
    }
  }

  /// 启动生产线程，`feed` 收到帧序号（从 1 开始）与帧数据
  pub fn start<F>(&mut self, mut iter: Box<dyn DataIterator>, mut feed: F) -> Result<(), InputError>
  where
    F: FnMut(u64, InputFrame) + Send + 'static,
  {
    if self.handle.is_some() {
      warn!("输入生产者已经启动");
      return Ok(());
    }
    let shared = self.shared.clone();
    let handle = thread::Builder::new()
      .name("qianli-producer".to_string())
      .spawn(move || {
        while !shared.stop.load(Ordering::Acquire) && iter.has_next() {
          let Some(frame) = iter.next_frame() else {
            thread::sleep(RETRY_INTERVAL);
            continue;
          };
          let id = {
            let mut counts = shared.counts.lock();
            while counts.produced.saturating_sub(counts.released) >= shared.limit
              && !shared.stop.load(Ordering::Acquire)
            {
              shared.cv.wait(&mut counts);
            }
            if shared.stop.load(Ordering::Acquire) {
              break;
            }
            counts.produced += 1;
            counts.produced
          };
          debug!("输入帧: {}", id);
          feed(id, frame);
        }
        shared.finished.store(true, Ordering::Release);
        debug!("输入生产者线程结束");
      })?;
    self.handle = Some(handle);
    info!("输入生产者启动, 背压上限: {}", self.shared.limit);
    Ok(())
  }

  pub fn release(&self) {
    self.releaser().release();
  }

  pub fn is_running(&self) -> bool {
    self.handle.is_some()
      && !self.shared.stop.load(Ordering::Acquire)
      && !self.shared.finished.load(Ordering::Acquire)
  }

  pub fn produced(&self) -> u64 {
    self.shared.counts.lock().produced
  }

  pub fn released(&self) -> u64 {
    self.shared.counts.lock().released
  }

  /// 停止生产并等待所有已产生的帧被释放
  pub fn stop(&mut self) {
    self.shared.stop.store(true, Ordering::Release);
    {
      let mut counts = self.shared.counts.lock();
      self.shared.cv.notify_all();
      while counts.released < counts.produced {
        if self
          .shared
          .cv
          .wait_for(&mut counts, STOP_LOG_INTERVAL)
          .timed_out()
        {
          debug!(
            "等待输入帧释放: {}/{}",
            counts.released, counts.produced
          );
        }
      }
    }
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        warn!("输入生产者线程异常退出");
      }
    }
    info!("输入生产者停止");
  }
}

impl Drop for InputProducer {
  fn drop(&mut self) {
    if self.handle.is_some() {
      self.stop();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{frame::PixelLayout, input::RepeatIterator};
  use std::sync::mpsc;

  fn frames(count: Option<usize>) -> Box<dyn DataIterator> {
    Box::new(RepeatIterator::new(
      InputFrame::zeroed(PixelLayout::Nv12, 2, 2),
      count,
    ))
  }

  #[test]
  fn blocks_at_limit_until_release() {
    let (tx, rx) = mpsc::channel();
    let mut producer = InputProducer::new(2);
    producer
      .start(frames(None), move |id, _| {
        let _ = tx.send(id);
      })
      .unwrap();

    assert_eq!(rx.recv().unwrap(), 1);
    assert_eq!(rx.recv().unwrap(), 2);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    producer.release();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 3);
    assert_eq!(producer.produced() - producer.released(), 2);

    let releaser = producer.releaser();
    let drain = thread::spawn(move || {
      for _ in 0..2 {
        thread::sleep(Duration::from_millis(10));
        releaser.release();
      }
    });
    producer.stop();
    drain.join().unwrap();
    assert_eq!(producer.produced(), producer.released());
    assert!(!producer.is_running());
  }

  #[test]
  fn extra_release_is_ignored() {
    let (tx, rx) = mpsc::channel();
    let mut producer = InputProducer::new(1);
    producer.release();
    assert_eq!(producer.released(), 0);

    producer
      .start(frames(Some(2)), move |id, _| {
        let _ = tx.send(id);
      })
      .unwrap();
    assert_eq!(rx.recv().unwrap(), 1);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    producer.release();
    producer.release();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    producer.release();
    producer.stop();
    assert_eq!(producer.produced(), 2);
    assert_eq!(producer.released(), 2);
  }

  #[test]
  fn finishes_with_iterator() {
    let (tx, rx) = mpsc::channel();
    let mut producer = InputProducer::new(8);
    let releaser = producer.releaser();
    producer
      .start(frames(Some(5)), move |id, _| {
        releaser.release();
        let _ = tx.send(id);
      })
      .unwrap();
    let ids: Vec<u64> = rx.iter().collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    producer.stop();
    assert_eq!(producer.released(), 5);
  }
}
