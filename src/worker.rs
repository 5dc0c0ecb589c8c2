// 该文件是 Qianli （千里眼） 项目的一部分。
// src/worker.rs - 异步推理工作线程池
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
  collections::VecDeque,
  sync::Arc,
  thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::DnnError;

/// 工作线程执行的任务
pub trait Job: Send + 'static {
  fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send + 'static> Job for F {
  fn run(self: Box<Self>) {
    (*self)()
  }
}

struct Queue {
  jobs: VecDeque<Box<dyn Job>>,
  closed: bool,
}

struct Shared {
  queue: Mutex<Queue>,
  cv: Condvar,
}

/// 提交被拒绝时原样交还任务
#[derive(Error)]
pub enum PostError<F> {
  #[error("队列已满")]
  Full(F),
  #[error("线程池已关闭")]
  Closed(F),
}

impl<F> PostError<F> {
  pub fn into_inner(self) -> F {
    match self {
      PostError::Full(job) | PostError::Closed(job) => job,
    }
  }
}

impl<F> std::fmt::Debug for PostError<F> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PostError::Full(_) => f.write_str("Full(..)"),
      PostError::Closed(_) => f.write_str("Closed(..)"),
    }
  }
}

/// 固定数量的工作线程，队列长度达到上限时拒绝新任务。
///
/// 关闭时已入队的任务仍会被执行完毕。
pub struct WorkerPool {
  shared: Arc<Shared>,
  limit: usize,
  worker_num: usize,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
  pub fn new(worker_num: usize, limit: usize) -> Result<Self, DnnError> {
    if worker_num < 1 {
      return Err(DnnError::InvalidArgument(
        "工作线程数必须大于 0".to_string(),
      ));
    }
    let shared = Arc::new(Shared {
      queue: Mutex::new(Queue {
        jobs: VecDeque::with_capacity(limit),
        closed: false,
      }),
      cv: Condvar::new(),
    });

    let pool = Self {
      shared,
      limit,
      worker_num,
      workers: Mutex::new(Vec::with_capacity(worker_num)),
    };
    for idx in 0..worker_num {
      let shared = pool.shared.clone();
      let handle = thread::Builder::new()
        .name(format!("qianli-worker-{}", idx))
        .spawn(move || worker_loop(idx, shared))?;
      pool.workers.lock().push(handle);
    }
    info!("创建工作线程: {}, 队列上限: {}", worker_num, limit);
    Ok(pool)
  }

  pub fn worker_num(&self) -> usize {
    self.worker_num
  }

  pub fn limit(&self) -> usize {
    self.limit
  }

  /// 尚未被工作线程取走的任务数
  pub fn pending(&self) -> usize {
    self.shared.queue.lock().jobs.len()
  }

  pub fn try_post<J: Job>(&self, job: J) -> Result<(), PostError<J>> {
    let mut queue = self.shared.queue.lock();
    if queue.closed {
      return Err(PostError::Closed(job));
    }
    if queue.jobs.len() >= self.limit {
      warn!(
        "队列任务数 {} 已达上限 {}, 推理耗时过长",
        queue.jobs.len(),
        self.limit
      );
      return Err(PostError::Full(job));
    }
    queue.jobs.push_back(Box::new(job));
    self.shared.cv.notify_one();
    Ok(())
  }

  /// 停止接收新任务，等待队列清空后回收全部线程
  pub fn shutdown(&self) {
    {
      let mut queue = self.shared.queue.lock();
      if !queue.closed {
        debug!("关闭工作线程池, 剩余任务: {}", queue.jobs.len());
      }
      queue.closed = true;
      self.shared.cv.notify_all();
    }
    let workers: Vec<_> = self.workers.lock().drain(..).collect();
    for handle in workers {
      if handle.join().is_err() {
        error!("工作线程异常退出");
      }
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn worker_loop(idx: usize, shared: Arc<Shared>) {
  debug!("工作线程 {} 启动", idx);
  loop {
    let job = {
      let mut queue = shared.queue.lock();
      loop {
        if let Some(job) = queue.jobs.pop_front() {
          break Some(job);
        }
        if queue.closed {
          break None;
        }
        shared.cv.wait(&mut queue);
      }
    };
    match job {
      Some(job) => job.run(),
      None => break,
    }
  }
  debug!("工作线程 {} 退出", idx);
}
