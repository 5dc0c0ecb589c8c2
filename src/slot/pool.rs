// 该文件是 Qianli （千里眼） 项目的一部分。
// src/slot/pool.rs - 任务槽池
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

//! # 任务槽池
//!
//! 任务槽在初始化时一次性创建，之后只在空闲集合和运行集合之间移动。
//! 两个集合与推理上下文的空闲列表由同一把锁保护；
//! 每次释放只唤醒一个等待者，退出信号唤醒全部等待者。
//!
//! 推理上下文在申请时从空闲列表取出（没有时才向设备创建），
//! 由 [`TaskLease`] 持有，等待推理完成期间不持有池的锁。

use std::{
  collections::BTreeMap,
  sync::{Arc, Weak},
  time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::{
  accel::{Accelerator, CoreId, HardwareTask, TaskKind},
  error::{DnnError, Stage},
  shutdown::{ShutdownSignal, WakeHookGuard},
  slot::{SlotState, TaskContext, TaskId, TaskSlot},
};

struct State<T> {
  idle: BTreeMap<TaskId, TaskSlot>,
  running: BTreeMap<TaskId, TaskSlot>,
  /// 已重置、可复用的推理上下文
  free: Vec<T>,
}

struct Shared<T> {
  state: Mutex<State<T>>,
  cv: Condvar,
}

pub struct TaskPool<A: Accelerator> {
  accel: Arc<A>,
  kind: TaskKind,
  task_num: usize,
  /// 长度为 `task_num` 时按槽固定 NPU 核
  core_ids: Vec<CoreId>,
  core_num: usize,
  shared: Arc<Shared<A::Task>>,
  shutdown: ShutdownSignal,
  _wake_hook: WakeHookGuard,
}

impl<A: Accelerator> TaskPool<A> {
  pub fn new(
    accel: Arc<A>,
    kind: TaskKind,
    task_num: usize,
    core_ids: &[CoreId],
    shutdown: ShutdownSignal,
  ) -> Result<Self, DnnError> {
    if task_num < 1 {
      return Err(DnnError::InvalidArgument(format!(
        "task_num 必须大于 0, 实际为 {}",
        task_num
      )));
    }
    if !core_ids.is_empty() && core_ids.len() != task_num {
      error!(
        "core_ids 长度 {} 应为 0 或等于 task_num {}",
        core_ids.len(),
        task_num
      );
      return Err(DnnError::InvalidArgument(format!(
        "core_ids 长度 {} 应为 0 或等于 task_num {}",
        core_ids.len(),
        task_num
      )));
    }

    let core_num = accel.core_num().max(1);
    let mut idle = BTreeMap::new();
    let mut next_core = CoreId::Core0;
    for id in 0..task_num {
      let core = match core_ids.get(id) {
        Some(&pinned) if pinned != CoreId::Any => pinned,
        _ => {
          let core = next_core;
          next_core = alternate(next_core, core_num);
          core
        }
      };
      debug!("任务槽 {} 初始绑定核: {:?}", id, core);
      idle.insert(id, TaskSlot::new(id, core));
    }

    let shared = Arc::new(Shared {
      state: Mutex::new(State {
        idle,
        running: BTreeMap::new(),
        free: Vec::with_capacity(task_num),
      }),
      cv: Condvar::new(),
    });

    let weak: Weak<Shared<A::Task>> = Arc::downgrade(&shared);
    let wake_hook = shutdown.on_trigger(move || {
      if let Some(shared) = weak.upgrade() {
        let _state = shared.state.lock();
        shared.cv.notify_all();
      }
    });

    info!("设置任务数量: {}, NPU 核数量: {}", task_num, core_num);
    Ok(Self {
      accel,
      kind,
      task_num,
      core_ids: core_ids.to_vec(),
      core_num,
      shared,
      shutdown,
      _wake_hook: wake_hook,
    })
  }

  pub fn task_num(&self) -> usize {
    self.task_num
  }

  pub fn kind(&self) -> TaskKind {
    self.kind
  }

  pub fn idle_count(&self) -> usize {
    self.shared.state.lock().idle.len()
  }

  pub fn running_count(&self) -> usize {
    self.shared.state.lock().running.len()
  }

  /// 所有任务槽的快照，按编号排序
  pub fn slots(&self) -> Vec<TaskSlot> {
    let state = self.shared.state.lock();
    let mut slots: Vec<TaskSlot> = state
      .idle
      .values()
      .chain(state.running.values())
      .copied()
      .collect();
    slots.sort_by_key(|slot| slot.id);
    slots
  }

  /// 申请一个空闲任务槽。
  ///
  /// `timeout` 为 `None` 时一直等待，直到有任务槽空闲或收到退出信号。
  pub fn allocate(&self, timeout: Option<Duration>) -> Result<TaskLease<'_, A>, DnnError> {
    debug!("申请任务");
    let deadline = timeout.map(|t| Instant::now() + t);

    let (slot, recycled) = {
      let mut state = self.shared.state.lock();
      let id = loop {
        if self.shutdown.is_triggered() {
          return Err(DnnError::Shutdown);
        }
        if let Some(&id) = state.idle.keys().next() {
          break id;
        }
        match deadline {
          Some(deadline) => {
            if Instant::now() >= deadline {
              return Err(DnnError::Timeout {
                stage: Stage::Allocate,
                after: timeout.unwrap_or_default(),
              });
            }
            self.shared.cv.wait_until(&mut state, deadline);
          }
          None => self.shared.cv.wait(&mut state),
        }
      };

      let Some(mut slot) = state.idle.remove(&id) else {
        return Err(DnnError::InvalidArgument(format!("任务槽 {} 不存在", id)));
      };
      slot.alloc_at = Some(Instant::now());
      slot.state = SlotState::Running;
      state.running.insert(id, slot);
      (slot, state.free.pop())
    };

    let task = match recycled {
      Some(task) => task,
      None => match self.accel.create_task(self.kind) {
        Ok(task) => task,
        Err(e) => {
          error!("创建推理任务失败: {}", e);
          self.release_slot(slot.id, None)?;
          return Err(e.into());
        }
      },
    };

    debug!("申请到任务: {}, 核: {:?}", slot.id, slot.core);
    Ok(TaskLease {
      pool: self,
      slot,
      context: Some(TaskContext::new(self.kind, task)),
    })
  }

  /// 计算任务槽下一次使用的核：固定核保持不变，否则从上一次使用的核交替
  fn next_core(&self, id: TaskId, last: CoreId) -> CoreId {
    match self.core_ids.get(id) {
      Some(&pinned) if pinned != CoreId::Any => pinned,
      _ => alternate(last, self.core_num),
    }
  }

  fn release_slot(&self, id: TaskId, task: Option<A::Task>) -> Result<(), DnnError> {
    debug!("释放任务: {}", id);
    let mut state = self.shared.state.lock();
    let Some(mut slot) = state.running.remove(&id) else {
      error!("任务 {} 不在运行中", id);
      return Err(DnnError::InvalidArgument(format!("任务 {} 不在运行中", id)));
    };

    slot.core = self.next_core(id, slot.core);
    slot.state = SlotState::Idle;
    state.idle.insert(id, slot);
    if let Some(mut task) = task {
      task.reset();
      state.free.push(task);
    }
    self.shared.cv.notify_one();
    debug!(
      "空闲任务数: {}, 运行任务数: {}",
      state.idle.len(),
      state.running.len()
    );
    Ok(())
  }
}

fn alternate(core: CoreId, core_num: usize) -> CoreId {
  if core_num < 2 {
    CoreId::Core0
  } else {
    core.alternate()
  }
}

/// 一个正在运行的任务槽。
///
/// 显式调用 [`TaskLease::release`] 或在析构时归还给任务池。
pub struct TaskLease<'a, A: Accelerator> {
  pool: &'a TaskPool<A>,
  slot: TaskSlot,
  context: Option<TaskContext<A::Task>>,
}

impl<A: Accelerator> TaskLease<'_, A> {
  pub fn id(&self) -> TaskId {
    self.slot.id
  }

  pub fn core(&self) -> CoreId {
    self.slot.core
  }

  pub fn slot(&self) -> &TaskSlot {
    &self.slot
  }

  pub fn context_mut(&mut self) -> Option<&mut TaskContext<A::Task>> {
    self.context.as_mut()
  }

  pub fn release(mut self) -> Result<(), DnnError> {
    let task = self.context.take().map(TaskContext::into_task);
    self.pool.release_slot(self.slot.id, task)
  }
}

impl<A: Accelerator> Drop for TaskLease<'_, A> {
  fn drop(&mut self) {
    if let Some(context) = self.context.take() {
      if let Err(e) = self.pool.release_slot(self.slot.id, Some(context.into_task())) {
        error!("析构时释放任务 {} 失败: {}", self.slot.id, e);
      }
    }
  }
}
