// 该文件是 Qianli （千里眼） 项目的一部分。
// src/shutdown.rs - 全局退出信号
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

use std::sync::{
  Arc, Weak,
  atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tracing::info;

type WakeHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
  next_id: u64,
  list: Vec<(u64, WakeHook)>,
}

#[derive(Default)]
struct Inner {
  triggered: AtomicBool,
  hooks: Mutex<Hooks>,
}

/// 退出信号。
///
/// 信号只会从未触发变为已触发。触发时依次调用注册的唤醒回调，
/// 让阻塞在条件变量上的等待者重新检查状态。
#[derive(Clone, Default)]
pub struct ShutdownSignal {
  inner: Arc<Inner>,
}

/// 唤醒回调的注册句柄，drop 时注销回调
#[must_use = "句柄被丢弃时回调随即注销"]
pub struct WakeHookGuard {
  inner: Weak<Inner>,
  id: Option<u64>,
}

impl Drop for WakeHookGuard {
  fn drop(&mut self) {
    if let (Some(id), Some(inner)) = (self.id, self.inner.upgrade()) {
      inner.hooks.lock().list.retain(|(hook_id, _)| *hook_id != id);
    }
  }
}

impl ShutdownSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_triggered(&self) -> bool {
    self.inner.triggered.load(Ordering::Acquire)
  }

  pub fn trigger(&self) {
    // 持有回调锁再置位，与 on_trigger 的检查互斥
    let hooks = self.inner.hooks.lock();
    if self.inner.triggered.swap(true, Ordering::AcqRel) {
      return;
    }
    info!("收到退出信号，唤醒所有等待者");
    for (_, hook) in hooks.list.iter() {
      hook();
    }
  }

  /// 注册唤醒回调。信号已触发时立即调用一次。
  pub fn on_trigger(&self, hook: impl Fn() + Send + Sync + 'static) -> WakeHookGuard {
    let mut hooks = self.inner.hooks.lock();
    if self.is_triggered() {
      drop(hooks);
      hook();
      return WakeHookGuard {
        inner: Arc::downgrade(&self.inner),
        id: None,
      };
    }
    let id = hooks.next_id;
    hooks.next_id += 1;
    hooks.list.push((id, Box::new(hook)));
    WakeHookGuard {
      inner: Arc::downgrade(&self.inner),
      id: Some(id),
    }
  }

  #[cfg(test)]
  pub(crate) fn hook_count(&self) -> usize {
    self.inner.hooks.lock().list.len()
  }
}

impl std::fmt::Debug for ShutdownSignal {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ShutdownSignal")
      .field("triggered", &self.is_triggered())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn hooks_run_once() {
    let signal = ShutdownSignal::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let _guard = signal.on_trigger(move || {
      c.fetch_add(1, Ordering::SeqCst);
    });

    signal.trigger();
    signal.trigger();
    assert!(signal.is_triggered());
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn late_hook_fires_immediately() {
    let signal = ShutdownSignal::new();
    signal.trigger();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let _guard = signal.on_trigger(move || {
      c.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn dropped_guard_unregisters_hook() {
    let signal = ShutdownSignal::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let guard = signal.on_trigger(move || {
      c.fetch_add(1, Ordering::SeqCst);
    });
    let _other = signal.on_trigger(|| {});
    assert_eq!(signal.hook_count(), 2);
    drop(guard);
    assert_eq!(signal.hook_count(), 1);
    signal.trigger();
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn hook_registered_during_trigger_is_not_lost() {
    for _ in 0..200 {
      let signal = ShutdownSignal::new();
      let count = Arc::new(AtomicUsize::new(0));
      let c = count.clone();
      let s = signal.clone();
      let register = std::thread::spawn(move || {
        s.on_trigger(move || {
          c.fetch_add(1, Ordering::SeqCst);
        })
      });
      signal.trigger();
      let _guard = register.join().unwrap();
      assert_eq!(count.load(Ordering::SeqCst), 1);
    }
  }
}
