//! Funnels work onto the host's single cooperative thread.

use crate::{config::logical, error::Result, host::{HostRuntime, ObjectRef, Task, Value}, resolver::{ResolvedHandle, Resolver}};
use log::{debug, error, warn};
use std::{panic::{AssertUnwindSafe, catch_unwind}, sync::{Arc, mpsc}, time::{Duration, Instant}};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AwaitStatus {
  Completed,
  TimedOut,
  /// The host discarded the task without running it.
  Dropped,
}

#[derive(Clone)]
pub struct SchedulerBridge {
  method: ResolvedHandle,
  runtime: Arc<dyn HostRuntime>,
}

impl SchedulerBridge {
  /// Locates the host's task submission method on the root object.
  pub fn resolve(resolver: &Resolver, root: &ObjectRef, runtime: Arc<dyn HostRuntime>) -> Result<Self> {
    let method = resolver.resolve(logical::SCHEDULE_TASK, root)?;
    method.method()?;
    Ok(Self { method, runtime })
  }

  pub fn handle(&self) -> &ResolvedHandle { &self.method }

  pub fn on_host_thread(&self) -> bool { self.runtime.on_host_thread() }

  /// Enqueues `task` without waiting. Panics inside the task are caught on the host thread.
  pub fn schedule(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
    let task = Task::new(move || {
      if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("[Scheduler] Scheduled task panicked");
      }
    });
    self.method.method()?.invoke(&[Value::Task(task)])?;
    Ok(())
  }

  /// Enqueues `task` and blocks until it has run or `timeout` elapsed.
  pub fn schedule_and_await(&self, task: impl FnOnce() + Send + 'static, timeout: Duration) -> Result<AwaitStatus> {
    if self.runtime.on_host_thread() {
      debug!("[Scheduler] Already on the host thread, running inline");
      if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("[Scheduler] Inline task panicked");
      }
      return Ok(AwaitStatus::Completed);
    }

    let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
    self.schedule(move || {
      // Signals even if the task panics, like a latch counted down in a finally block.
      struct Signal(mpsc::SyncSender<()>);
      impl Drop for Signal {
        fn drop(&mut self) { let _ = self.0.try_send(()); }
      }
      let _signal = Signal(done_tx);
      task();
    })?;

    let started = Instant::now();
    match done_rx.recv_timeout(timeout) {
      Ok(()) => Ok(AwaitStatus::Completed),
      Err(mpsc::RecvTimeoutError::Timeout) => {
        warn!("[Scheduler] Task did not run within {timeout:?}");
        Ok(AwaitStatus::TimedOut)
      }
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        warn!("[Scheduler] Task was dropped by the host after {:?}", started.elapsed());
        Ok(AwaitStatus::Dropped)
      }
    }
  }
}
