//! Ordered record of every change made to the host, replayed backwards on teardown.

use crate::error::{HookError, Result};
use log::{error, info};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};

type Inverse = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Undoes one mutation. Consumed exactly once.
pub struct InverseAction {
  name: String,
  inverse: Inverse,
}

impl InverseAction {
  pub fn new(name: &str, inverse: impl FnOnce() -> Result<()> + Send + 'static) -> Self { Self { name: name.to_string(), inverse: Box::new(inverse) } }

  pub fn name(&self) -> &str { &self.name }
}

impl std::fmt::Debug for InverseAction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("InverseAction").field("name", &self.name).finish() }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
  pub restored: Vec<String>,
  pub failed: Vec<String>,
}

impl RestoreReport {
  pub fn is_clean(&self) -> bool { self.failed.is_empty() }
}

#[derive(Default)]
pub struct MutationLedger {
  actions: Mutex<Vec<InverseAction>>,
}

impl MutationLedger {
  pub fn new() -> Self { Self::default() }

  pub fn register(&self, name: &str, inverse: impl FnOnce() -> Result<()> + Send + 'static) { self.push(InverseAction::new(name, inverse)); }

  pub fn push(&self, action: InverseAction) {
    info!("[Ledger] Registered: {}", action.name);
    self.actions.lock().push(action);
  }

  pub fn len(&self) -> usize { self.actions.lock().len() }

  pub fn is_empty(&self) -> bool { self.actions.lock().is_empty() }

  /// Names in registration order.
  pub fn names(&self) -> Vec<String> { self.actions.lock().iter().map(|a| a.name.clone()).collect() }

  /// Runs every inverse newest first. A failing inverse is logged and skipped, never propagated.
  pub fn restore_all(&self) -> RestoreReport {
    // Taken out first so an inverse that registers again cannot deadlock or be replayed.
    let actions = std::mem::take(&mut *self.actions.lock());
    let mut report = RestoreReport::default();

    if actions.is_empty() {
      return report;
    }

    info!("[Ledger] Restoring {} action(s)...", actions.len());
    for action in actions.into_iter().rev() {
      let InverseAction { name, inverse } = action;
      match catch_unwind(AssertUnwindSafe(inverse)) {
        Ok(Ok(())) => {
          info!("[Ledger] Restored: {name}");
          report.restored.push(name);
        }
        Ok(Err(e)) => {
          error!("[Ledger] Failed to restore '{name}': {e}");
          report.failed.push(name);
        }
        Err(_) => {
          error!("[Ledger] Restoring '{name}' panicked");
          report.failed.push(name);
        }
      }
    }
    info!("[Ledger] All restored");

    report
  }

  /// Runs and removes the newest inverse called `name`, for undoing a single mutation early.
  /// `None` if there is no such entry.
  pub fn restore(&self, name: &str) -> Option<Result<()>> {
    let action = {
      let mut actions = self.actions.lock();
      let index = actions.iter().rposition(|a| a.name == name)?;
      actions.remove(index)
    };

    let InverseAction { name, inverse } = action;
    let result = catch_unwind(AssertUnwindSafe(inverse)).unwrap_or_else(|_| Err(HookError::host(format!("restoring '{name}' panicked"))));
    match &result {
      Ok(()) => info!("[Ledger] Restored: {name}"),
      Err(e) => error!("[Ledger] Failed to restore '{name}': {e}"),
    }
    Some(result)
  }

  /// Forgets pending inverses without running them.
  pub fn clear(&self) { self.actions.lock().clear(); }
}
