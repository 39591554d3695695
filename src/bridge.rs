//! The one channel through which patched code can ask the coordinator to tear down.

use crate::error::{HookError, Result};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::{panic::{AssertUnwindSafe, catch_unwind}, sync::Arc};

type TeardownFn = Box<dyn FnOnce() + Send + 'static>;

struct Slot {
  key: String,
  request: Mutex<Option<TeardownFn>>,
}

/// Shared cell holding a "request teardown" callable. Handed to the installer and to every
/// trampoline context when they are built, so nobody looks it up by name.
#[derive(Clone)]
pub struct TeardownBridge(Arc<Slot>);

impl TeardownBridge {
  pub fn new(key: &str) -> Self { Self(Arc::new(Slot { key: key.to_string(), request: Mutex::new(None) })) }

  pub fn key(&self) -> &str { &self.0.key }

  /// Fills the slot. Fails if something is already published.
  pub fn publish(&self, request: impl FnOnce() + Send + 'static) -> Result<()> {
    let mut slot = self.0.request.lock();
    if slot.is_some() {
      return Err(HookError::InvalidState(format!("bridge `{}` is already published", self.0.key)));
    }
    *slot = Some(Box::new(request));
    info!("[Bridge] Published {}", self.0.key);
    Ok(())
  }

  pub fn is_published(&self) -> bool { self.0.request.lock().is_some() }

  /// Takes the callable out and runs it. Returns whether anything ran, so only the first request
  /// ever does.
  pub fn request_teardown(&self) -> bool {
    let request = self.0.request.lock().take();
    let Some(request) = request else {
      debug!("[Bridge] Teardown requested on empty bridge {}", self.0.key);
      return false;
    };

    info!("[Bridge] Teardown requested through {}", self.0.key);
    if catch_unwind(AssertUnwindSafe(request)).is_err() {
      error!("[Bridge] Teardown request panicked");
    }
    true
  }

  /// Empties the slot without running it.
  pub fn clear(&self) -> bool {
    let cleared = self.0.request.lock().take().is_some();
    if cleared {
      info!("[Bridge] Cleared {}", self.0.key);
    }
    cleared
  }
}

impl std::fmt::Debug for TeardownBridge {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("TeardownBridge").field("key", &self.0.key).field("published", &self.is_published()).finish() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn request_runs_at_most_once() {
    let bridge = TeardownBridge::new("frame_hook.destruct");
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    bridge.publish(move || { c.fetch_add(1, Ordering::SeqCst); }).unwrap();

    assert!(bridge.publish(|| {}).is_err());
    let other = bridge.clone();
    assert!(other.request_teardown());
    assert!(!bridge.request_teardown());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn cleared_bridge_ignores_requests() {
    let bridge = TeardownBridge::new("frame_hook.destruct");
    bridge.publish(|| panic!("must not run")).unwrap();

    assert!(bridge.clear());
    assert!(!bridge.is_published());
    assert!(!bridge.request_teardown());
  }
}
