//! Edge-triggered keybinds, polled once per tick on the host thread.

use log::{debug, warn};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};

type Action = Box<dyn FnMut() + Send + 'static>;

struct Keybind {
  key: i32,
  name: String,
  action: Action,
  was_down: bool,
}

#[derive(Default)]
pub struct Keybinds {
  binds: Mutex<Vec<Keybind>>,
}

impl Keybinds {
  pub fn new() -> Self { Self::default() }

  pub fn register(&self, key: i32, name: &str, action: impl FnMut() + Send + 'static) {
    debug!("[Input] Bound {name} to key {key}");
    self.binds.lock().push(Keybind { key, name: name.to_string(), action: Box::new(action), was_down: false });
  }

  pub fn len(&self) -> usize { self.binds.lock().len() }

  pub fn is_empty(&self) -> bool { self.binds.lock().is_empty() }

  /// Fires every bind whose key went down since the last tick. Returns how many fired.
  pub fn tick(&self, is_key_down: impl Fn(i32) -> bool) -> usize {
    let mut fired = Vec::new();
    {
      let mut binds = self.binds.lock();
      for (index, bind) in binds.iter_mut().enumerate() {
        let down = is_key_down(bind.key);
        if down && !bind.was_down {
          fired.push(index);
        }
        bind.was_down = down;
      }
    }

    // Actions run one at a time outside the poll so they may clear the binds.
    let mut count = 0;
    for index in fired {
      let Some(mut bind) = self.take(index) else { continue };
      debug!("[Input] {} pressed", bind.name);
      if catch_unwind(AssertUnwindSafe(&mut bind.action)).is_err() {
        warn!("[Input] {} panicked", bind.name);
      }
      self.put_back(index, bind);
      count += 1;
    }
    count
  }

  pub fn clear(&self) { self.binds.lock().clear(); }

  fn take(&self, index: usize) -> Option<Keybind> {
    let mut binds = self.binds.lock();
    let bind = binds.get_mut(index)?;
    let placeholder = Keybind { key: bind.key, name: bind.name.clone(), action: Box::new(|| {}), was_down: bind.was_down };
    Some(std::mem::replace(bind, placeholder))
  }

  fn put_back(&self, index: usize, bind: Keybind) {
    let mut binds = self.binds.lock();
    // Cleared while the action ran.
    if let Some(slot) = binds.get_mut(index).filter(|slot| slot.key == bind.key && slot.name == bind.name) {
      slot.action = bind.action;
    }
  }
}
