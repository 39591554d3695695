//! Things drawn during the host's frame render, and the list that dispatches to them.

use crate::{error::Result, patch::Dialect};
use log::{info, warn};
use parking_lot::RwLock;
use std::{panic::{AssertUnwindSafe, catch_unwind}, sync::{Arc, atomic::{AtomicBool, AtomicU64, Ordering}}};

/// Per-frame data handed to overlays.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameContext<'a> {
  pub partial_ticks: f64,
  /// Symbol dialect of the patched unit, set when the frame came through a code patch.
  pub dialect: Option<&'a Dialect>,
}

pub trait Overlay: Send + Sync {
  /// Unique name, used to unregister.
  fn name(&self) -> &str;

  fn on_enable(&self) {}

  fn on_disable(&self) {}

  /// Called once per visible frame while enabled.
  fn render(&self, frame: &FrameContext<'_>) -> Result<()>;

  fn is_enabled(&self) -> bool { true }
}

#[derive(Default)]
pub struct OverlayRegistry {
  overlays: RwLock<Vec<Arc<dyn Overlay>>>,
  visible: AtomicBool,
  frames: AtomicU64,
}

impl OverlayRegistry {
  pub fn new(visible: bool) -> Self { Self { visible: AtomicBool::new(visible), ..Default::default() } }

  pub fn register(&self, overlay: Arc<dyn Overlay>) {
    if catch_unwind(AssertUnwindSafe(|| overlay.on_enable())).is_err() {
      warn!("[Overlays] {} panicked in on_enable", overlay.name());
    }
    info!("[Overlays] Registered: {}", overlay.name());
    self.overlays.write().push(overlay);
  }

  pub fn unregister(&self, name: &str) -> bool {
    let removed: Vec<_> = {
      let mut overlays = self.overlays.write();
      let (gone, kept): (Vec<_>, Vec<_>) = overlays.drain(..).partition(|o| o.name() == name);
      *overlays = kept;
      gone
    };

    for overlay in &removed {
      disable(overlay);
    }
    !removed.is_empty()
  }

  pub fn len(&self) -> usize { self.overlays.read().len() }

  pub fn is_empty(&self) -> bool { self.overlays.read().is_empty() }

  pub fn is_visible(&self) -> bool { self.visible.load(Ordering::Acquire) }

  pub fn set_visible(&self, visible: bool) { self.visible.store(visible, Ordering::Release); }

  /// Flips visibility and returns the new state.
  pub fn toggle_visible(&self) -> bool { !self.visible.fetch_xor(true, Ordering::AcqRel) }

  /// Frames dispatched while visible.
  pub fn frames(&self) -> u64 { self.frames.load(Ordering::Acquire) }

  /// Renders every enabled overlay in registration order and returns how many ran cleanly.
  /// Runs on the host's render path, so nothing escapes.
  pub fn dispatch(&self, frame: &FrameContext<'_>) -> usize {
    if !self.is_visible() {
      return 0;
    }
    self.frames.fetch_add(1, Ordering::AcqRel);

    // Snapshot so overlays may register or unregister from inside render.
    let overlays = self.overlays.read().clone();
    let mut rendered = 0;
    for overlay in overlays.iter().filter(|o| o.is_enabled()) {
      match catch_unwind(AssertUnwindSafe(|| overlay.render(frame))) {
        Ok(Ok(())) => rendered += 1,
        Ok(Err(e)) => warn!("[Overlays] {} failed to render: {e}", overlay.name()),
        Err(_) => warn!("[Overlays] {} panicked while rendering", overlay.name()),
      }
    }
    rendered
  }

  /// Disables and drops every overlay.
  pub fn shutdown(&self) {
    let overlays = std::mem::take(&mut *self.overlays.write());
    for overlay in &overlays {
      disable(overlay);
    }
    self.set_visible(false);
  }
}

fn disable(overlay: &Arc<dyn Overlay>) {
  if catch_unwind(AssertUnwindSafe(|| overlay.on_disable())).is_err() {
    warn!("[Overlays] Error disabling {}", overlay.name());
  }
}
