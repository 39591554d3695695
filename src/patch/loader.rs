//! Code loading: units of code that rewriters get to see whenever they are loaded or reloaded.

use crate::{error::{HookError, Result}, patch::memory::Memory};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::{panic::{AssertUnwindSafe, catch_unwind}, sync::Arc};

/// A named range of code as it was first loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeUnit {
  pub name: String,
  pub base: usize,
  pub bytes: Vec<u8>,
}

impl CodeUnit {
  pub fn end(&self) -> usize { self.base + self.bytes.len() }
}

pub trait Rewriter: Send + Sync {
  fn name(&self) -> &str;

  /// Returns the new body for `unit`, or `None` to leave it as given. Must keep the length.
  fn rewrite(&self, unit: &CodeUnit) -> Result<Option<Vec<u8>>>;
}

/// The host's facility for (re)loading code and letting rewriters intervene.
pub trait CodeLoader: Send + Sync {
  fn add_rewriter(&self, rewriter: Arc<dyn Rewriter>);

  fn remove_rewriter(&self, rewriter: &Arc<dyn Rewriter>) -> bool;

  fn loaded_units(&self) -> Vec<String>;

  /// Runs the unit's original bytes through the current rewriters again.
  fn reload(&self, unit: &str) -> Result<()>;
}

/// Loader over a [`Memory`]: remembers each unit's original bytes and writes the rewritten form
/// back on every load.
pub struct ImageLoader {
  memory: Arc<dyn Memory>,
  units: DashMap<String, CodeUnit>,
  rewriters: RwLock<Vec<Arc<dyn Rewriter>>>,
}

impl ImageLoader {
  pub fn new(memory: Arc<dyn Memory>) -> Self { Self { memory, units: DashMap::new(), rewriters: RwLock::new(Vec::new()) } }

  pub fn memory(&self) -> &Arc<dyn Memory> { &self.memory }

  /// Registers `base..base + len` as unit `name` and runs the current rewriters over it.
  pub fn load(&self, name: &str, base: usize, len: usize) -> Result<()> {
    if self.units.contains_key(name) {
      return Err(HookError::InvalidState(format!("unit `{name}` is already loaded")));
    }

    let unit = CodeUnit { name: name.to_string(), base, bytes: self.memory.read(base, len)? };
    info!("[Loader] Loaded {name} at {base:#X} ({len} bytes)");
    self.units.insert(name.to_string(), unit.clone());
    self.apply(&unit)
  }

  /// The unit as first loaded.
  pub fn unit(&self, name: &str) -> Option<CodeUnit> { self.units.get(name).map(|u| u.clone()) }

  /// Whether the unit's live bytes equal its original bytes.
  pub fn is_pristine(&self, name: &str) -> Result<bool> {
    let unit = self.unit(name).ok_or_else(|| HookError::not_found(name))?;
    Ok(self.memory.read(unit.base, unit.bytes.len())? == unit.bytes)
  }

  pub fn rewriter_count(&self) -> usize { self.rewriters.read().len() }

  fn apply(&self, unit: &CodeUnit) -> Result<()> {
    // Snapshot so rewriters may add or remove themselves while running.
    let rewriters = self.rewriters.read().clone();
    let mut current = unit.clone();

    for rewriter in rewriters {
      match catch_unwind(AssertUnwindSafe(|| rewriter.rewrite(&current))) {
        Ok(Ok(Some(bytes))) if bytes.len() == current.bytes.len() => current.bytes = bytes,
        Ok(Ok(Some(bytes))) => warn!("[Loader] {} resized {} ({} -> {} bytes), ignored", rewriter.name(), unit.name, current.bytes.len(), bytes.len()),
        Ok(Ok(None)) => {}
        Ok(Err(e)) => warn!("[Loader] {} failed on {}, keeping it unmodified: {e}", rewriter.name(), unit.name),
        Err(_) => error!("[Loader] {} panicked on {}, keeping it unmodified", rewriter.name(), unit.name),
      }
    }

    let live = self.memory.read(unit.base, unit.bytes.len())?;
    if live != current.bytes {
      self.memory.write(unit.base, &current.bytes)?;
      debug!("[Loader] Wrote {} ({} bytes)", unit.name, current.bytes.len());
    }
    Ok(())
  }
}

impl CodeLoader for ImageLoader {
  fn add_rewriter(&self, rewriter: Arc<dyn Rewriter>) {
    debug!("[Loader] Rewriter added: {}", rewriter.name());
    self.rewriters.write().push(rewriter);
  }

  fn remove_rewriter(&self, rewriter: &Arc<dyn Rewriter>) -> bool {
    let mut rewriters = self.rewriters.write();
    let before = rewriters.len();
    rewriters.retain(|r| !std::ptr::addr_eq(Arc::as_ptr(r), Arc::as_ptr(rewriter)));
    let removed = rewriters.len() != before;
    if removed {
      debug!("[Loader] Rewriter removed: {}", rewriter.name());
    }
    removed
  }

  fn loaded_units(&self) -> Vec<String> { self.units.iter().map(|u| u.key().clone()).collect() }

  fn reload(&self, unit: &str) -> Result<()> {
    let unit = self.unit(unit).ok_or_else(|| HookError::not_found(unit))?;
    debug!("[Loader] Reloading {}", unit.name);
    self.apply(&unit)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::patch::memory::ImageMemory;

  struct Fill(u8);

  impl Rewriter for Fill {
    fn name(&self) -> &str { "fill" }

    fn rewrite(&self, unit: &CodeUnit) -> Result<Option<Vec<u8>>> { Ok(Some(vec![self.0; unit.bytes.len()])) }
  }

  struct Broken;

  impl Rewriter for Broken {
    fn name(&self) -> &str { "broken" }

    fn rewrite(&self, unit: &CodeUnit) -> Result<Option<Vec<u8>>> { Err(HookError::TransformFailure { unit: unit.name.clone(), reason: "bad pattern".to_string() }) }
  }

  fn loader() -> ImageLoader {
    let memory = Arc::new(ImageMemory::new());
    memory.map(0x1000, vec![0xC3; 8]).unwrap();
    ImageLoader::new(memory)
  }

  #[test]
  fn reload_applies_and_reverts_rewriters() {
    let loader = loader();
    loader.load("GuiIngame", 0x1000, 8).unwrap();

    let fill: Arc<dyn Rewriter> = Arc::new(Fill(0x90));
    loader.add_rewriter(Arc::clone(&fill));
    loader.reload("GuiIngame").unwrap();
    assert_eq!(loader.memory().read(0x1000, 8).unwrap(), vec![0x90; 8]);
    assert!(!loader.is_pristine("GuiIngame").unwrap());

    assert!(loader.remove_rewriter(&fill));
    assert!(!loader.remove_rewriter(&fill));
    loader.reload("GuiIngame").unwrap();
    assert!(loader.is_pristine("GuiIngame").unwrap());
  }

  #[test]
  fn failing_rewriter_leaves_unit_unmodified() {
    let loader = loader();
    loader.add_rewriter(Arc::new(Broken));
    loader.load("avo", 0x1000, 8).unwrap();

    assert!(loader.is_pristine("avo").unwrap());
    assert!(loader.load("avo", 0x1000, 8).is_err());
    assert!(matches!(loader.reload("missing"), Err(HookError::NotFound { .. })));
  }
}
