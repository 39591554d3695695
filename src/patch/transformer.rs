//! Code transformation: patch every return point of a method so it branches into a trampoline
//! that runs the frame logic before returning.
//!
//! Each return site gets a jump to a trampoline laid out as
//!
//! ```text
//! [displaced instructions, relocated]   only when the return had no padding after it
//! [stub: save regs, check -> logic, restore regs]
//! [the original return]
//! ```
//!
//! The check asks the emergency trigger first and, if set, requests teardown through the bridge
//! and skips the logic. Sites are planned once per unit and reused on every reload until the
//! transformer is deactivated, which reloads the units once more with their original bytes.

use crate::{
  bridge::TeardownBridge,
  error::{HookError, Result},
  patch::{
    asm::{self, JmpSize, Signature, StubTargets},
    loader::{CodeLoader, CodeUnit, Rewriter},
    memory::{Memory, OwnedMem, PAGE_SIZE},
  },
};
use dashmap::DashMap;
use iced_x86::{FlowControl, Instruction};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
  collections::BTreeMap,
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{Arc, atomic::{AtomicBool, Ordering}},
};

const MAX_TRAMPOLINE: usize = 0x100;

pub type Trigger = Arc<dyn Fn() -> bool + Send + Sync>;
pub type FrameLogic = Arc<dyn Fn(&Dialect) + Send + Sync>;

/// Naming scheme of a build of the host. Frame logic looks host symbols up here so it only ever
/// uses names the patched unit itself uses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialect {
  pub name: String,
  #[serde(default)]
  pub symbols: BTreeMap<String, String>,
}

impl Dialect {
  pub fn new(name: &str) -> Self { Self { name: name.to_string(), symbols: BTreeMap::new() } }

  pub fn with_symbol(mut self, logical: &str, name: &str) -> Self {
    self.symbols.insert(logical.to_string(), name.to_string());
    self
  }

  pub fn symbol(&self, logical: &str) -> Option<&str> { self.symbols.get(logical).map(String::as_str) }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetUnit {
  pub name: String,
  pub dialect: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
  pub name: String,
  /// Byte pattern marking the method's entry, `??` for wildcards.
  pub pattern: String,
  #[serde(default = "default_max_len")]
  pub max_len: usize,
}

fn default_max_len() -> usize { 0x400 }

/// Everything needed to find the interception point in any known build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTable {
  pub point: String,
  pub units: Vec<TargetUnit>,
  /// Tried in order, first match wins.
  pub methods: Vec<MethodSignature>,
  pub dialects: Vec<Dialect>,
}

impl PatchTable {
  pub fn targets(&self, unit: &str) -> bool { self.units.iter().any(|u| u.name == unit) }

  pub fn dialect_for(&self, unit: &str) -> Option<&Dialect> {
    let target = self.units.iter().find(|u| u.name == unit)?;
    self.dialects.iter().find(|d| d.name == target.dialect)
  }
}

/// One patched return site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchPoint {
  pub unit: String,
  /// Offset into the unit.
  pub offset: usize,
  pub original: Vec<u8>,
  pub replacement: Vec<u8>,
  pub trampoline: usize,
}

/// State shared with the trampolines of one dialect. Lives at a fixed address for as long as any
/// trampoline can reach it.
pub struct PatchContext {
  dialect: Dialect,
  active: Arc<AtomicBool>,
  trigger: Trigger,
  bridge: TeardownBridge,
  logic: FrameLogic,
}

impl PatchContext {
  pub fn dialect(&self) -> &Dialect { &self.dialect }

  /// Runs before every patched return. True means skip the frame logic.
  pub fn should_return(&self) -> bool {
    if !self.active.load(Ordering::Acquire) {
      return true;
    }
    if (self.trigger)() {
      info!("[Transformer] Emergency unload triggered from {}", self.dialect.name);
      self.bridge.request_teardown();
      return true;
    }
    false
  }

  pub fn run_logic(&self) { (self.logic)(&self.dialect) }
}

extern "C" fn patched_should_return(ctx: *const PatchContext) -> u8 {
  let Some(ctx) = (unsafe { ctx.as_ref() }) else { return 1 };
  match catch_unwind(AssertUnwindSafe(|| ctx.should_return())) {
    Ok(skip) => skip as u8,
    Err(_) => {
      error!("[Transformer] Trigger check panicked");
      1
    }
  }
}

extern "C" fn patched_logic(ctx: *const PatchContext) {
  let Some(ctx) = (unsafe { ctx.as_ref() }) else { return };
  if catch_unwind(AssertUnwindSafe(|| ctx.run_logic())).is_err() {
    error!("[Transformer] Frame logic panicked");
  }
}

struct ReturnSite {
  offset: usize,
  len: usize,
  displaced: Vec<Instruction>,
  ret_bytes: Vec<u8>,
}

struct TransformerInner {
  table: PatchTable,
  memory: Arc<dyn Memory>,
  active: Arc<AtomicBool>,
  transformed: AtomicBool,
  on_first: Mutex<Option<Box<dyn FnOnce() + Send>>>,
  contexts: DashMap<String, Arc<PatchContext>>,
  points: DashMap<String, Vec<PatchPoint>>,
  blocks: Mutex<Vec<OwnedMem>>,
  trigger: Trigger,
  bridge: TeardownBridge,
  logic: FrameLogic,
}

fn failure(unit: &str, reason: impl std::fmt::Display) -> HookError { HookError::TransformFailure { unit: unit.to_string(), reason: reason.to_string() } }

impl TransformerInner {
  fn context_for(&self, dialect: &Dialect) -> Arc<PatchContext> {
    let context = self.contexts.entry(dialect.name.clone()).or_insert_with(|| {
      debug!("[Transformer] Using the {} dialect", dialect.name);
      Arc::new(PatchContext { dialect: dialect.clone(), active: Arc::clone(&self.active), trigger: Arc::clone(&self.trigger), bridge: self.bridge.clone(), logic: Arc::clone(&self.logic) })
    });
    Arc::clone(context.value())
  }

  fn locate_method(&self, unit: &CodeUnit) -> Result<(&MethodSignature, usize)> {
    for method in &self.table.methods {
      let signature = Signature::parse(&method.pattern)?;
      if let Some(offset) = signature.find(&unit.bytes) {
        debug!("[Transformer] {} found {} at +{offset:#X}", unit.name, method.name);
        return Ok((method, offset));
      }
      trace!("[Transformer] {} has no {}", unit.name, method.name);
    }
    Err(failure(&unit.name, "no method signature matched"))
  }

  /// A block with room for another trampoline, reachable from the whole unit.
  fn block_for<'a>(&self, blocks: &'a mut Vec<OwnedMem>, unit: &CodeUnit) -> Result<&'a mut OwnedMem> {
    let usable = |b: &OwnedMem| b.is_nearby(unit.base) && b.is_nearby(unit.end()) && b.is_mem_enough(MAX_TRAMPOLINE);
    let index = match blocks.iter().position(usable) {
      Some(index) => index,
      None => {
        let block = self.memory.alloc_near(unit.base, PAGE_SIZE)?;
        debug!("[Transformer] Allocated {:#X} bytes at {:#X}", block.size(), block.address());
        blocks.push(block);
        blocks.len() - 1
      }
    };
    Ok(&mut blocks[index])
  }

  fn plan(&self, unit: &CodeUnit) -> Result<Vec<PatchPoint>> {
    let dialect = self.table.dialect_for(&unit.name).ok_or_else(|| failure(&unit.name, "no dialect for this unit"))?;
    let (method, offset) = self.locate_method(unit)?;
    let context = self.context_for(dialect);

    let mut blocks = self.blocks.lock();
    let reach = {
      let block = self.block_for(&mut blocks, unit)?;
      if block.is_nearby(unit.base) && block.is_nearby(unit.end()) { JmpSize::Near } else { JmpSize::Far }
    };

    let sites = return_sites(unit, offset, method.max_len, reach as usize)?;
    let mut points = Vec::with_capacity(sites.len());

    for site in &sites {
      let block = self.block_for(&mut blocks, unit)?;
      let trampoline = self.build_trampoline(block, site, &context).map_err(|e| failure(&unit.name, e))?;

      let site_address = unit.base + site.offset;
      let mut replacement = asm::jump_bytes(site_address, trampoline);
      if replacement.len() > site.len {
        return Err(failure(&unit.name, format!("jump to {trampoline:#X} does not fit at +{:#X}", site.offset)));
      }
      replacement.extend(asm::nop_bytes(site.len - replacement.len()));

      trace!("[Transformer] {} +{:#X}: {:02X?} -> {:02X?}", unit.name, site.offset, &unit.bytes[site.offset..site.offset + site.len], replacement);
      points.push(PatchPoint { unit: unit.name.clone(), offset: site.offset, original: unit.bytes[site.offset..site.offset + site.len].to_vec(), replacement, trampoline });
    }

    info!("[Transformer] Planned {} return point(s) in {}::{} ({} dialect)", points.len(), unit.name, method.name, dialect.name);
    Ok(points)
  }

  fn build_trampoline(&self, block: &mut OwnedMem, site: &ReturnSite, context: &Arc<PatchContext>) -> Result<usize> {
    let ip = block.cursor() as u64;
    let mut code = Vec::new();
    if !site.displaced.is_empty() {
      trace!("[Transformer] Displacing {:?} to {ip:#X}", asm::opcode_display(&site.displaced));
      code = asm::relocate(&site.displaced, ip)?;
    }

    let targets = StubTargets { context: Arc::as_ptr(context) as u64, check: patched_should_return as usize as u64, logic: patched_logic as usize as u64 };
    code.extend(asm::assemble_stub(ip + code.len() as u64, &targets)?);
    code.extend_from_slice(&site.ret_bytes);

    let address = block.take(code.len()).ok_or_else(|| HookError::memory(block.address(), "trampoline block exhausted"))?;
    self.memory.write(address, &code)?;
    Ok(address)
  }

  fn fire_first_activation(&self, unit: &str) {
    let callback = self.on_first.lock().take();
    if let Some(callback) = callback {
      info!("[Transformer] First rewrite live in {unit}");
      if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("[Transformer] First-activation callback panicked");
      }
    }
  }
}

impl Rewriter for TransformerInner {
  fn name(&self) -> &str { &self.table.point }

  fn rewrite(&self, unit: &CodeUnit) -> Result<Option<Vec<u8>>> {
    if !self.table.targets(&unit.name) {
      return Ok(None);
    }
    if !self.active.load(Ordering::Acquire) {
      debug!("[Transformer] Inactive, {} keeps its original body", unit.name);
      return Ok(None);
    }

    let points = match self.points.get(&unit.name) {
      Some(points) => points.clone(),
      None => {
        let points = self.plan(unit).inspect_err(|e| warn!("[Transformer] {e}"))?;
        self.points.insert(unit.name.clone(), points.clone());
        points
      }
    };

    let mut bytes = unit.bytes.clone();
    for point in &points {
      let range = point.offset..point.offset + point.original.len();
      if bytes.get(range.clone()) != Some(point.original.as_slice()) {
        return Err(failure(&unit.name, format!("bytes at +{:#X} changed since planning", point.offset)));
      }
      bytes[range].copy_from_slice(&point.replacement);
    }

    if !self.transformed.swap(true, Ordering::AcqRel) {
      self.fire_first_activation(&unit.name);
    }
    Ok(Some(bytes))
  }
}

impl Drop for TransformerInner {
  fn drop(&mut self) {
    if self.points.is_empty() {
      return;
    }
    // Trampolines still point at the contexts.
    error!("[Transformer] Dropped while {} unit(s) are patched, leaking their contexts", self.points.len());
    for context in self.contexts.iter() {
      std::mem::forget(Arc::clone(context.value()));
    }
  }
}

/// Picks a patchable range for every return in the method at `offset`. A return followed by
/// enough padding is patched in place, otherwise the instructions before it are displaced into
/// the trampoline as long as nothing branches into them.
fn return_sites(unit: &CodeUnit, offset: usize, max_len: usize, jmp_len: usize) -> Result<Vec<ReturnSite>> {
  let instrs = asm::decode_method(&unit.bytes[offset..], (unit.base + offset) as u64, max_len);
  let targets = asm::branch_targets(&instrs);
  let is_target = |from: u64, to: u64| targets.iter().any(|t| (from..to).contains(t));
  let to_offset = |ip: u64| ip as usize - unit.base;

  let mut sites: Vec<ReturnSite> = Vec::new();
  for (index, ret) in instrs.iter().enumerate().filter(|(_, i)| i.flow_control() == FlowControl::Return) {
    let ret_offset = to_offset(ret.ip());
    let ret_bytes = unit.bytes[ret_offset..ret_offset + ret.len()].to_vec();

    let padded_end = ret_offset + jmp_len.max(ret.len());
    let padded = unit.bytes.get(ret_offset + ret.len()..padded_end).is_some_and(|pad| pad.iter().all(|b| asm::is_padding(*b)));
    if padded && !is_target(ret.ip() + 1, (unit.base + padded_end) as u64) {
      sites.push(ReturnSite { offset: ret_offset, len: padded_end - ret_offset, displaced: Vec::new(), ret_bytes });
      continue;
    }

    let mut start = index;
    let mut len = ret.len();
    while len < jmp_len {
      let Some(prev) = start.checked_sub(1).map(|i| &instrs[i]) else {
        return Err(failure(&unit.name, format!("return at +{ret_offset:#X} is too close to the method entry")));
      };
      if prev.flow_control() != FlowControl::Next {
        return Err(failure(&unit.name, format!("return at +{ret_offset:#X} follows control flow at {:#X}", prev.ip())));
      }
      start -= 1;
      len += prev.len();
    }

    let first = instrs[start].ip();
    if is_target(first + 1, ret.ip() + ret.len() as u64) {
      return Err(failure(&unit.name, format!("a branch lands inside the range before +{ret_offset:#X}")));
    }
    sites.push(ReturnSite { offset: to_offset(first), len, displaced: instrs[start..index].to_vec(), ret_bytes });
  }

  if sites.is_empty() {
    return Err(failure(&unit.name, "method has no return point"));
  }
  if sites.windows(2).any(|pair| pair[0].offset + pair[0].len > pair[1].offset) {
    return Err(failure(&unit.name, "return points too close together to patch"));
  }
  Ok(sites)
}

/// Patches the render method of the target units through a [`CodeLoader`].
#[derive(Clone)]
pub struct CodeTransformer {
  inner: Arc<TransformerInner>,
  rewriter: Arc<dyn Rewriter>,
  loader: Arc<dyn CodeLoader>,
}

impl CodeTransformer {
  /// `trigger` is polled before every patched return, `logic` runs when it is not set.
  pub fn new(table: PatchTable, memory: Arc<dyn Memory>, loader: Arc<dyn CodeLoader>, bridge: TeardownBridge, trigger: Trigger, logic: FrameLogic) -> Self {
    let inner = Arc::new(TransformerInner {
      table,
      memory,
      active: Arc::new(AtomicBool::new(false)),
      transformed: AtomicBool::new(false),
      on_first: Mutex::new(None),
      contexts: DashMap::new(),
      points: DashMap::new(),
      blocks: Mutex::new(Vec::new()),
      trigger,
      bridge,
      logic,
    });
    let rewriter: Arc<dyn Rewriter> = inner.clone();
    Self { inner, rewriter, loader }
  }

  pub fn table(&self) -> &PatchTable { &self.inner.table }

  pub fn is_active(&self) -> bool { self.inner.active.load(Ordering::Acquire) }

  /// Whether any unit has been rewritten since activation.
  pub fn has_transformed(&self) -> bool { self.inner.transformed.load(Ordering::Acquire) }

  /// Registers the rewriter and reloads every target unit already loaded. `on_first_activation`
  /// runs once, right after the first unit is rewritten.
  pub fn activate(&self, on_first_activation: impl FnOnce() + Send + 'static) -> Result<()> {
    if self.inner.active.swap(true, Ordering::AcqRel) {
      return Err(HookError::InvalidState(format!("`{}` is already active", self.inner.table.point)));
    }
    self.inner.transformed.store(false, Ordering::Release);
    *self.inner.on_first.lock() = Some(Box::new(on_first_activation));

    self.loader.add_rewriter(Arc::clone(&self.rewriter));
    info!("[Transformer] Activated for {:?}", self.inner.table.units.iter().map(|u| u.name.as_str()).collect::<Vec<_>>());

    for unit in self.loaded_targets() {
      if let Err(e) = self.loader.reload(&unit) {
        warn!("[Transformer] Reload of {unit} failed: {e}");
      }
    }
    Ok(())
  }

  /// Takes the rewriter off the loader once the patch is live. Patched units stay patched.
  pub fn retire_discovery(&self) -> bool {
    let removed = self.loader.remove_rewriter(&self.rewriter);
    if removed {
      debug!("[Transformer] Discovery rewriter retired");
    }
    removed
  }

  /// Turns the trampolines off and reloads the patched units with their original bytes.
  pub fn deactivate(&self) -> Result<()> {
    let was_active = self.inner.active.swap(false, Ordering::AcqRel);
    self.inner.on_first.lock().take();
    if !was_active && self.inner.points.is_empty() {
      return Ok(());
    }

    // Re-added for the restoring pass even if it was retired.
    self.loader.remove_rewriter(&self.rewriter);
    self.loader.add_rewriter(Arc::clone(&self.rewriter));

    let mut failed = Vec::new();
    let units: Vec<String> = self.inner.points.iter().map(|p| p.key().clone()).collect();
    for unit in units {
      match self.loader.reload(&unit) {
        Ok(()) => {
          self.inner.points.remove(&unit);
          info!("[Transformer] Restored {unit}");
        }
        Err(e) => {
          error!("[Transformer] Restoring {unit} failed: {e}");
          failed.push(unit);
        }
      }
    }

    self.loader.remove_rewriter(&self.rewriter);
    match failed.first() {
      None => Ok(()),
      Some(unit) => Err(failure(unit, format!("{} unit(s) still patched", failed.len()))),
    }
  }

  /// Inactive with no patched unit left.
  pub fn is_clean(&self) -> bool { !self.is_active() && self.inner.points.is_empty() }

  pub fn patch_points(&self, unit: &str) -> Vec<PatchPoint> { self.inner.points.get(unit).map(|p| p.clone()).unwrap_or_default() }

  pub fn context(&self, dialect: &str) -> Option<Arc<PatchContext>> { self.inner.contexts.get(dialect).map(|c| Arc::clone(c.value())) }

  fn loaded_targets(&self) -> Vec<String> { self.loader.loaded_units().into_iter().filter(|u| self.inner.table.targets(u)).collect() }
}
