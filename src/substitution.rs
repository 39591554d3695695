//! Object substitution: swap the object the host renders through for a wrapper that renders
//! the original and then the overlays.

use crate::{
  config::logical,
  coordinator::{HookRecord, StrategyKind},
  error::{HookError, Result},
  host::{HostObject, HostRuntime, ObjectRef, TypeInfo, Value, same_object},
  ledger::MutationLedger,
  overlay::{FrameContext, OverlayRegistry},
  resolver::{CandidateSet, ResolvedHandle, Resolver},
};
use log::{debug, error, info, trace, warn};
use std::{panic::{AssertUnwindSafe, catch_unwind}, sync::{Arc, atomic::{AtomicBool, AtomicU64, Ordering}}};

pub const INTERCEPTION_POINT: &str = "frame_render";

/// Stand-in for the host's render object. Holds a fresh instance of the original's type whose
/// state was copied from the original, and forwards everything to it.
pub struct HookedObject {
  base: ObjectRef,
  type_info: Arc<TypeInfo>,
  render_method: String,
  render_arity: usize,
  overlays: Arc<OverlayRegistry>,
  triggered: Arc<AtomicBool>,
  renders: AtomicU64,
}

impl HookedObject {
  pub fn base(&self) -> &ObjectRef { &self.base }

  /// Frames rendered through this wrapper.
  pub fn renders(&self) -> u64 { self.renders.load(Ordering::Acquire) }

  fn is_render_call(&self, name: &str, args: &[Value]) -> bool { name == self.render_method && args.len() == self.render_arity }
}

impl HostObject for HookedObject {
  fn type_info(&self) -> Arc<TypeInfo> { Arc::clone(&self.type_info) }

  fn get_field(&self, name: &str) -> Result<Value> { self.base.get_field(name) }

  fn set_field(&self, name: &str, value: Value) -> Result<()> { self.base.set_field(name, value) }

  fn invoke(&self, name: &str, args: &[Value]) -> Result<Value> {
    if !self.is_render_call(name, args) {
      return self.base.invoke(name, args);
    }

    let result = match catch_unwind(AssertUnwindSafe(|| self.base.invoke(name, args))) {
      Ok(result) => result,
      Err(_) => {
        error!("[Substitution] Original {name} panicked");
        Err(HookError::host(format!("original {name} panicked")))
      }
    };

    self.renders.fetch_add(1, Ordering::AcqRel);
    if !self.triggered.swap(true, Ordering::AcqRel) {
      info!("[Substitution] First frame rendered through the hook");
    }

    let partial_ticks = args.first().and_then(Value::as_float).unwrap_or_default();
    self.overlays.dispatch(&FrameContext { partial_ticks, dialect: None });

    result
  }

  fn set_accessible(&self, member: &str) -> Result<()> { self.base.set_accessible(member) }
}

/// Installs [`HookedObject`]s into host fields and records how to take them out again.
pub struct SubstitutionHook {
  runtime: Arc<dyn HostRuntime>,
  resolver: Arc<Resolver>,
  ledger: Arc<MutationLedger>,
  overlays: Arc<OverlayRegistry>,
  ctor_pool: Vec<Value>,
}

impl SubstitutionHook {
  /// `ctor_pool` holds values the wrapper's constructor may be fed, usually the root instance.
  pub fn new(runtime: Arc<dyn HostRuntime>, resolver: Arc<Resolver>, ledger: Arc<MutationLedger>, overlays: Arc<OverlayRegistry>, ctor_pool: Vec<Value>) -> Self { Self { runtime, resolver, ledger, overlays, ctor_pool } }

  /// Replaces the object held by the `field` handle. Must run on the host thread.
  pub fn install(&self, field: &ResolvedHandle) -> Result<HookRecord> {
    let accessor = field.field()?.clone();
    let original = match accessor.get()? {
      Value::Object(obj) => obj,
      other => {
        warn!("[Substitution] {} holds {other:?}, nothing to hook", field.logical());
        return Err(HookError::not_found(field.logical()));
      }
    };

    let original_type = original.type_info();
    let render = self.resolver.resolve_with(&self.render_entry_set(), &original)?;
    let render_method = render.method()?;

    let args = self.constructor_args(&original_type)?;
    let base = self.runtime.instantiate(&original_type, &args)?;
    let copied = copy_fields(&original, &base);
    debug!("[Substitution] Copied {copied} field(s) from {}", original_type.name);

    let record = HookRecord::new(INTERCEPTION_POINT, StrategyKind::Substitution, vec![field.clone(), render.clone()]);
    let hooked = Arc::new(HookedObject {
      base,
      type_info: Arc::new(TypeInfo::new(&format!("{}$FrameHook", original_type.name)).with_parent(Arc::clone(&original_type))),
      render_method: render_method.name().to_string(),
      render_arity: render_method.params().len(),
      overlays: Arc::clone(&self.overlays),
      triggered: record.trigger_flag(),
      renders: AtomicU64::new(0),
    });
    let hooked_ref: ObjectRef = hooked;

    accessor.set(Value::Object(Arc::clone(&hooked_ref)))?;
    info!("[Substitution] Render hook installed on {} via {}", field.logical(), field.provenance());

    // Raw owner access: the inverse outlives the resolver's handles.
    let owner = Arc::clone(accessor.owner());
    let slot = accessor.name().to_string();
    self.ledger.register(&format!("substitution:{}", field.logical()), move || {
      copy_fields(&hooked_ref, &original);
      match owner.get_field(&slot)? {
        Value::Object(current) if same_object(&current, &hooked_ref) => owner.set_field(&slot, Value::Object(original)),
        other => {
          warn!("[Substitution] {slot} was replaced by the host ({other:?}), leaving it alone");
          Ok(())
        }
      }
    });

    Ok(record)
  }

  fn render_entry_set(&self) -> CandidateSet { self.resolver.candidate_set(logical::RENDER_ENTRY).unwrap_or_else(|| CandidateSet::new(logical::RENDER_ENTRY, Vec::new())) }

  /// Arguments for the first constructor whose parameters can all be fed from the pool.
  fn constructor_args(&self, type_info: &TypeInfo) -> Result<Vec<Value>> {
    for params in &type_info.constructors {
      let args: Option<Vec<Value>> = params.iter().map(|param| self.ctor_pool.iter().find(|v| v.is_assignable_to(param)).cloned()).collect();
      if let Some(args) = args {
        trace!("[Substitution] Using {}({})", type_info.name, params.join(", "));
        return Ok(args);
      }
    }

    Err(HookError::not_found(format!("constructor of {}", type_info.name)))
  }
}

/// Copies every non-static field of `src`'s hierarchy into `dst`. Fields that refuse are skipped.
pub fn copy_fields(src: &ObjectRef, dst: &ObjectRef) -> usize {
  let type_info = src.type_info();
  let mut copied = 0;

  for field in type_info.instance_fields() {
    let _ = src.set_accessible(&field.name);
    let _ = dst.set_accessible(&field.name);
    match src.get_field(&field.name).and_then(|v| dst.set_field(&field.name, v)) {
      Ok(()) => copied += 1,
      Err(e) => trace!("[Substitution] Skipped {}: {e}", field.name),
    }
  }

  copied
}
