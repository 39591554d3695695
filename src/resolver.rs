//! Symbol resolution under name uncertainty.
//!
//! A logical target ("the root singleton", "the hud object", "the task scheduling method") is
//! described by a [`CandidateSet`]: stable names first, obfuscated or legacy names next and
//! structural predicates last. The first candidate that matches wins and the result is cached
//! until the resolver is invalidated.

use crate::{error::{HookError, Result}, host::{HostRuntime, ObjectRef, TypeInfo, Value}};
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Candidate {
  /// Declared field by exact name.
  Field { name: String },
  /// Declared method by exact name and parameter types.
  Method { name: String, params: Vec<String> },
  /// First declared field whose type name contains the substring.
  FieldType { contains: String },
  /// First declared method with exactly these parameter types.
  MethodParams { params: Vec<String> },
  /// Zero-argument static accessor or static field on a class, used for singletons.
  Accessor { class: String, member: String },
}

impl Candidate {
  pub fn field(name: &str) -> Self { Candidate::Field { name: name.to_string() } }

  pub fn method(name: &str, params: &[&str]) -> Self { Candidate::Method { name: name.to_string(), params: params.iter().map(|p| p.to_string()).collect() } }

  pub fn field_type(contains: &str) -> Self { Candidate::FieldType { contains: contains.to_string() } }

  pub fn method_params(params: &[&str]) -> Self { Candidate::MethodParams { params: params.iter().map(|p| p.to_string()).collect() } }

  pub fn accessor(class: &str, member: &str) -> Self { Candidate::Accessor { class: class.to_string(), member: member.to_string() } }
}

/// Ordered candidates for one logical name. Order is preference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSet {
  pub logical: String,
  pub candidates: Vec<Candidate>,
}

impl CandidateSet {
  pub fn new(logical: &str, candidates: Vec<Candidate>) -> Self { Self { logical: logical.to_string(), candidates } }

  /// Shorthand for a set of plain field names.
  pub fn fields(logical: &str, names: &[&str]) -> Self { Self::new(logical, names.iter().map(|n| Candidate::field(n)).collect()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchKind {
  /// The preferred candidate matched by name.
  Exact,
  /// A later name or a structural predicate matched.
  Fallback,
}

/// Which candidate produced a handle and what member it landed on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Provenance {
  pub candidate: usize,
  pub member: String,
  pub kind: MatchKind,
}

impl std::fmt::Display for Provenance {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.kind {
      MatchKind::Exact => write!(f, "{} (exact)", self.member),
      MatchKind::Fallback => write!(f, "{} (structural/name fallback)", self.member),
    }
  }
}

#[derive(Clone, Debug)]
struct EpochGuard {
  logical: String,
  epoch: u64,
  current: Arc<AtomicU64>,
}

impl EpochGuard {
  fn check(&self) -> Result<()> { if self.current.load(Ordering::Acquire) == self.epoch { Ok(()) } else { Err(HookError::StaleHandle { logical: self.logical.clone() }) } }
}

#[derive(Clone)]
pub struct FieldAccessor {
  owner: ObjectRef,
  name: String,
  type_name: String,
  guard: EpochGuard,
}

impl FieldAccessor {
  pub fn get(&self) -> Result<Value> {
    self.guard.check()?;
    self.owner.get_field(&self.name)
  }

  pub fn set(&self, value: Value) -> Result<()> {
    self.guard.check()?;
    self.owner.set_field(&self.name, value)
  }

  pub fn owner(&self) -> &ObjectRef { &self.owner }

  pub fn name(&self) -> &str { &self.name }

  pub fn type_name(&self) -> &str { &self.type_name }
}

#[derive(Clone)]
pub struct MethodAccessor {
  owner: ObjectRef,
  name: String,
  params: Vec<String>,
  guard: EpochGuard,
}

impl MethodAccessor {
  pub fn invoke(&self, args: &[Value]) -> Result<Value> {
    self.guard.check()?;
    self.owner.invoke(&self.name, args)
  }

  pub fn name(&self) -> &str { &self.name }

  pub fn params(&self) -> &[String] { &self.params }
}

#[derive(Clone)]
pub enum Target {
  Instance(ObjectRef),
  Field(FieldAccessor),
  Method(MethodAccessor),
}

/// A discovered host entity. Immutable, and unusable once the resolver that made it is invalidated.
#[derive(Clone)]
pub struct ResolvedHandle {
  logical: String,
  target: Target,
  provenance: Provenance,
  guard: EpochGuard,
}

impl std::fmt::Debug for ResolvedHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let target = match &self.target {
      Target::Instance(_) => "instance",
      Target::Field(_) => "field",
      Target::Method(_) => "method",
    };
    f.debug_struct("ResolvedHandle").field("logical", &self.logical).field("target", &target).field("provenance", &self.provenance.to_string()).field("epoch", &self.guard.epoch).finish()
  }
}

impl ResolvedHandle {
  pub fn logical(&self) -> &str { &self.logical }

  pub fn provenance(&self) -> &Provenance { &self.provenance }

  pub fn candidate_index(&self) -> usize { self.provenance.candidate }

  pub fn is_valid(&self) -> bool { self.guard.check().is_ok() }

  pub fn target(&self) -> Result<&Target> {
    self.guard.check()?;
    Ok(&self.target)
  }

  pub fn instance(&self) -> Result<ObjectRef> {
    match self.target()? {
      Target::Instance(obj) => Ok(Arc::clone(obj)),
      _ => Err(HookError::host(format!("`{}` is not an instance", self.logical))),
    }
  }

  pub fn field(&self) -> Result<&FieldAccessor> {
    match self.target()? {
      Target::Field(field) => Ok(field),
      _ => Err(HookError::host(format!("`{}` is not a field", self.logical))),
    }
  }

  pub fn method(&self) -> Result<&MethodAccessor> {
    match self.target()? {
      Target::Method(method) => Ok(method),
      _ => Err(HookError::host(format!("`{}` is not a method", self.logical))),
    }
  }
}

/// Resolves logical names against live host scopes and caches the results.
#[derive(Default)]
pub struct Resolver {
  sets: DashMap<String, CandidateSet>,
  cache: DashMap<String, ResolvedHandle>,
  epoch: Arc<AtomicU64>,
}

impl Resolver {
  pub fn new(sets: impl IntoIterator<Item = CandidateSet>) -> Self {
    let resolver = Self::default();
    for set in sets {
      resolver.register_set(set);
    }
    resolver
  }

  pub fn register_set(&self, set: CandidateSet) { self.sets.insert(set.logical.clone(), set); }

  pub fn candidate_set(&self, logical: &str) -> Option<CandidateSet> { self.sets.get(logical).map(|s| s.clone()) }

  pub fn epoch(&self) -> u64 { self.epoch.load(Ordering::Acquire) }

  /// Resolves a registered logical name among the declared members of `scope`.
  pub fn resolve(&self, logical: &str, scope: &ObjectRef) -> Result<ResolvedHandle> {
    if let Some(hit) = self.cached(logical) {
      return Ok(hit);
    }

    let set = self.candidate_set(logical).ok_or_else(|| HookError::not_found(logical))?;
    let handle = self.resolve_with(&set, scope)?;
    self.cache.insert(logical.to_string(), handle.clone());
    Ok(handle)
  }

  /// Resolves a registered logical name to a live instance by calling static accessors.
  pub fn resolve_root(&self, logical: &str, runtime: &dyn HostRuntime) -> Result<ResolvedHandle> {
    if let Some(hit) = self.cached(logical) {
      return Ok(hit);
    }

    let set = self.candidate_set(logical).ok_or_else(|| HookError::not_found(logical))?;
    let handle = self.resolve_root_with(&set, runtime)?;
    self.cache.insert(logical.to_string(), handle.clone());
    Ok(handle)
  }

  /// Uncached resolution of an ad-hoc set against `scope`.
  pub fn resolve_with(&self, set: &CandidateSet, scope: &ObjectRef) -> Result<ResolvedHandle> {
    let type_info = scope.type_info();

    for (index, candidate) in set.candidates.iter().enumerate() {
      let Some((member, target)) = self.match_member(set, candidate, scope, &type_info) else {
        trace!("[Resolver] {}: candidate #{index} {candidate:?} missed on {}", set.logical, type_info.name);
        continue;
      };

      if let Err(e) = scope.set_accessible(&member) {
        debug!("[Resolver] {}: could not lift visibility of {member}: {e}", set.logical);
      }

      return Ok(self.found(set, index, member, target));
    }

    warn!("[Resolver] {}: no candidate matched on {}", set.logical, type_info.name);
    Err(HookError::not_found(&set.logical))
  }

  /// Uncached resolution of an ad-hoc accessor set.
  pub fn resolve_root_with(&self, set: &CandidateSet, runtime: &dyn HostRuntime) -> Result<ResolvedHandle> {
    for (index, candidate) in set.candidates.iter().enumerate() {
      let Candidate::Accessor { class, member } = candidate else { continue };

      let Some(class_obj) = runtime.find_class(class) else {
        trace!("[Resolver] {}: class {class} not loaded", set.logical);
        continue;
      };

      let type_info = class_obj.type_info();
      let value = if type_info.methods.iter().any(|m| m.name == *member && m.params.is_empty()) {
        let _ = class_obj.set_accessible(member);
        class_obj.invoke(member, &[])
      } else if type_info.fields.iter().any(|f| f.name == *member && f.is_static) {
        let _ = class_obj.set_accessible(member);
        class_obj.get_field(member)
      } else {
        trace!("[Resolver] {}: {class} has no accessor {member}", set.logical);
        continue;
      };

      match value {
        Ok(Value::Object(instance)) => return Ok(self.found(set, index, format!("{class}.{member}"), Target::Instance(instance))),
        Ok(other) => debug!("[Resolver] {}: {class}.{member} returned {other:?}", set.logical),
        Err(e) => debug!("[Resolver] {}: {class}.{member} failed: {e}", set.logical),
      }
    }

    warn!("[Resolver] {}: no accessor produced an instance", set.logical);
    Err(HookError::not_found(&set.logical))
  }

  /// Drops every cached result and turns all outstanding handles stale.
  pub fn invalidate(&self) {
    let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
    self.cache.clear();
    debug!("[Resolver] Invalidated, epoch {epoch}");
  }

  fn cached(&self, logical: &str) -> Option<ResolvedHandle> { self.cache.get(logical).map(|h| h.clone()).filter(|h| h.is_valid()) }

  fn guard(&self, logical: &str) -> EpochGuard { EpochGuard { logical: logical.to_string(), epoch: self.epoch(), current: Arc::clone(&self.epoch) } }

  fn found(&self, set: &CandidateSet, index: usize, member: String, target: Target) -> ResolvedHandle {
    let kind = if index == 0 && !is_structural(&set.candidates[0]) { MatchKind::Exact } else { MatchKind::Fallback };
    let provenance = Provenance { candidate: index, member, kind };
    info!("[Resolver] Found {}: {provenance}", set.logical);

    ResolvedHandle { logical: set.logical.clone(), target, provenance, guard: self.guard(&set.logical) }
  }

  fn match_member(&self, set: &CandidateSet, candidate: &Candidate, scope: &ObjectRef, type_info: &TypeInfo) -> Option<(String, Target)> {
    let field = |name: &str, type_name: &str| Target::Field(FieldAccessor { owner: Arc::clone(scope), name: name.to_string(), type_name: type_name.to_string(), guard: self.guard(&set.logical) });
    let method = |name: &str, params: &[String]| Target::Method(MethodAccessor { owner: Arc::clone(scope), name: name.to_string(), params: params.to_vec(), guard: self.guard(&set.logical) });

    match candidate {
      Candidate::Field { name } => type_info.declared_field(name).map(|f| (f.name.clone(), field(&f.name, &f.type_name))),
      Candidate::Method { name, params } => type_info.declared_method(name, params).map(|m| (m.name.clone(), method(&m.name, &m.params))),
      Candidate::FieldType { contains } => type_info.fields.iter().find(|f| f.type_name.contains(contains.as_str())).map(|f| (f.name.clone(), field(&f.name, &f.type_name))),
      Candidate::MethodParams { params } => type_info.methods.iter().find(|m| m.params == *params).map(|m| (m.name.clone(), method(&m.name, &m.params))),
      Candidate::Accessor { .. } => None,
    }
  }
}

fn is_structural(candidate: &Candidate) -> bool { matches!(candidate, Candidate::FieldType { .. } | Candidate::MethodParams { .. }) }
