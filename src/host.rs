//! Contract between the hook machinery and the host process.
//!
//! The host exposes its internals reflectively: every object reports a [`TypeInfo`] describing
//! declared fields, methods and constructors, and values travel as [`Value`]. None of the names
//! are known ahead of time, which is what the resolver is for.

use crate::error::{HookError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

pub type ObjectRef = Arc<dyn HostObject>;

/// Unit of work handed to the host's main thread. Runs at most once.
#[derive(Clone)]
pub struct Task(Arc<Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>>);

impl Task {
  pub fn new(f: impl FnOnce() + Send + 'static) -> Self { Self(Arc::new(Mutex::new(Some(Box::new(f))))) }

  /// Runs the task if it has not run yet, returns whether it ran.
  pub fn run(&self) -> bool {
    let f = self.0.lock().take();
    match f {
      Some(f) => {
        f();
        true
      }
      None => false,
    }
  }

  pub fn has_run(&self) -> bool { self.0.lock().is_none() }
}

impl std::fmt::Debug for Task {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("Task").field("has_run", &self.has_run()).finish() }
}

#[derive(Clone, Default)]
pub enum Value {
  #[default]
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Object(ObjectRef),
  Task(Task),
}

impl Value {
  pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

  pub fn as_object(&self) -> Option<&ObjectRef> { if let Value::Object(obj) = self { Some(obj) } else { None } }

  pub fn as_bool(&self) -> Option<bool> { if let Value::Bool(b) = self { Some(*b) } else { None } }

  pub fn as_float(&self) -> Option<f64> {
    match self {
      Value::Float(v) => Some(*v),
      Value::Int(v) => Some(*v as f64),
      _ => None,
    }
  }

  /// Name of the runtime type, objects report their concrete host type.
  pub fn type_name(&self) -> String {
    match self {
      Value::Null => "null".to_string(),
      Value::Bool(_) => "boolean".to_string(),
      Value::Int(_) => "int".to_string(),
      Value::Float(_) => "float".to_string(),
      Value::Str(_) => "String".to_string(),
      Value::Object(obj) => obj.type_info().name.clone(),
      Value::Task(_) => "Runnable".to_string(),
    }
  }

  /// Whether the value can be assigned to a slot declared as `type_name`.
  pub fn is_assignable_to(&self, type_name: &str) -> bool {
    match self {
      Value::Object(obj) => obj.type_info().is_a(type_name),
      Value::Null => false,
      other => other.type_name() == type_name,
    }
  }
}

/// Identity for objects and tasks, structural equality for everything else.
impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Value::Null, Value::Null) => true,
      (Value::Bool(a), Value::Bool(b)) => a == b,
      (Value::Int(a), Value::Int(b)) => a == b,
      (Value::Float(a), Value::Float(b)) => a == b,
      (Value::Str(a), Value::Str(b)) => a == b,
      (Value::Object(a), Value::Object(b)) => same_object(a, b),
      (Value::Task(a), Value::Task(b)) => Arc::ptr_eq(&a.0, &b.0),
      _ => false,
    }
  }
}

impl std::fmt::Debug for Value {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Value::Null => write!(f, "null"),
      Value::Bool(v) => write!(f, "{v}"),
      Value::Int(v) => write!(f, "{v}"),
      Value::Float(v) => write!(f, "{v}"),
      Value::Str(v) => write!(f, "{v:?}"),
      Value::Object(obj) => write!(f, "{}@{:#X}", obj.type_info().name, Arc::as_ptr(obj) as *const () as usize),
      Value::Task(task) => write!(f, "{task:?}"),
    }
  }
}

pub fn same_object(a: &ObjectRef, b: &ObjectRef) -> bool { std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)) }

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
  pub name: String,
  pub type_name: String,
  pub is_static: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
  pub name: String,
  pub params: Vec<String>,
  pub returns: String,
  pub is_static: bool,
}

/// Reflective description of a host type. Members are kept in declaration order.
#[derive(Clone, Debug, Default)]
pub struct TypeInfo {
  pub name: String,
  pub parent: Option<Arc<TypeInfo>>,
  pub fields: Vec<FieldInfo>,
  pub methods: Vec<MethodInfo>,
  pub constructors: Vec<Vec<String>>,
}

impl TypeInfo {
  pub fn new(name: &str) -> Self { Self { name: name.to_string(), ..Default::default() } }

  pub fn with_parent(mut self, parent: Arc<TypeInfo>) -> Self {
    self.parent = Some(parent);
    self
  }

  pub fn field(mut self, name: &str, type_name: &str) -> Self {
    self.fields.push(FieldInfo { name: name.to_string(), type_name: type_name.to_string(), is_static: false });
    self
  }

  pub fn static_field(mut self, name: &str, type_name: &str) -> Self {
    self.fields.push(FieldInfo { name: name.to_string(), type_name: type_name.to_string(), is_static: true });
    self
  }

  pub fn method(mut self, name: &str, params: &[&str], returns: &str) -> Self {
    self.methods.push(MethodInfo { name: name.to_string(), params: params.iter().map(|p| p.to_string()).collect(), returns: returns.to_string(), is_static: false });
    self
  }

  pub fn static_method(mut self, name: &str, params: &[&str], returns: &str) -> Self {
    self.methods.push(MethodInfo { name: name.to_string(), params: params.iter().map(|p| p.to_string()).collect(), returns: returns.to_string(), is_static: true });
    self
  }

  pub fn constructor(mut self, params: &[&str]) -> Self {
    self.constructors.push(params.iter().map(|p| p.to_string()).collect());
    self
  }

  /// This type followed by its ancestors.
  pub fn hierarchy(&self) -> impl Iterator<Item = &TypeInfo> { std::iter::successors(Some(self), |t| t.parent.as_deref()) }

  pub fn is_a(&self, type_name: &str) -> bool { self.hierarchy().any(|t| t.name == type_name) }

  pub fn declared_field(&self, name: &str) -> Option<&FieldInfo> { self.fields.iter().find(|f| f.name == name) }

  pub fn declared_method(&self, name: &str, params: &[String]) -> Option<&MethodInfo> { self.methods.iter().find(|m| m.name == name && m.params == params) }

  /// First method with this name and parameter list anywhere in the hierarchy.
  pub fn find_method(&self, name: &str, params: &[String]) -> Option<&MethodInfo> { self.hierarchy().find_map(|t| t.declared_method(name, params)) }

  /// Non-static fields of the whole hierarchy, most derived first.
  pub fn instance_fields(&self) -> Vec<&FieldInfo> { self.hierarchy().flat_map(|t| t.fields.iter()).filter(|f| !f.is_static).collect() }
}

/// A live host object, reached only through reflection.
pub trait HostObject: Send + Sync {
  fn type_info(&self) -> Arc<TypeInfo>;

  fn get_field(&self, name: &str) -> Result<Value>;

  fn set_field(&self, name: &str, value: Value) -> Result<()>;

  fn invoke(&self, name: &str, args: &[Value]) -> Result<Value>;

  /// Lifts the declared visibility of a member so later accesses succeed.
  fn set_accessible(&self, _member: &str) -> Result<()> { Ok(()) }
}

/// Process-wide host services: type lookup, construction, input and the window.
pub trait HostRuntime: Send + Sync {
  /// Class objects expose static members through [`HostObject`].
  fn find_class(&self, name: &str) -> Option<ObjectRef>;

  fn instantiate(&self, type_info: &Arc<TypeInfo>, args: &[Value]) -> Result<ObjectRef>;

  fn is_key_down(&self, key: i32) -> bool;

  /// True when called from the host's cooperative main thread.
  fn on_host_thread(&self) -> bool { false }

  fn window_title(&self) -> Option<String> { None }

  fn set_window_title(&self, _title: &str) -> Result<()> { Err(HookError::host("window title is not exposed by this host")) }
}
