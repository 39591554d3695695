//! A simulated host: one cooperative main thread that drains a task queue and then renders a
//! frame through the hud object held by the root singleton, over and over.

#![allow(dead_code)]

use frame_hook::{
  HookError, HostObject, HostRuntime, ObjectRef, Result, Task, TypeInfo, Value,
  config::Config,
  coordinator::StrategyKind,
  overlay::{FrameContext, Overlay},
  patch::{Dialect, MethodSignature, PatchTable, TargetUnit},
};
use parking_lot::Mutex;
use std::{
  collections::{HashMap, HashSet, VecDeque},
  sync::{Arc, atomic::{AtomicBool, AtomicU64, Ordering}},
  thread::{self, JoinHandle, ThreadId},
  time::{Duration, Instant},
};

pub const BASE: usize = 0x1_4000_0000;

// push rbx; mov ebx, ecx; test ecx, ecx; je +7; mov eax, ebx; add eax, 1; pop rbx; ret;
// xor eax, eax; pop rbx; ret; int3 x8
pub const RENDER_BODY: [u8; 26] = [0x53, 0x89, 0xCB, 0x85, 0xC9, 0x74, 0x07, 0x89, 0xD8, 0x83, 0xC0, 0x01, 0x5B, 0xC3, 0x31, 0xC0, 0x5B, 0xC3, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC];

type Behavior = Arc<dyn Fn(&SimObject, &str, &[Value]) -> Result<Value> + Send + Sync>;

pub struct SimObject {
  info: Arc<TypeInfo>,
  values: Mutex<HashMap<String, Value>>,
  behavior: Option<Behavior>,
}

impl SimObject {
  pub fn new(info: Arc<TypeInfo>, behavior: Option<Behavior>) -> Arc<Self> { Arc::new(Self { info, values: Mutex::new(HashMap::new()), behavior }) }

  pub fn with(self: Arc<Self>, name: &str, value: Value) -> Arc<Self> {
    self.values.lock().insert(name.to_string(), value);
    self
  }

  pub fn snapshot(&self) -> HashMap<String, Value> { self.values.lock().clone() }
}

impl HostObject for SimObject {
  fn type_info(&self) -> Arc<TypeInfo> { Arc::clone(&self.info) }

  fn get_field(&self, name: &str) -> Result<Value> {
    if self.info.hierarchy().any(|t| t.declared_field(name).is_some()) { Ok(self.values.lock().get(name).cloned().unwrap_or_default()) } else { Err(HookError::host(format!("{} has no field {name}", self.info.name))) }
  }

  fn set_field(&self, name: &str, value: Value) -> Result<()> {
    if !self.info.hierarchy().any(|t| t.declared_field(name).is_some()) {
      return Err(HookError::host(format!("{} has no field {name}", self.info.name)));
    }
    self.values.lock().insert(name.to_string(), value);
    Ok(())
  }

  fn invoke(&self, name: &str, args: &[Value]) -> Result<Value> {
    match &self.behavior {
      Some(behavior) => behavior(self, name, args),
      None => Err(HookError::host(format!("{} has no method {name}", self.info.name))),
    }
  }
}

pub fn gui_base_type() -> Arc<TypeInfo> {
  let gui = Arc::new(TypeInfo::new("Gui").field("zLevel", "float"));
  Arc::new(TypeInfo::new("GuiBase").with_parent(gui).field("mc", "ave").field("updateCounter", "int").field("title", "String").static_field("ICONS", "String").method("a", &["float"], "void").method("b", &[], "int").constructor(&["ave"]))
}

pub fn root_type() -> Arc<TypeInfo> { Arc::new(TypeInfo::new("ave").field("h", "bew").field("q", "GuiBase").field("k", "avn").method("a", &["java.lang.Runnable"], "ListenableFuture")) }

pub struct SimHost {
  root: Arc<SimObject>,
  root_class: Arc<SimObject>,
  queue: Arc<Mutex<VecDeque<Task>>>,
  events: Arc<Mutex<Vec<String>>>,
  in_frame: Arc<AtomicBool>,
  frames: AtomicU64,
  keys: Mutex<HashSet<i32>>,
  title: Mutex<Option<String>>,
  host_thread: Mutex<Option<ThreadId>>,
  stalled: AtomicBool,
  stop: AtomicBool,
  main: Mutex<Option<JoinHandle<()>>>,
}

impl SimHost {
  pub fn new() -> Arc<Self> {
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let events = Arc::new(Mutex::new(Vec::new()));

    let q = Arc::clone(&queue);
    let root = SimObject::new(
      root_type(),
      Some(Arc::new(move |_: &SimObject, name: &str, args: &[Value]| match (name, args) {
        ("a", [Value::Task(task)]) => {
          q.lock().push_back(task.clone());
          Ok(Value::Null)
        }
        _ => Err(HookError::host(format!("ave.{name} not callable"))),
      })),
    );

    let hud = Self::gui(&events).with("mc", Value::Object(root.clone())).with("updateCounter", Value::Int(0)).with("title", Value::Str("HUD".to_string())).with("zLevel", Value::Float(0.0));
    root.values.lock().insert("q".to_string(), Value::Object(hud));
    root.values.lock().insert("h".to_string(), Value::Str("player".to_string()));

    let r = Arc::clone(&root);
    let root_class = SimObject::new(Arc::new(TypeInfo::new("ave").static_method("A", &[], "ave")), Some(Arc::new(move |_: &SimObject, name: &str, _: &[Value]| if name == "A" { Ok(Value::Object(r.clone())) } else { Err(HookError::host(name.to_string())) })));

    Arc::new(Self {
      root,
      root_class,
      queue,
      events,
      in_frame: Arc::new(AtomicBool::new(false)),
      frames: AtomicU64::new(0),
      keys: Mutex::new(HashSet::new()),
      title: Mutex::new(Some("Minecraft 1.8.9".to_string())),
      host_thread: Mutex::new(None),
      stalled: AtomicBool::new(false),
      stop: AtomicBool::new(false),
      main: Mutex::new(None),
    })
  }

  fn gui(events: &Arc<Mutex<Vec<String>>>) -> Arc<SimObject> {
    let events = Arc::clone(events);
    SimObject::new(
      gui_base_type(),
      Some(Arc::new(move |obj: &SimObject, name: &str, _: &[Value]| match name {
        "a" => {
          events.lock().push("original".to_string());
          let mut values = obj.values.lock();
          let counter = values.get("updateCounter").and_then(Value::as_float).unwrap_or_default() as i64;
          values.insert("updateCounter".to_string(), Value::Int(counter + 1));
          Ok(Value::Null)
        }
        "b" => Ok(Value::Int(7)),
        _ => Err(HookError::host(format!("GuiBase.{name} not callable"))),
      })),
    )
  }

  /// Starts the cooperative main thread.
  pub fn start(self: &Arc<Self>) {
    let host = Arc::clone(self);
    let handle = thread::Builder::new()
      .name("sim-main".to_string())
      .spawn(move || {
        *host.host_thread.lock() = Some(thread::current().id());
        while !host.stop.load(Ordering::Acquire) {
          host.run_pending();
          host.render_frame();
          thread::sleep(Duration::from_millis(2));
        }
      })
      .unwrap();
    *self.main.lock() = Some(handle);
  }

  pub fn stop(&self) {
    self.stop.store(true, Ordering::Release);
    if let Some(handle) = self.main.lock().take() {
      handle.join().unwrap();
    }
  }

  /// Drains the task queue unless stalled. Tasks never run while a frame is in progress.
  pub fn run_pending(&self) {
    if self.stalled.load(Ordering::Acquire) {
      return;
    }
    loop {
      let Some(task) = self.queue.lock().pop_front() else { break };
      assert!(!self.in_frame.load(Ordering::Acquire), "task ran during a frame");
      task.run();
    }
  }

  pub fn render_frame(&self) {
    self.in_frame.store(true, Ordering::Release);
    if let Ok(Value::Object(hud)) = self.root.get_field("q") {
      let _ = hud.invoke("a", &[Value::Float(0.5)]);
    }
    self.in_frame.store(false, Ordering::Release);
    self.frames.fetch_add(1, Ordering::AcqRel);
  }

  pub fn set_stalled(&self, stalled: bool) { self.stalled.store(stalled, Ordering::Release); }

  pub fn press(&self, key: i32) { self.keys.lock().insert(key); }

  pub fn release(&self, key: i32) { self.keys.lock().remove(&key); }

  pub fn root(&self) -> ObjectRef { self.root.clone() }

  pub fn hud(&self) -> ObjectRef { self.root.get_field("q").unwrap().as_object().unwrap().clone() }

  pub fn events(&self) -> Vec<String> { self.events.lock().clone() }

  pub fn event_sink(&self) -> Arc<Mutex<Vec<String>>> { Arc::clone(&self.events) }

  pub fn frames(&self) -> u64 { self.frames.load(Ordering::Acquire) }

  pub fn in_frame(&self) -> bool { self.in_frame.load(Ordering::Acquire) }

  pub fn host_thread(&self) -> Option<ThreadId> { *self.host_thread.lock() }

  pub fn title(&self) -> Option<String> { self.title.lock().clone() }
}

impl HostRuntime for SimHost {
  fn find_class(&self, name: &str) -> Option<ObjectRef> { (name == "ave").then(|| self.root_class.clone() as ObjectRef) }

  fn instantiate(&self, type_info: &Arc<TypeInfo>, args: &[Value]) -> Result<ObjectRef> {
    if !type_info.is_a("GuiBase") {
      return Err(HookError::host(format!("cannot construct {}", type_info.name)));
    }
    let gui = Self::gui(&self.events);
    if let Some(Value::Object(mc)) = args.first() {
      gui.values.lock().insert("mc".to_string(), Value::Object(mc.clone()));
    }
    Ok(gui)
  }

  fn is_key_down(&self, key: i32) -> bool { self.keys.lock().contains(&key) }

  fn on_host_thread(&self) -> bool { self.host_thread().is_some_and(|id| id == thread::current().id()) }

  fn window_title(&self) -> Option<String> { self.title() }

  fn set_window_title(&self, title: &str) -> Result<()> {
    *self.title.lock() = Some(title.to_string());
    Ok(())
  }
}

/// Records each frame it sees into the host's event log.
pub struct Recorder {
  pub name: &'static str,
  pub events: Arc<Mutex<Vec<String>>>,
}

impl Overlay for Recorder {
  fn name(&self) -> &str { self.name }

  fn render(&self, frame: &FrameContext<'_>) -> Result<()> {
    let dialect = frame.dialect.map(|d| format!("@{}", d.name)).unwrap_or_default();
    self.events.lock().push(format!("overlay:{}{dialect}", self.name));
    Ok(())
  }
}

pub fn patch_table() -> PatchTable {
  PatchTable {
    point: "frame_render".to_string(),
    units: vec![TargetUnit { name: "avo".to_string(), dialect: "notch".to_string() }],
    methods: vec![MethodSignature { name: "renderGameOverlay".to_string(), pattern: "53 89 CB 85 C9".to_string(), max_len: 0x40 }],
    dialects: vec![Dialect::new("notch").with_symbol("font", "k")],
  }
}

pub fn config(strategy: StrategyKind) -> Config {
  let mut config = Config::default();
  config.strategy = strategy;
  config.timings.tick_ms = 5;
  config.timings.grace_ms = 20;
  config.timings.shutdown_ms = 1000;
  config.patch = patch_table();
  config
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    thread::sleep(Duration::from_millis(2));
  }
  condition()
}
