//! Lifecycle coordination: owns the injection context, picks the hook strategy for the frame
//! render point and sequences teardown.
//!
//! `inactive -> activating -> active -> tearing_down -> inactive`. Everything that touches host
//! state is funneled through the scheduler bridge. The tick thread only schedules, the teardown
//! thread only waits out the grace period and then shuts down.

use crate::{
  bridge::TeardownBridge,
  config::{Config, logical},
  error::{HookError, Result},
  host::{HostRuntime, ObjectRef, Value},
  input::Keybinds,
  ledger::{MutationLedger, RestoreReport},
  overlay::{FrameContext, OverlayRegistry},
  patch::{CodeLoader, CodeTransformer, Dialect, FrameLogic, Memory, Trigger},
  resolver::{ResolvedHandle, Resolver},
  scheduler::{AwaitStatus, SchedulerBridge},
  substitution::{INTERCEPTION_POINT, SubstitutionHook},
};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
  collections::HashMap,
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{Arc, Weak, atomic::{AtomicBool, Ordering}, mpsc},
  thread::{self, JoinHandle},
  time::Duration,
};

const TICK_JOIN_BOUND: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
  Substitution,
  Transformation,
}

impl std::fmt::Display for StrategyKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StrategyKind::Substitution => write!(f, "substitution"),
      StrategyKind::Transformation => write!(f, "transformation"),
    }
  }
}

/// State of one active interception point.
#[derive(Clone, Debug)]
pub struct HookRecord {
  point: String,
  strategy: StrategyKind,
  handles: Vec<ResolvedHandle>,
  triggered: Arc<AtomicBool>,
}

impl HookRecord {
  pub fn new(point: &str, strategy: StrategyKind, handles: Vec<ResolvedHandle>) -> Self { Self { point: point.to_string(), strategy, handles, triggered: Arc::new(AtomicBool::new(false)) } }

  pub fn point(&self) -> &str { &self.point }

  pub fn strategy(&self) -> StrategyKind { self.strategy }

  pub fn handles(&self) -> &[ResolvedHandle] { &self.handles }

  /// Whether the hook has run at least once.
  pub fn is_triggered(&self) -> bool { self.triggered.load(Ordering::Acquire) }

  /// Shared with whatever observes the hook firing.
  pub fn trigger_flag(&self) -> Arc<AtomicBool> { Arc::clone(&self.triggered) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
  Inactive,
  Activating,
  Active,
  TearingDown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
  pub restore: RestoreReport,
  /// The host thread did not run the restore within the shutdown bound.
  pub timed_out: bool,
  pub unloaded: bool,
}

/// Everything one injection owns. Dropped on the host thread it drains whatever is left in the
/// ledger, anywhere else the leftovers stay with the restore already queued on the host.
pub struct InjectionContext {
  root: ObjectRef,
  resolver: Arc<Resolver>,
  ledger: Arc<MutationLedger>,
  scheduler: SchedulerBridge,
  overlays: Arc<OverlayRegistry>,
  keybinds: Arc<Keybinds>,
}

impl InjectionContext {
  /// Resolves the root instance and the host's task queue.
  pub fn open(config: &Config, runtime: Arc<dyn HostRuntime>, overlays: Arc<OverlayRegistry>) -> Result<Self> {
    let resolver = Arc::new(Resolver::new(config.candidates.iter().cloned()));
    let root = resolver.resolve_root(logical::ROOT, runtime.as_ref())?.instance()?;
    let scheduler = SchedulerBridge::resolve(&resolver, &root, runtime)?;

    Ok(Self { root, resolver, ledger: Arc::new(MutationLedger::new()), scheduler, overlays, keybinds: Arc::new(Keybinds::new()) })
  }

  pub fn root(&self) -> &ObjectRef { &self.root }

  pub fn resolver(&self) -> &Arc<Resolver> { &self.resolver }

  pub fn ledger(&self) -> &Arc<MutationLedger> { &self.ledger }

  pub fn scheduler(&self) -> &SchedulerBridge { &self.scheduler }

  pub fn overlays(&self) -> &Arc<OverlayRegistry> { &self.overlays }

  pub fn keybinds(&self) -> &Arc<Keybinds> { &self.keybinds }
}

impl Drop for InjectionContext {
  fn drop(&mut self) {
    if self.ledger.is_empty() {
      return;
    }
    if self.scheduler.on_host_thread() {
      warn!("[Coordinator] Context dropped with {} pending restore(s), draining here", self.ledger.len());
      self.ledger.restore_all();
    } else {
      warn!("[Coordinator] Context dropped with {} pending restore(s), left to the host thread", self.ledger.len());
    }
  }
}

struct ActiveHook {
  record: HookRecord,
  ledger_entry: String,
  transformer: Option<CodeTransformer>,
}

struct CoordinatorState {
  lifecycle: LifecycleState,
  hooks: HashMap<String, ActiveHook>,
  teardown_pending: bool,
}

struct TickThread {
  stop: Arc<AtomicBool>,
  done: mpsc::Receiver<()>,
  handle: JoinHandle<()>,
}

impl TickThread {
  fn spawn(period: Duration, scheduler: SchedulerBridge, keybinds: Arc<Keybinds>, runtime: Arc<dyn HostRuntime>) -> Result<Self> {
    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done) = mpsc::channel();
    let s = Arc::clone(&stop);

    let handle = thread::Builder::new().name("frame_hook-tick".to_string()).spawn(move || {
      while !s.load(Ordering::Acquire) {
        thread::sleep(period);
        if s.load(Ordering::Acquire) {
          break;
        }
        let keybinds = Arc::clone(&keybinds);
        let runtime = Arc::clone(&runtime);
        if let Err(e) = scheduler.schedule(move || {
          keybinds.tick(|key| runtime.is_key_down(key));
        }) {
          warn!("[Coordinator] Tick scheduling failed: {e}");
        }
      }
      let _ = done_tx.send(());
    })?;

    Ok(Self { stop, done, handle })
  }

  fn stop(self, bound: Duration) {
    self.stop.store(true, Ordering::Release);
    match self.done.recv_timeout(bound) {
      Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
        let _ = self.handle.join();
        debug!("[Coordinator] Tick thread stopped");
      }
      Err(mpsc::RecvTimeoutError::Timeout) => warn!("[Coordinator] Tick thread did not stop within {bound:?}, detaching it"),
    }
  }
}

struct CoordinatorInner {
  config: Config,
  runtime: Arc<dyn HostRuntime>,
  bridge: TeardownBridge,
  overlays: Arc<OverlayRegistry>,
  state: Mutex<CoordinatorState>,
  context: RwLock<Option<Arc<InjectionContext>>>,
  tick: Mutex<Option<TickThread>>,
  code: RwLock<Option<(Arc<dyn CodeLoader>, Arc<dyn Memory>)>>,
  unload: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Runs `f` on the host thread and hands its result back.
fn on_host<T: Send + 'static>(scheduler: &SchedulerBridge, what: &str, bound: Duration, f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
  let slot = Arc::new(Mutex::new(None));
  let s = Arc::clone(&slot);

  match scheduler.schedule_and_await(move || *s.lock() = Some(f()), bound)? {
    AwaitStatus::Completed => slot.lock().take().unwrap_or_else(|| Err(HookError::host(format!("{what} panicked on the host thread")))),
    AwaitStatus::TimedOut => Err(HookError::TimedOut { what: what.to_string(), after: bound }),
    AwaitStatus::Dropped => Err(HookError::host(format!("{what} was dropped by the host"))),
  }
}

/// Host tasks queued by an activation that has since failed or been torn down must not run.
fn ensure_live(weak: &Weak<CoordinatorInner>, what: &str) -> Result<()> {
  let Some(inner) = weak.upgrade() else { return Err(HookError::InvalidState(format!("{what}: coordinator is gone"))) };
  let lifecycle = inner.state.lock().lifecycle;
  match lifecycle {
    LifecycleState::Activating | LifecycleState::Active => Ok(()),
    other => {
      debug!("[Coordinator] Skipping {what}, coordinator is {other:?}");
      Err(HookError::InvalidState(format!("{what} skipped while {other:?}")))
    }
  }
}

fn mutate_title(runtime: &Arc<dyn HostRuntime>, ledger: &MutationLedger, suffix: &str) -> Result<()> {
  let Some(title) = runtime.window_title() else {
    debug!("[Coordinator] Host has no window title");
    return Ok(());
  };
  if title.ends_with(suffix) {
    return Ok(());
  }

  runtime.set_window_title(&format!("{title}{suffix}"))?;
  let runtime = Arc::clone(runtime);
  ledger.register("window_title", move || runtime.set_window_title(&title));
  Ok(())
}

/// Handle to the coordinator. Cheap to clone, all clones drive the same lifecycle.
#[derive(Clone)]
pub struct Coordinator {
  inner: Arc<CoordinatorInner>,
}

impl Coordinator {
  pub fn new(config: Config, runtime: Arc<dyn HostRuntime>) -> Self {
    let bridge = TeardownBridge::new(&config.bridge_key);
    Self {
      inner: Arc::new(CoordinatorInner {
        config,
        runtime,
        bridge,
        overlays: Arc::new(OverlayRegistry::new(true)),
        state: Mutex::new(CoordinatorState { lifecycle: LifecycleState::Inactive, hooks: HashMap::new(), teardown_pending: false }),
        context: RwLock::new(None),
        tick: Mutex::new(None),
        code: RwLock::new(None),
        unload: Mutex::new(None),
      }),
    }
  }

  fn from_weak(weak: &Weak<CoordinatorInner>) -> Option<Self> { weak.upgrade().map(|inner| Self { inner }) }

  pub fn config(&self) -> &Config { &self.inner.config }

  pub fn state(&self) -> LifecycleState { self.inner.state.lock().lifecycle }

  pub fn bridge(&self) -> &TeardownBridge { &self.inner.bridge }

  /// Overlays survive activations but are disabled on every teardown.
  pub fn overlays(&self) -> &Arc<OverlayRegistry> { &self.inner.overlays }

  pub fn context(&self) -> Option<Arc<InjectionContext>> { self.inner.context.read().clone() }

  pub fn hook(&self, point: &str) -> Option<HookRecord> { self.inner.state.lock().hooks.get(point).map(|h| h.record.clone()) }

  pub fn transformer(&self) -> Option<CodeTransformer> { self.inner.state.lock().hooks.values().find_map(|h| h.transformer.clone()) }

  /// Required by the transformation strategy.
  pub fn attach_code_loader(&self, loader: Arc<dyn CodeLoader>, memory: Arc<dyn Memory>) { *self.inner.code.write() = Some((loader, memory)); }

  /// The irreversible unload primitive, run last on shutdown.
  pub fn on_unload(&self, unload: impl FnOnce() + Send + 'static) { *self.inner.unload.lock() = Some(Box::new(unload)); }

  fn bound(&self) -> Duration { self.inner.config.timings.shutdown() }

  /// Resolves the host, publishes the bridge and installs the configured strategy.
  pub fn activate(&self) -> Result<HookRecord> {
    {
      let mut state = self.inner.state.lock();
      if state.lifecycle != LifecycleState::Inactive {
        return Err(HookError::InvalidState(format!("cannot activate while {:?}", state.lifecycle)));
      }
      state.lifecycle = LifecycleState::Activating;
    }
    info!("[Coordinator] Activating...");

    match self.bring_up() {
      Ok(record) => {
        let pending = {
          let mut state = self.inner.state.lock();
          state.lifecycle = LifecycleState::Active;
          std::mem::take(&mut state.teardown_pending)
        };
        info!("[Coordinator] Active, {} owns {}", record.strategy(), record.point());
        if pending {
          info!("[Coordinator] Teardown was requested during activation");
          self.request_teardown();
        }
        Ok(record)
      }
      Err(e) => {
        error!("[Coordinator] Activation failed: {e}");
        self.inner.state.lock().lifecycle = LifecycleState::TearingDown;
        self.dismantle();
        Err(e)
      }
    }
  }

  fn bring_up(&self) -> Result<HookRecord> {
    let inner = &self.inner;
    let context = Arc::new(InjectionContext::open(&inner.config, Arc::clone(&inner.runtime), Arc::clone(&inner.overlays))?);
    *inner.context.write() = Some(Arc::clone(&context));
    context.overlays.set_visible(true);

    let runtime = Arc::clone(&inner.runtime);
    let ledger = Arc::clone(&context.ledger);
    let suffix = inner.config.window_title_suffix.clone();
    let weak = Arc::downgrade(inner);
    if let Err(e) = on_host(&context.scheduler, "window title", self.bound(), move || {
      ensure_live(&weak, "window title")?;
      mutate_title(&runtime, &ledger, &suffix)
    }) {
      warn!("[Coordinator] Window title left alone: {e}");
    }

    let weak = Arc::downgrade(inner);
    inner.bridge.publish(move || {
      if let Some(coordinator) = Coordinator::from_weak(&weak) {
        coordinator.request_teardown();
      }
    })?;

    self.bind_keys(&context);
    let record = self.install(inner.config.strategy)?;

    let tick = TickThread::spawn(inner.config.timings.tick(), context.scheduler.clone(), Arc::clone(&context.keybinds), Arc::clone(&inner.runtime))?;
    *inner.tick.lock() = Some(tick);
    Ok(record)
  }

  fn bind_keys(&self, context: &InjectionContext) {
    let keys = &self.inner.config.keys;

    let weak = Arc::downgrade(&self.inner);
    context.keybinds.register(keys.unload, "Unload", move || {
      if let Some(coordinator) = Coordinator::from_weak(&weak) {
        coordinator.request_teardown();
      }
    });

    let overlays = Arc::clone(&context.overlays);
    context.keybinds.register(keys.toggle_overlay, "Toggle GUI", move || {
      let visible = overlays.toggle_visible();
      info!("[Coordinator] Overlays {}", if visible { "shown" } else { "hidden" });
    });
  }

  /// Installs `strategy` at the frame render point. An incumbent hook there is removed first.
  pub fn install(&self, strategy: StrategyKind) -> Result<HookRecord> {
    let lifecycle = self.state();
    if !matches!(lifecycle, LifecycleState::Activating | LifecycleState::Active) {
      return Err(HookError::InvalidState(format!("cannot install while {lifecycle:?}")));
    }
    let context = self.context().ok_or_else(|| HookError::InvalidState("no injection context".to_string()))?;

    let incumbent = self.inner.state.lock().hooks.remove(INTERCEPTION_POINT);
    if let Some(incumbent) = incumbent {
      let conflict = HookError::InstallConflict { point: INTERCEPTION_POINT.to_string(), owner: incumbent.record.strategy().to_string() };
      warn!("[Coordinator] {conflict}, removing it first");
      self.uninstall(&context, incumbent)?;
    }

    let hook = match strategy {
      StrategyKind::Substitution => self.install_substitution(&context)?,
      StrategyKind::Transformation => self.install_transformation(&context)?,
    };
    let record = hook.record.clone();
    self.inner.state.lock().hooks.insert(INTERCEPTION_POINT.to_string(), hook);
    Ok(record)
  }

  fn uninstall(&self, context: &InjectionContext, hook: ActiveHook) -> Result<()> {
    let ledger = Arc::clone(&context.ledger);
    let entry = hook.ledger_entry;
    info!("[Coordinator] Removing {} hook", hook.record.strategy());
    on_host(&context.scheduler, "hook removal", self.bound(), move || ledger.restore(&entry).unwrap_or(Ok(())))
  }

  fn install_substitution(&self, context: &InjectionContext) -> Result<ActiveHook> {
    let hook = SubstitutionHook::new(Arc::clone(&self.inner.runtime), Arc::clone(&context.resolver), Arc::clone(&context.ledger), Arc::clone(&context.overlays), vec![Value::Object(Arc::clone(&context.root))]);
    let resolver = Arc::clone(&context.resolver);
    let root = Arc::clone(&context.root);
    let field = self.inner.config.hook_field.clone();

    let ledger_entry = format!("substitution:{field}");
    let weak = Arc::downgrade(&self.inner);
    let record = on_host(&context.scheduler, "substitution install", self.bound(), move || {
      ensure_live(&weak, "substitution install")?;
      let handle = resolver.resolve(&field, &root)?;
      hook.install(&handle)
    })?;

    Ok(ActiveHook { record, ledger_entry, transformer: None })
  }

  fn install_transformation(&self, context: &InjectionContext) -> Result<ActiveHook> {
    let (loader, memory) = self.inner.code.read().clone().ok_or_else(|| HookError::InvalidState("no code loader attached".to_string()))?;

    let runtime = Arc::clone(&self.inner.runtime);
    let key = self.inner.config.keys.emergency_unload;
    let trigger: Trigger = Arc::new(move || runtime.is_key_down(key));

    let overlays = Arc::clone(&context.overlays);
    let logic: FrameLogic = Arc::new(move |dialect: &Dialect| {
      overlays.dispatch(&FrameContext { partial_ticks: 0.0, dialect: Some(dialect) });
    });

    let transformer = CodeTransformer::new(self.inner.config.patch.clone(), memory, loader, self.inner.bridge.clone(), trigger, logic);
    let record = HookRecord::new(INTERCEPTION_POINT, StrategyKind::Transformation, Vec::new());

    // Serialized against teardown through the state lock.
    let on_first = {
      let weak = Arc::downgrade(&self.inner);
      let triggered = record.trigger_flag();
      let t = transformer.clone();
      move || {
        let Some(inner) = weak.upgrade() else { return };
        let state = inner.state.lock();
        if matches!(state.lifecycle, LifecycleState::Activating | LifecycleState::Active) {
          triggered.store(true, Ordering::Release);
          t.retire_discovery();
        } else {
          debug!("[Coordinator] First activation arrived during {:?}, ignored", state.lifecycle);
        }
      }
    };

    // The inverse is registered by the host task itself, so a late run is still undone.
    let ledger_entry = format!("transformation:{INTERCEPTION_POINT}");
    let weak = Arc::downgrade(&self.inner);
    let ledger = Arc::clone(&context.ledger);
    let entry = ledger_entry.clone();
    let t = transformer.clone();
    on_host(&context.scheduler, "transformer activation", self.bound(), move || {
      ensure_live(&weak, "transformer activation")?;
      t.activate(on_first)?;
      ledger.register(&entry, move || t.deactivate());
      Ok(())
    })?;

    Ok(ActiveHook { record, ledger_entry, transformer: Some(transformer) })
  }

  /// Asks for a teardown after the grace period, from any thread including the host's. Returns
  /// whether the request was taken.
  pub fn request_teardown(&self) -> bool {
    {
      let mut state = self.inner.state.lock();
      if state.teardown_pending {
        return false;
      }
      match state.lifecycle {
        LifecycleState::Active | LifecycleState::Activating => state.teardown_pending = true,
        other => {
          debug!("[Coordinator] Teardown requested while {other:?}, ignored");
          return false;
        }
      }
      if state.lifecycle == LifecycleState::Activating {
        return true;
      }
    }

    let weak = Arc::downgrade(&self.inner);
    let grace = self.inner.config.timings.grace();
    let spawned = thread::Builder::new().name("frame_hook-teardown".to_string()).spawn(move || {
      thread::sleep(grace);
      let Some(coordinator) = Coordinator::from_weak(&weak) else { return };
      if let Err(e) = coordinator.shutdown() {
        error!("[Coordinator] Teardown failed: {e}");
      }
    });

    match spawned {
      Ok(_) => {
        info!("[Coordinator] Teardown in {grace:?}");
        true
      }
      Err(e) => {
        error!("[Coordinator] Failed to spawn the teardown thread: {e}");
        self.inner.state.lock().teardown_pending = false;
        false
      }
    }
  }

  /// Restores everything on the host thread within the shutdown bound, releases the context and
  /// the bridge, then runs the unload primitive. A timed out restore does not stop the rest.
  pub fn shutdown(&self) -> Result<TeardownReport> {
    {
      let mut state = self.inner.state.lock();
      match state.lifecycle {
        LifecycleState::Active => state.lifecycle = LifecycleState::TearingDown,
        LifecycleState::Inactive => return Ok(TeardownReport::default()),
        other => return Err(HookError::InvalidState(format!("cannot shut down while {other:?}"))),
      }
    }
    info!("[Coordinator] Tearing down...");

    let mut report = self.dismantle();

    let unload = self.inner.unload.lock().take();
    if let Some(unload) = unload {
      info!("[Coordinator] Unloading");
      if catch_unwind(AssertUnwindSafe(unload)).is_err() {
        error!("[Coordinator] Unload primitive panicked");
      }
      report.unloaded = true;
    }
    Ok(report)
  }

  fn dismantle(&self) -> TeardownReport {
    let inner = &self.inner;
    let mut report = TeardownReport::default();

    let tick = inner.tick.lock().take();
    if let Some(tick) = tick {
      tick.stop(TICK_JOIN_BOUND);
    }

    let hooks = std::mem::take(&mut inner.state.lock().hooks);
    for (point, hook) in &hooks {
      debug!("[Coordinator] Releasing {} hook at {point} (triggered: {})", hook.record.strategy(), hook.record.is_triggered());
    }

    let context = inner.context.write().take();
    if let Some(context) = context {
      let ledger = Arc::clone(&context.ledger);
      let slot = Arc::new(Mutex::new(RestoreReport::default()));
      let s = Arc::clone(&slot);

      match context.scheduler.schedule_and_await(move || *s.lock() = ledger.restore_all(), self.bound()) {
        Ok(AwaitStatus::Completed) => report.restore = std::mem::take(&mut *slot.lock()),
        Ok(status) => {
          report.timed_out = true;
          warn!("[Coordinator] Restore {status:?} within {:?}, proceeding anyway", self.bound());
        }
        Err(e) => {
          report.timed_out = true;
          error!("[Coordinator] Could not schedule the restore: {e}");
        }
      }

      context.keybinds.clear();
      context.overlays.shutdown();
      context.resolver.invalidate();
    }

    inner.bridge.clear();
    {
      let mut state = inner.state.lock();
      state.lifecycle = LifecycleState::Inactive;
      state.teardown_pending = false;
    }
    info!("[Coordinator] Inactive");
    report
  }
}
